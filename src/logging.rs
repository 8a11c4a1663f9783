// Copyright Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! Builds the [`slog::Logger`] threaded explicitly through every other module. There is no global
//! or thread-local logger anywhere in this crate; the entry point (out of scope for this crate)
//! builds one root logger with [`build_logger`] and passes it down.

use slog::{Drain, Level, LevelFilter, Logger};

/// Logging configuration: verbosity and rendering.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LoggingConfig {
    /// Minimum level emitted.
    pub level: Level,
    /// Whether log records are rendered as newline-delimited JSON instead of the compact console
    /// format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::Info,
            json: false,
        }
    }
}

/// Builds a [`Logger`] from `config`, writing to stderr.
///
/// Compact console output is used by default, matching the original's plain-text log lines;
/// `json: true` switches to structured JSON records for log-aggregation pipelines. Both drains are
/// wrapped in [`slog_async::Async`] so logging never blocks the calling thread on I/O.
pub fn build_logger(config: &LoggingConfig) -> Logger {
    let drain = if config.json {
        let json = slog_json::Json::new(std::io::stderr())
            .add_default_keys()
            .build()
            .fuse();
        slog_async::Async::new(LevelFilter::new(json, config.level).fuse())
            .build()
            .fuse()
    } else {
        let decorator = slog_term::TermDecorator::new().stderr().build();
        let term = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(LevelFilter::new(term, config.level).fuse())
            .build()
            .fuse()
    };
    Logger::root(drain, slog::o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_logger_does_not_panic_for_either_format() {
        let _ = build_logger(&LoggingConfig::default());
        let _ = build_logger(&LoggingConfig {
            level: Level::Debug,
            json: true,
        });
    }
}
