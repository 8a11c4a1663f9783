// Copyright Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! Small helper shared by the container-runtime client: `shiplift`'s async surface returns
//! `futures` 0.1 futures, while the rest of this crate is synchronous. [`FutureExt::sync`] drives
//! one future to completion on a throwaway single-threaded runtime, matching the blocking call
//! style used everywhere else in the engine.

use futures::Future;
use tokio::runtime::Runtime;

/// Extension trait adding a blocking `.sync()` to any `futures` 0.1 future.
pub trait FutureExt: Future + Sized {
    /// Runs this future to completion on a fresh single-use runtime and returns its result.
    fn sync(self) -> Result<Self::Item, Self::Error>;
}

impl<F: Future> FutureExt for F {
    fn sync(self) -> Result<Self::Item, Self::Error> {
        Runtime::new()
            .expect("failed to start tokio runtime for blocking container-runtime call")
            .block_on(self)
    }
}
