// Copyright Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! Error types shared across the engine.
//!
//! Every fallible operation returns [`Result`](type.Result.html), whose error is an [`Error`]
//! wrapping one of the [`ErrorKind`] variants below. The kinds mirror the failure classes the
//! engine distinguishes between fatal and best-effort handling: see `LifecycleDriver` for which
//! kinds are tolerated during `scale`/`stop` and which always abort the event.

use failure::{Backtrace, Context, Fail};
use std::fmt::{self, Display};

/// Convenience alias used throughout the crate.
pub type Result<T> = ::std::result::Result<T, Error>;

/// The error type returned by every fallible operation in this crate.
#[derive(Debug)]
pub struct Error {
    inner: Context<ErrorKind>,
}

/// The distinct classes of failure the engine can produce.
#[derive(Clone, Debug, Eq, PartialEq, Fail)]
pub enum ErrorKind {
    /// The operator-policy document at `path` could not be read or parsed.
    #[fail(display = "failed to load operator policy from '{}': {}", path, detail)]
    ConfigLoad {
        /// Path the document was read from.
        path: String,
        /// Underlying reason (I/O or parse error message).
        detail: String,
    },

    /// A user is not permitted to use the given network or network-policy.
    #[fail(display = "user '{}' is not allowed to use {}", user, resource)]
    AuthzDenied {
        /// The OS user identity the check was performed for.
        user: String,
        /// A human-readable description of the denied resource, e.g. `network 'production'`.
        resource: String,
    },

    /// Services within one composition disagree on tenant or network.
    #[fail(display = "composition invariant violated: {}", detail)]
    CompositionInvariant {
        /// Description of the mismatch.
        detail: String,
    },

    /// A named network-policy could not be parsed into a rule list.
    #[fail(display = "failed to parse network-policy '{}': {}", policy, detail)]
    PolicyParse {
        /// Name of the offending policy.
        policy: String,
        /// Description of the parse failure.
        detail: String,
    },

    /// Image or DNS-container inspection via the container runtime failed.
    #[fail(display = "container-runtime inspection failed: {}", detail)]
    RuntimeInspect {
        /// Description of the failure.
        detail: String,
    },

    /// A control-plane REST call failed.
    #[fail(display = "control-plane operation on {} failed: {}", object, detail)]
    ControlPlane {
        /// Identity of the object being mutated, e.g. `policy 'shop_web-in'`.
        object: String,
        /// The remote error message.
        detail: String,
    },
}

impl ErrorKind {
    /// Whether this kind is tolerated (logged and continued) when it occurs during a `scale`
    /// event or during object deletion, as opposed to always aborting the lifecycle event.
    pub fn is_tolerable(&self) -> bool {
        matches!(self, ErrorKind::RuntimeInspect { .. } | ErrorKind::ControlPlane { .. })
    }
}

impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

impl Error {
    /// Returns the [`ErrorKind`] this error carries.
    pub fn kind(&self) -> &ErrorKind {
        self.inner.get_context()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Error {
        Error { inner }
    }
}
