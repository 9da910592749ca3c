//! Error kinds returned by the manager, the scheduler and drivers.
//!
//! Success is `Ok(..)`. Every failure is one of the [`AsynError`] kinds; the
//! human-readable detail travels separately in the error buffer of the
//! [`AsynUser`](crate::AsynUser) that made the call, so the error value itself
//! stays `Copy` and cheap to compare.

use thiserror::Error;

/// Failure kinds of the asyn core.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsynError {
    /// An operation or a lock acquisition exceeded its deadline.
    #[error("timeout")]
    Timeout,
    /// The port or device is not connected.
    #[error("disconnected")]
    Disconnected,
    /// The port or device is disabled.
    #[error("disabled")]
    Disabled,
    /// Interface, port or subscription lookup miss.
    #[error("not found")]
    NotFound,
    /// The entry already exists; use interpose to layer on top of it.
    #[error("already registered")]
    AlreadyRegistered,
    /// The user already has a request outstanding.
    #[error("request already queued")]
    AlreadyQueued,
    /// A port with this name already exists.
    #[error("duplicate port name")]
    DuplicateName,
    /// The address is out of range for the port.
    #[error("bad address")]
    BadAddress,
    /// Generic driver or transport failure; see the user's error message.
    #[error("error")]
    Error,
}

/// Result type used throughout the crate.
pub type AsynResult<T = ()> = Result<T, AsynError>;

/// Status of a [`cancel_request`](crate::AsynManager::cancel_request) call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStatus {
    /// The request was still queued and has been removed.
    Cancelled,
    /// The request callback is executing and cannot be aborted.
    CallbackActive,
    /// Nothing was queued for this user.
    NotQueued,
}

/// Builds an [`AsynError`], records the message and logs it.
///
/// `asyn_err!(Kind, "fmt", ..)` only logs; `asyn_err!(user => Kind, "fmt", ..)`
/// also writes the message into the user's error buffer. Both evaluate to
/// `Err(AsynError::Kind)`.
macro_rules! asyn_err {
    ($kind:ident, $($arg:tt)+) => {{
        debug!("{}: {}", $crate::AsynError::$kind, format_args!($($arg)+));
        Err($crate::AsynError::$kind)
    }};
    ($user:expr => $kind:ident, $($arg:tt)+) => {{
        $user.set_error_message(format_args!($($arg)+));
        debug!("{}: {}", $crate::AsynError::$kind, $user.error_message());
        Err($crate::AsynError::$kind)
    }};
}
