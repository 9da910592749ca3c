//! Standard driver interfaces.
//!
//! Every interface is a trait; a driver implements the traits it supports and
//! registers one trait object per interface type with its port. The object
//! itself is the driver context, so no separate opaque pointer is needed.
//!
//! Each trait object type is bound to its registry name and interrupt value
//! type through [`InterfaceType`]. Custom interfaces follow the same pattern:
//!
//! ```rust,ignore
//! pub trait Motor: Send + Sync {
//!     fn move_to(&self, user: &AsynUser, position: f64) -> AsynResult;
//! }
//!
//! impl InterfaceType for dyn Motor {
//!     const NAME: &'static str = "myMotor";
//!     type Value = f64;
//! }
//! ```

use core::fmt;
use core::ops::BitOr;

use crate::error::AsynResult;
use crate::user::AsynUser;

/// Binds an interface trait object type to its registry entry.
pub trait InterfaceType: Send + Sync + 'static {
    /// Registry name, e.g. `"asynOctet"`.
    const NAME: &'static str;
    /// Value delivered to interrupt subscribers of this interface.
    type Value: ?Sized + 'static;
}

/// Connection management and diagnostics, implemented by every driver.
pub trait Common: Send + Sync {
    /// Writes driver-specific diagnostics.
    fn report(&self, _out: &mut dyn fmt::Write, _level: u32) -> fmt::Result {
        Ok(())
    }

    /// Connects the port (`addr == -1`) or a device.
    ///
    /// On success the driver must call
    /// [`PortHandle::exception_connect`](crate::PortHandle::exception_connect).
    fn connect(&self, user: &AsynUser) -> AsynResult;

    /// Disconnects the port or a device.
    ///
    /// On success the driver must call
    /// [`PortHandle::exception_disconnect`](crate::PortHandle::exception_disconnect).
    fn disconnect(&self, user: &AsynUser) -> AsynResult;
}

impl InterfaceType for dyn Common {
    const NAME: &'static str = "asynCommon";
    type Value = ();
}

/// Why a read returned.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct EomReason(u8);

impl EomReason {
    /// The request count was satisfied.
    pub const CNT: Self = Self(0b001);
    /// An end-of-string terminator was seen.
    pub const EOS: Self = Self(0b010);
    /// The device signalled end of message.
    pub const END: Self = Self(0b100);

    /// No reason recorded.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Checks whether every bit of `other` is set.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for EomReason {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for EomReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = f.debug_set();
        if self.contains(Self::CNT) {
            names.entry(&"CNT");
        }
        if self.contains(Self::EOS) {
            names.entry(&"EOS");
        }
        if self.contains(Self::END) {
            names.entry(&"END");
        }
        names.finish()
    }
}

/// Byte-stream I/O.
pub trait Octet: Send + Sync {
    /// Writes `data`, returning the number of bytes transferred.
    fn write(&self, user: &AsynUser, data: &[u8]) -> AsynResult<usize>;

    /// Reads into `buf`, returning the byte count and why the read ended.
    fn read(&self, user: &AsynUser, buf: &mut [u8]) -> AsynResult<(usize, EomReason)>;

    /// Discards buffered input.
    fn flush(&self, _user: &AsynUser) -> AsynResult {
        Ok(())
    }

    /// Sets the input terminator.
    fn set_input_eos(&self, user: &AsynUser, _eos: &[u8]) -> AsynResult {
        asyn_err!(user => Error, "input EOS not supported")
    }

    /// Gets the input terminator.
    fn input_eos(&self, user: &AsynUser) -> AsynResult<Vec<u8>> {
        asyn_err!(user => Error, "input EOS not supported")
    }

    /// Sets the output terminator.
    fn set_output_eos(&self, user: &AsynUser, _eos: &[u8]) -> AsynResult {
        asyn_err!(user => Error, "output EOS not supported")
    }

    /// Gets the output terminator.
    fn output_eos(&self, user: &AsynUser) -> AsynResult<Vec<u8>> {
        asyn_err!(user => Error, "output EOS not supported")
    }
}

impl InterfaceType for dyn Octet {
    const NAME: &'static str = "asynOctet";
    type Value = [u8];
}

/// 32-bit integer I/O.
pub trait Int32: Send + Sync {
    /// Writes a value.
    fn write(&self, user: &AsynUser, value: i32) -> AsynResult;

    /// Reads a value.
    fn read(&self, user: &AsynUser) -> AsynResult<i32>;

    /// Gets the raw range of the value; `(0, 0)` means unknown.
    fn bounds(&self, _user: &AsynUser) -> AsynResult<(i32, i32)> {
        Ok((0, 0))
    }
}

impl InterfaceType for dyn Int32 {
    const NAME: &'static str = "asynInt32";
    type Value = i32;
}

/// Double-precision I/O.
pub trait Float64: Send + Sync {
    /// Writes a value.
    fn write(&self, user: &AsynUser, value: f64) -> AsynResult;

    /// Reads a value.
    fn read(&self, user: &AsynUser) -> AsynResult<f64>;
}

impl InterfaceType for dyn Float64 {
    const NAME: &'static str = "asynFloat64";
    type Value = f64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_names() {
        assert_eq!(<dyn Common as InterfaceType>::NAME, "asynCommon");
        assert_eq!(<dyn Octet as InterfaceType>::NAME, "asynOctet");
        assert_eq!(<dyn Int32 as InterfaceType>::NAME, "asynInt32");
        assert_eq!(<dyn Float64 as InterfaceType>::NAME, "asynFloat64");
    }

    #[test]
    fn test_eom_reason() {
        let eom = EomReason::EOS | EomReason::END;
        assert!(eom.contains(EomReason::EOS));
        assert!(!eom.contains(EomReason::CNT));
        assert_eq!(format!("{:?}", EomReason::CNT), "{\"CNT\"}");
        assert_eq!(EomReason::empty(), EomReason::default());
    }
}
