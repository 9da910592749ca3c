//! The `AsynUser` context passed through every call.
//!
//! A user is the identity token of one client (or one internal actor such as
//! the autoconnect machinery). It carries the timeout and reason code the
//! driver reads, the fixed-capacity error-message buffer drivers write into,
//! the `(port, addr)` binding made by `connect_device`, and a side table of
//! per-layer private data for interpose layers.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use arrayvec::ArrayString;
use spin::{Mutex, RwLock};

use crate::error::AsynResult;
use crate::port::{Port, PortHandle};
use crate::registry::LayerId;

/// Capacity of the error-message buffer, in bytes.
pub const ERROR_MESSAGE_SIZE: usize = 160;

/// Timeout given to users created without a manager.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Unique identifier of an [`AsynUser`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserId(pub u64);

static NEXT_USER_ID: AtomicU64 = AtomicU64::new(1);

fn next_user_id() -> UserId {
    UserId(NEXT_USER_ID.fetch_add(1, Ordering::Relaxed))
}

/// The `(port, addr)` a user is connected to.
#[derive(Clone)]
pub(crate) struct Binding {
    pub port: Arc<Port>,
    pub addr: i32,
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    timeout: Duration,
    reason: i32,
}

struct UserInner {
    id: UserId,
    binding: RwLock<Option<Binding>>,
    settings: Mutex<Settings>,
    error: Mutex<ArrayString<ERROR_MESSAGE_SIZE>>,
    queued: AtomicBool,
    layers: Mutex<BTreeMap<LayerId, Box<dyn Any + Send>>>,
}

/// Client context handle.
///
/// Cloning yields another handle to the same user; use
/// [`duplicate`](Self::duplicate) for a new identity.
#[derive(Clone)]
pub struct AsynUser {
    inner: Arc<UserInner>,
}

impl AsynUser {
    /// Creates an unbound user with the default timeout.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Creates an unbound user with the given timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(UserInner {
                id: next_user_id(),
                binding: RwLock::new(None),
                settings: Mutex::new(Settings { timeout, reason: 0 }),
                error: Mutex::new(ArrayString::new()),
                queued: AtomicBool::new(false),
                layers: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Creates a new user with the same binding, timeout and reason.
    ///
    /// The duplicate has its own identity, error buffer and layer table, so it
    /// can queue requests and hold locks independently of the original.
    pub fn duplicate(&self) -> Self {
        let settings = *self.inner.settings.lock();
        let dup = Self::with_timeout(settings.timeout);
        dup.set_reason(settings.reason);
        *dup.inner.binding.write() = self.inner.binding.read().clone();
        dup
    }

    /// Gets the user's identifier.
    #[inline]
    pub fn id(&self) -> UserId {
        self.inner.id
    }

    /// Gets the I/O timeout drivers should honor.
    pub fn timeout(&self) -> Duration {
        self.inner.settings.lock().timeout
    }

    /// Sets the I/O timeout.
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.settings.lock().timeout = timeout;
    }

    /// Gets the driver-defined reason code.
    pub fn reason(&self) -> i32 {
        self.inner.settings.lock().reason
    }

    /// Sets the driver-defined reason code.
    pub fn set_reason(&self, reason: i32) {
        self.inner.settings.lock().reason = reason;
    }

    /// Gets a copy of the error message.
    pub fn error_message(&self) -> String {
        self.inner.error.lock().as_str().to_owned()
    }

    /// Replaces the error message, truncating at [`ERROR_MESSAGE_SIZE`].
    pub fn set_error_message(&self, args: fmt::Arguments<'_>) {
        let mut buf = self.inner.error.lock();
        buf.clear();
        let _ = fmt::write(&mut Truncating { buf: &mut buf, full: false }, args);
    }

    /// Clears the error message.
    pub fn clear_error_message(&self) {
        self.inner.error.lock().clear();
    }

    /// Whether the user is connected to a port.
    pub fn is_bound(&self) -> bool {
        self.inner.binding.read().is_some()
    }

    /// Gets the name of the bound port.
    pub fn port_name(&self) -> Option<String> {
        self.inner
            .binding
            .read()
            .as_ref()
            .map(|b| b.port.name().to_owned())
    }

    /// Gets the bound address.
    pub fn addr(&self) -> AsynResult<i32> {
        match self.inner.binding.read().as_ref() {
            Some(binding) => Ok(binding.addr),
            None => asyn_err!(self => NotFound, "user is not connected to a port"),
        }
    }

    /// Gets a handle to the bound port.
    pub fn port(&self) -> AsynResult<PortHandle> {
        self.binding().map(|b| PortHandle::from_port(b.port))
    }

    /// Stores private data for an interpose layer, replacing any previous value.
    pub fn set_layer_data<T: Any + Send>(&self, layer: LayerId, value: T) {
        self.inner.layers.lock().insert(layer, Box::new(value));
    }

    /// Runs `f` on the layer's private data if present and of type `T`.
    pub fn with_layer_data<T: Any + Send, R>(&self, layer: LayerId, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut layers = self.inner.layers.lock();
        layers.get_mut(&layer)?.downcast_mut::<T>().map(f)
    }

    /// Removes and returns the layer's private data.
    pub fn take_layer_data<T: Any + Send>(&self, layer: LayerId) -> Option<T> {
        let mut layers = self.inner.layers.lock();
        if !layers.get(&layer)?.is::<T>() {
            return None;
        }
        layers
            .remove(&layer)
            .and_then(|data| data.downcast::<T>().ok())
            .map(|data| *data)
    }

    pub(crate) fn binding(&self) -> AsynResult<Binding> {
        match self.inner.binding.read().as_ref() {
            Some(binding) => Ok(binding.clone()),
            None => asyn_err!(self => NotFound, "user is not connected to a port"),
        }
    }

    pub(crate) fn bind(&self, port: Arc<Port>, addr: i32) {
        *self.inner.binding.write() = Some(Binding { port, addr });
    }

    pub(crate) fn unbind(&self) {
        *self.inner.binding.write() = None;
    }

    /// Claims the single outstanding-request slot.
    pub(crate) fn try_mark_queued(&self) -> bool {
        self.inner
            .queued
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn clear_queued(&self) {
        self.inner.queued.store(false, Ordering::Release);
    }

    /// Whether the user has a request queued or executing.
    pub fn is_queued(&self) -> bool {
        self.inner.queued.load(Ordering::Acquire)
    }
}

impl Default for AsynUser {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AsynUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let binding = self.inner.binding.read();
        f.debug_struct("AsynUser")
            .field("id", &self.inner.id)
            .field("port", &binding.as_ref().map(|b| b.port.name()))
            .field("addr", &binding.as_ref().map(|b| b.addr))
            .finish()
    }
}

/// Writer that drops whatever does not fit, never splitting a character.
struct Truncating<'a> {
    buf: &'a mut ArrayString<ERROR_MESSAGE_SIZE>,
    full: bool,
}

impl fmt::Write for Truncating<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.chars() {
            if self.full || self.buf.try_push(c).is_err() {
                self.full = true;
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_ids_are_unique() {
        let a = AsynUser::new();
        let b = AsynUser::new();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn test_error_message_truncated() {
        let user = AsynUser::new();
        let long = "x".repeat(ERROR_MESSAGE_SIZE * 2);
        user.set_error_message(format_args!("{}", long));
        assert_eq!(user.error_message().len(), ERROR_MESSAGE_SIZE);

        // A multi-byte character straddling the limit is dropped whole.
        let text = format!("{}é", "y".repeat(ERROR_MESSAGE_SIZE - 1));
        user.set_error_message(format_args!("{}", text));
        assert_eq!(user.error_message().len(), ERROR_MESSAGE_SIZE - 1);

        user.clear_error_message();
        assert!(user.error_message().is_empty());
    }

    #[test]
    fn test_unbound_user() {
        let user = AsynUser::new();
        assert!(!user.is_bound());
        assert!(user.addr().is_err());
        assert!(user.port().is_err());
        assert!(!user.error_message().is_empty());
    }

    #[test]
    fn test_layer_data() {
        let user = AsynUser::new();
        let layer = LayerId(7);
        user.set_layer_data(layer, 5u32);
        assert_eq!(user.with_layer_data(layer, |v: &mut u32| { *v += 1; *v }), Some(6));
        assert_eq!(user.with_layer_data(layer, |v: &mut String| v.len()), None);
        assert_eq!(user.take_layer_data::<String>(layer), None);
        assert_eq!(user.take_layer_data::<u32>(layer), Some(6));
        assert_eq!(user.take_layer_data::<u32>(layer), None);
    }

    #[test]
    fn test_duplicate_has_new_identity() {
        let user = AsynUser::with_timeout(Duration::from_millis(250));
        user.set_reason(3);
        user.set_layer_data(LayerId(1), 1u8);
        let dup = user.duplicate();
        assert_ne!(dup.id(), user.id());
        assert_eq!(dup.timeout(), Duration::from_millis(250));
        assert_eq!(dup.reason(), 3);
        assert_eq!(dup.take_layer_data::<u8>(LayerId(1)), None);
    }

    #[test]
    fn test_queued_slot() {
        let user = AsynUser::new();
        assert!(user.try_mark_queued());
        assert!(!user.try_mark_queued());
        assert!(user.is_queued());
        user.clear_queued();
        assert!(user.try_mark_queued());
    }
}
