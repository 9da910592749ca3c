//! Synchronous I/O helpers.
//!
//! For clients that may block the calling thread: each call takes the port
//! lock, calls the interface directly, and releases the lock, all bounded by
//! one timeout. A disconnected device with autoconnect enabled is given up to
//! the same timeout to connect first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::AsynResult;
use crate::interfaces::{EomReason, Int32, InterfaceType, Octet};
use crate::manager::AsynManager;
use crate::port::Port;
use crate::registry::Interface;
use crate::user::AsynUser;

/// Holds the port lock for one synchronous operation.
struct Locked<'a> {
    port: &'a Port,
    user: &'a AsynUser,
    key: i32,
}

impl<'a> Locked<'a> {
    fn acquire(port: &'a Port, user: &'a AsynUser, key: i32, timeout: Duration) -> AsynResult<Self> {
        let deadline = Instant::now() + timeout;
        let (connected, auto) = {
            let shared = port.state();
            (shared.devices.is_connected(key), shared.devices.can_auto_connect(key))
        };
        if !connected {
            if !auto || port.wait_connect(user, key, timeout).is_err() {
                return asyn_err!(user => Disconnected, "port {} addr {} not connected", port.name(), key);
            }
        }
        port.acquire(user, key, Some(deadline))?;
        Ok(Self { port, user, key })
    }
}

impl Drop for Locked<'_> {
    fn drop(&mut self) {
        let _ = self.port.release(self.user, self.key);
    }
}

/// A user connected to one device, with a resolved interface `T`.
pub struct SyncIo<T: InterfaceType + ?Sized> {
    user: AsynUser,
    port: Arc<Port>,
    key: i32,
    methods: Interface<T>,
}

/// Synchronous byte-stream I/O.
pub type OctetSyncIo = SyncIo<dyn Octet>;

/// Synchronous 32-bit integer I/O.
pub type Int32SyncIo = SyncIo<dyn Int32>;

impl<T: InterfaceType + ?Sized> SyncIo<T> {
    /// Creates a user, connects it to `(port, addr)` and resolves `T`.
    pub fn connect(manager: &AsynManager, port: &str, addr: i32) -> AsynResult<Self> {
        let user = manager.create_user();
        manager.connect_device(&user, port, addr)?;
        let methods = manager.find_interface::<T>(&user, true)?;
        let binding = user.binding()?;
        let key = binding.port.key(addr);
        Ok(Self {
            port: binding.port,
            key,
            methods,
            user,
        })
    }

    /// Gets the user the helper runs as; its error message describes the
    /// last failure.
    #[inline]
    pub fn user(&self) -> &AsynUser {
        &self.user
    }

    /// Runs `f` with the device locked.
    fn locked<R, F>(&self, timeout: Duration, f: F) -> AsynResult<R>
    where
        F: FnOnce(&T, &AsynUser) -> AsynResult<R>,
    {
        self.user.set_timeout(timeout);
        let _locked = Locked::acquire(&self.port, &self.user, self.key, timeout)?;
        f(&*self.methods, &self.user)
    }

    /// Unbinds the user.
    pub fn disconnect(self, manager: &AsynManager) -> AsynResult {
        manager.disconnect_device(&self.user)
    }
}

impl SyncIo<dyn Octet> {
    /// Writes `data`.
    pub fn write(&self, data: &[u8], timeout: Duration) -> AsynResult<usize> {
        self.locked(timeout, |octet, user| octet.write(user, data))
    }

    /// Reads into `buf`.
    pub fn read(&self, buf: &mut [u8], timeout: Duration) -> AsynResult<(usize, EomReason)> {
        self.locked(timeout, |octet, user| octet.read(user, buf))
    }

    /// Flushes stale input, writes `data` and reads the reply, all under one
    /// lock so no other client's I/O interleaves.
    pub fn write_read(&self, data: &[u8], buf: &mut [u8], timeout: Duration) -> AsynResult<(usize, EomReason)> {
        self.locked(timeout, |octet, user| {
            octet.flush(user)?;
            octet.write(user, data)?;
            octet.read(user, buf)
        })
    }

    /// Discards buffered input.
    pub fn flush(&self, timeout: Duration) -> AsynResult {
        self.locked(timeout, |octet, user| octet.flush(user))
    }

    /// Connects, runs one [`write_read`](Self::write_read) and disconnects.
    pub fn write_read_once(
        manager: &AsynManager,
        port: &str,
        addr: i32,
        data: &[u8],
        buf: &mut [u8],
        timeout: Duration,
    ) -> AsynResult<(usize, EomReason)> {
        let io = Self::connect(manager, port, addr)?;
        let result = io.write_read(data, buf, timeout);
        io.disconnect(manager)?;
        result
    }
}

impl SyncIo<dyn Int32> {
    /// Writes a value.
    pub fn write(&self, value: i32, timeout: Duration) -> AsynResult {
        self.locked(timeout, |int32, user| int32.write(user, value))
    }

    /// Reads a value.
    pub fn read(&self, timeout: Duration) -> AsynResult<i32> {
        self.locked(timeout, |int32, user| int32.read(user))
    }
}

impl<T: InterfaceType + ?Sized> core::fmt::Debug for SyncIo<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncIo")
            .field("interface", &T::NAME)
            .field("port", &self.port.name())
            .field("key", &self.key)
            .finish()
    }
}
