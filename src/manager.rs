//! The manager: port table and client entry points.
//!
//! An [`AsynManager`] is an ordinary owned value; the application creates one
//! at start-up, hands `&AsynManager` (or an `Arc`) to its drivers and clients,
//! and drops it at exit, which shuts every port down.
//!
//! # Usage Example
//!
//! ```rust,ignore
//! let manager = AsynManager::new(ManagerConfig::default());
//!
//! // Driver side
//! let port = manager.register_port("L0", PortConfig::new(PortAttributes::CAN_BLOCK))?;
//! let driver = EchoDriver::new(port.clone());
//! driver.register()?;
//!
//! // Client side
//! let user = manager.create_user();
//! manager.connect_device(&user, "L0", 0)?;
//! let octet = manager.find_interface::<dyn Octet>(&user, true)?;
//! manager.queue_request(&user, Priority::Medium, Request::new(move |user| {
//!     let _ = octet.write(user, b"hello");
//! }))?;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use spin::RwLock;

use crate::config::{ManagerConfig, PortConfig};
use crate::error::{AsynResult, CancelStatus};
use crate::interfaces::InterfaceType;
use crate::notify::{Exception, SubscriptionHandle};
use crate::port::{Port, PortHandle};
use crate::queue::{Priority, Request};
use crate::registry::Interface;
use crate::timer::TimerQueue;
use crate::user::{AsynUser, Binding};

/// Owner of every port.
pub struct AsynManager {
    config: ManagerConfig,
    ports: RwLock<BTreeMap<String, Arc<Port>>>,
    timer: Arc<TimerQueue>,
}

impl AsynManager {
    /// Creates a manager and starts its timer thread.
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            ports: RwLock::new(BTreeMap::new()),
            timer: TimerQueue::new(),
        }
    }

    /// Gets the manager configuration.
    #[inline]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Creates an unbound user with the configured default timeout.
    pub fn create_user(&self) -> AsynUser {
        AsynUser::with_timeout(self.config.default_timeout)
    }

    /// Creates a port.
    ///
    /// Ports that can block get their worker thread here. The port starts
    /// disconnected; the driver reports connections through
    /// [`PortHandle::exception_connect`].
    ///
    /// # Errors
    ///
    /// `DuplicateName` if a port with this name exists.
    pub fn register_port(&self, name: &str, config: PortConfig) -> AsynResult<PortHandle> {
        let port = {
            let mut ports = self.ports.write();
            if ports.contains_key(name) {
                return asyn_err!(DuplicateName, "port {} already registered", name);
            }
            let port = Port::new(name, config, self.config.reconnect_interval, Arc::clone(&self.timer));
            ports.insert(name.to_owned(), Arc::clone(&port));
            port
        };
        if port.config().can_block() {
            if let Err(e) = port.start_worker() {
                self.ports.write().remove(name);
                return Err(e);
            }
        }
        info!("registered port {} {:?}", name, port.config().attributes);
        Ok(PortHandle::from_port(port))
    }

    /// Looks up a port by name.
    pub fn port(&self, name: &str) -> AsynResult<PortHandle> {
        match self.ports.read().get(name) {
            Some(port) => Ok(PortHandle::from_port(Arc::clone(port))),
            None => asyn_err!(NotFound, "port {} not found", name),
        }
    }

    /// Names of all ports, sorted.
    pub fn port_names(&self) -> Vec<String> {
        self.ports.read().keys().cloned().collect()
    }

    /// Binds `user` to `(port, addr)`.
    ///
    /// # Errors
    ///
    /// `NotFound` if the port does not exist, `BadAddress` if `addr` is out of
    /// range for it, `Error` if the user is already bound.
    pub fn connect_device(&self, user: &AsynUser, port_name: &str, addr: i32) -> AsynResult {
        if user.is_bound() {
            return asyn_err!(user => Error, "user already connected to port {}", user.port_name().unwrap_or_default());
        }
        let port = match self.ports.read().get(port_name) {
            Some(port) => Arc::clone(port),
            None => return asyn_err!(user => NotFound, "port {} not found", port_name),
        };
        if let Err(e) = port.check_addr(addr) {
            user.set_error_message(format_args!("port {} has no addr {}", port_name, addr));
            return Err(e);
        }
        user.bind(port, addr);
        debug!("user {} connected to {} addr {}", user.id().0, port_name, addr);
        Ok(())
    }

    /// Unbinds `user`.
    ///
    /// # Errors
    ///
    /// `Error` while the user has a request outstanding or holds the lock.
    pub fn disconnect_device(&self, user: &AsynUser) -> AsynResult {
        let binding = user.binding()?;
        if user.is_queued() {
            return asyn_err!(user => Error, "user {} has a request outstanding", user.id().0);
        }
        if binding.port.state().locks.holds_any(user.id()) {
            return asyn_err!(user => Error, "user {} holds the lock of port {}", user.id().0, binding.port.name());
        }
        user.unbind();
        Ok(())
    }

    fn bound(&self, user: &AsynUser) -> AsynResult<(Arc<Port>, i32)> {
        let Binding { port, addr } = user.binding()?;
        let key = port.key(addr);
        Ok((port, key))
    }

    /// Resolves interface `T` for the user's `(port, addr)`.
    ///
    /// Returns the top of the interpose stack, or the driver's own layer when
    /// `interpose_ok` is false.
    pub fn find_interface<T: InterfaceType + ?Sized>(&self, user: &AsynUser, interpose_ok: bool) -> AsynResult<Interface<T>> {
        let (port, key) = self.bound(user)?;
        match port.interfaces.find::<T>(key, interpose_ok) {
            Ok(found) => Ok(found),
            Err(e) => {
                user.set_error_message(format_args!("port {} does not provide {}", port.name(), T::NAME));
                Err(e)
            }
        }
    }

    /// Queues `request` for the user's `(port, addr)`.
    ///
    /// On a port that can block this returns at once and the callback runs
    /// later on the port's worker thread; otherwise the callback runs in the
    /// calling thread before this returns. Either way it runs with the port
    /// (or device, with per-device locking) locked for `user`.
    ///
    /// # Errors
    ///
    /// `AlreadyQueued` if the user has a request outstanding; `Disabled`;
    /// `Disconnected` if not connected and autoconnect is off.
    pub fn queue_request(&self, user: &AsynUser, priority: Priority, request: Request) -> AsynResult {
        let (port, key) = self.bound(user)?;
        port.queue_request(user, key, priority, request)
    }

    /// Removes the user's queued request.
    pub fn cancel_request(&self, user: &AsynUser) -> CancelStatus {
        match user.binding() {
            Ok(binding) => binding.port.cancel_request(user),
            Err(_) => CancelStatus::NotQueued,
        }
    }

    /// Locks the user's port or device, waiting at most `timeout`.
    ///
    /// Re-entrant for the same user. Requests queued by the lock holder still
    /// run; requests of other users wait until the matching
    /// [`unlock`](Self::unlock).
    ///
    /// # Errors
    ///
    /// `Timeout` if another user holds the lock for longer than `timeout`.
    pub fn lock(&self, user: &AsynUser, timeout: Duration) -> AsynResult {
        let (port, key) = self.bound(user)?;
        port.acquire(user, key, Some(std::time::Instant::now() + timeout))
    }

    /// Undoes one [`lock`](Self::lock).
    pub fn unlock(&self, user: &AsynUser) -> AsynResult {
        let (port, key) = self.bound(user)?;
        port.release(user, key)
    }

    /// Subscribes `user` to interrupts of interface `T` at its `(port, addr)`.
    ///
    /// The callback receives the subscribing user and the distributed value.
    /// The user's reason at registration time selects reason-filtered
    /// distributions.
    ///
    /// # Errors
    ///
    /// `AlreadyRegistered` if the user already subscribes to this list.
    pub fn register_interrupt_user<T, F>(&self, user: &AsynUser, callback: F) -> AsynResult<SubscriptionHandle>
    where
        T: InterfaceType + ?Sized,
        F: Fn(&AsynUser, &T::Value) + Send + Sync + 'static,
    {
        let (port, key) = self.bound(user)?;
        port.interrupts.subscribe::<T>(key, user, Box::new(callback))
    }

    /// Cancels an interrupt subscription.
    ///
    /// Once this returns the callback is not running elsewhere and will not be
    /// called again.
    pub fn cancel_interrupt_user(&self, handle: &SubscriptionHandle) -> AsynResult {
        handle.cancel()
    }

    /// Subscribes `user` to state changes of its `(port, addr)`.
    pub fn exception_callback_add<F>(&self, user: &AsynUser, callback: F) -> AsynResult<SubscriptionHandle>
    where
        F: Fn(&AsynUser, Exception) + Send + Sync + 'static,
    {
        let (port, key) = self.bound(user)?;
        port.subscribe_exceptions(user, key, callback)
    }

    /// Cancels an exception subscription.
    pub fn exception_callback_remove(&self, handle: &SubscriptionHandle) -> AsynResult {
        handle.cancel()
    }

    /// Whether the user's device and its port are connected.
    pub fn is_connected(&self, user: &AsynUser) -> AsynResult<bool> {
        let (port, key) = self.bound(user)?;
        Ok(port.state().devices.is_connected(key))
    }

    /// Whether the user's device and its port are enabled.
    pub fn is_enabled(&self, user: &AsynUser) -> AsynResult<bool> {
        let (port, key) = self.bound(user)?;
        Ok(port.state().devices.is_enabled(key))
    }

    /// Whether the user's device reconnects automatically.
    pub fn is_auto_connect(&self, user: &AsynUser) -> AsynResult<bool> {
        let (port, key) = self.bound(user)?;
        Ok(port.state().devices.status(key).auto_connect)
    }

    /// Enables or disables the user's device (or the port for addr -1).
    pub fn enable(&self, user: &AsynUser, enabled: bool) -> AsynResult {
        let (port, key) = self.bound(user)?;
        port.set_enabled(key, enabled);
        Ok(())
    }

    /// Sets the autoconnect policy of the user's device (or the port).
    pub fn auto_connect(&self, user: &AsynUser, auto_connect: bool) -> AsynResult {
        let (port, key) = self.bound(user)?;
        port.set_auto_connect(key, auto_connect);
        Ok(())
    }

    /// Blocks until the user's device is connected, starting an autoconnect
    /// attempt if one is allowed.
    ///
    /// # Errors
    ///
    /// `Timeout` if still disconnected after `timeout`.
    pub fn wait_connect(&self, user: &AsynUser, timeout: Duration) -> AsynResult {
        let (port, key) = self.bound(user)?;
        port.wait_connect(user, key, timeout)
    }

    /// Writes a status report of one port, or of every port when `port` is
    /// `None`.
    pub fn report(&self, out: &mut dyn fmt::Write, level: u32, port: Option<&str>) -> fmt::Result {
        let ports: Vec<Arc<Port>> = {
            let table = self.ports.read();
            match port {
                Some(name) => table.get(name).cloned().into_iter().collect(),
                None => table.values().cloned().collect(),
            }
        };
        for port in ports {
            port.report(out, level)?;
        }
        Ok(())
    }

    /// Shuts a port down and removes it from the table.
    ///
    /// Queued requests are dropped, subscribers are told
    /// [`Exception::Shutdown`] and the worker thread is joined.
    pub fn shutdown_port(&self, name: &str) -> AsynResult {
        let port = self.ports.write().remove(name);
        match port {
            Some(port) => {
                port.shutdown();
                Ok(())
            }
            None => asyn_err!(NotFound, "port {} not found", name),
        }
    }
}

impl Default for AsynManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl Drop for AsynManager {
    fn drop(&mut self) {
        let ports = core::mem::take(&mut *self.ports.write());
        for port in ports.values() {
            port.shutdown();
        }
        self.timer.shutdown();
    }
}

impl fmt::Debug for AsynManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsynManager")
            .field("config", &self.config)
            .field("ports", &self.port_names())
            .finish()
    }
}
