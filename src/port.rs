//! Ports and their devices.
//!
//! A port owns its interface registry, its interrupt and exception lists, and
//! one mutex-protected [`PortShared`] block holding everything mutated on the
//! I/O path: the request queue, the lock table and the per-device status. The
//! worker thread, explicit lockers and connection-state changes all wait on
//! the single `wake` condition variable that accompanies it.
//!
//! # Address keys
//!
//! Status, locks, interfaces and subscriptions are keyed by an address key:
//! `-1` for the port itself and, on a multi-device port, the device address.
//! A single-device port maps every address to `-1`, so its implicit device at
//! address 0 aliases the port.
//!
//! Driver callbacks and subscriber callbacks never run with the port state
//! locked.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::PortConfig;
use crate::error::AsynResult;
use crate::interfaces::{Common, InterfaceType};
use crate::lock::{LockTable, guard, wait_timeout};
use crate::notify::{Exception, ExceptionRegistry, InterruptRegistry, SubscriptionHandle};
use crate::queue::{QueueLevel, RequestKind, RequestQueue};
use crate::registry::{Interface, InterfaceRegistry, PORT_ADDR};
use crate::timer::TimerQueue;
use crate::user::{AsynUser, UserId};

/// Connection and configuration state of the port or one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DeviceStatus {
    pub connected: bool,
    pub enabled: bool,
    pub auto_connect: bool,
    /// A connect attempt is queued or scheduled.
    pub connect_pending: bool,
    /// The reconnect timer is running.
    pub retry_armed: bool,
}

impl DeviceStatus {
    fn new(auto_connect: bool) -> Self {
        Self {
            connected: false,
            enabled: true,
            auto_connect,
            connect_pending: false,
            retry_armed: false,
        }
    }
}

/// Status of the port (`-1`) and of every device seen so far.
///
/// Devices are created on first use with the port's configured autoconnect
/// policy.
pub(crate) struct DeviceTable {
    default_auto_connect: bool,
    entries: BTreeMap<i32, DeviceStatus>,
}

impl DeviceTable {
    fn new(auto_connect: bool) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(PORT_ADDR, DeviceStatus::new(auto_connect));
        Self {
            default_auto_connect: auto_connect,
            entries,
        }
    }

    /// The keys `key` depends on: the port, then the device itself.
    #[inline]
    pub fn chain(key: i32) -> impl Iterator<Item = i32> {
        core::iter::once(PORT_ADDR).chain((key != PORT_ADDR).then_some(key))
    }

    pub fn status(&self, key: i32) -> DeviceStatus {
        self.entries
            .get(&key)
            .copied()
            .unwrap_or(DeviceStatus::new(self.default_auto_connect))
    }

    pub fn status_mut(&mut self, key: i32) -> &mut DeviceStatus {
        let auto_connect = self.default_auto_connect;
        self.entries
            .entry(key)
            .or_insert_with(|| DeviceStatus::new(auto_connect))
    }

    /// Port and device are both connected.
    pub fn is_connected(&self, key: i32) -> bool {
        Self::chain(key).all(|k| self.status(k).connected)
    }

    /// Port and device are both enabled.
    pub fn is_enabled(&self, key: i32) -> bool {
        Self::chain(key).all(|k| self.status(k).enabled)
    }

    /// Client requests for `key` may be dispatched.
    pub fn is_ready(&self, key: i32) -> bool {
        self.is_connected(key) && self.is_enabled(key)
    }

    /// Every disconnected key in the chain reconnects automatically.
    pub fn can_auto_connect(&self, key: i32) -> bool {
        Self::chain(key).all(|k| {
            let status = self.status(k);
            status.connected || status.auto_connect
        })
    }

    fn disable_all(&mut self) {
        for status in self.entries.values_mut() {
            status.enabled = false;
        }
    }

    fn iter(&self) -> impl Iterator<Item = (&i32, &DeviceStatus)> {
        self.entries.iter()
    }
}

/// The request currently executing, including synchronous ones.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Active {
    pub user: UserId,
    pub seq: u64,
}

/// Port state mutated on the I/O path, guarded by `Port::shared`.
pub(crate) struct PortShared {
    pub queue: RequestQueue,
    pub locks: LockTable,
    pub devices: DeviceTable,
    pub active: Option<Active>,
    pub next_seq: u64,
    pub shutdown: bool,
}

impl PortShared {
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

pub(crate) struct Port {
    name: String,
    config: PortConfig,
    pub(crate) reconnect_interval: Duration,
    pub(crate) interfaces: InterfaceRegistry,
    pub(crate) interrupts: InterruptRegistry,
    pub(crate) exceptions: ExceptionRegistry,
    pub(crate) shared: Mutex<PortShared>,
    pub(crate) wake: Condvar,
    pub(crate) timer: Arc<TimerQueue>,
    pub(crate) worker: Mutex<Option<JoinHandle<()>>>,
    pub(crate) this: Weak<Port>,
}

impl Port {
    pub(crate) fn new(
        name: &str,
        config: PortConfig,
        reconnect_interval: Duration,
        timer: Arc<TimerQueue>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name: name.to_owned(),
            reconnect_interval,
            interfaces: InterfaceRegistry::new(),
            interrupts: InterruptRegistry::new(),
            exceptions: ExceptionRegistry::new(),
            shared: Mutex::new(PortShared {
                queue: RequestQueue::new(),
                locks: LockTable::new(config.per_device_lock()),
                devices: DeviceTable::new(config.auto_connect),
                active: None,
                next_seq: 0,
                shutdown: false,
            }),
            wake: Condvar::new(),
            timer,
            worker: Mutex::new(None),
            this: this.clone(),
            config,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    #[inline]
    pub(crate) fn state(&self) -> MutexGuard<'_, PortShared> {
        guard(&self.shared)
    }

    /// Maps a device address to its address key.
    #[inline]
    pub(crate) fn key(&self, addr: i32) -> i32 {
        if self.config.is_multi_device() && addr >= 0 {
            addr
        } else {
            PORT_ADDR
        }
    }

    /// Validates `addr` for this port.
    ///
    /// # Errors
    ///
    /// `BadAddress` unless `addr` is 0 or -1 on a single-device port, or
    /// `-1 <= addr < max_addr` on a multi-device port.
    pub(crate) fn check_addr(&self, addr: i32) -> AsynResult {
        let valid = if self.config.is_multi_device() {
            (PORT_ADDR..self.config.max_addr).contains(&addr)
        } else {
            addr == PORT_ADDR || addr == 0
        };
        if valid {
            Ok(())
        } else {
            asyn_err!(BadAddress, "port {} has no addr {}", self.name, addr)
        }
    }

    /// A user bound to `(self, key)` for internal work.
    pub(crate) fn internal_user(&self, key: i32) -> Option<AsynUser> {
        let port = self.this.upgrade()?;
        let user = AsynUser::new();
        user.bind(port, key);
        Some(user)
    }

    pub(crate) fn announce(&self, key: i32, exception: Exception) -> usize {
        self.exceptions
            .announce(key, exception, self.config.is_multi_device())
    }

    /// Marks `addr` connected. Called by the driver after it connected.
    pub(crate) fn exception_connect(&self, addr: i32) -> AsynResult {
        self.check_addr(addr)?;
        let key = self.key(addr);
        {
            let mut shared = self.state();
            let status = shared.devices.status_mut(key);
            if status.connected {
                warn!("port {} addr {}: exception_connect while already connected", self.name, key);
                return Err(crate::AsynError::Error);
            }
            status.connected = true;
            self.wake.notify_all();
        }
        debug!("port {} addr {} connected", self.name, key);
        self.announce(key, Exception::Connect);
        Ok(())
    }

    /// Marks `addr` disconnected and starts the autoconnect cycle.
    pub(crate) fn exception_disconnect(&self, addr: i32) -> AsynResult {
        self.check_addr(addr)?;
        let key = self.key(addr);
        {
            let mut shared = self.state();
            let status = shared.devices.status_mut(key);
            if !status.connected {
                warn!("port {} addr {}: exception_disconnect while not connected", self.name, key);
                return Err(crate::AsynError::Error);
            }
            status.connected = false;
            self.request_connect(&mut shared, key);
            self.wake.notify_all();
        }
        debug!("port {} addr {} disconnected", self.name, key);
        self.announce(key, Exception::Connect);
        Ok(())
    }

    pub(crate) fn set_enabled(&self, key: i32, enabled: bool) {
        {
            let mut shared = self.state();
            shared.devices.status_mut(key).enabled = enabled;
            if enabled {
                self.request_connect(&mut shared, key);
            }
            self.wake.notify_all();
        }
        debug!("port {} addr {} enabled: {}", self.name, key, enabled);
        self.announce(key, Exception::Enable);
    }

    pub(crate) fn set_auto_connect(&self, key: i32, auto_connect: bool) {
        {
            let mut shared = self.state();
            shared.devices.status_mut(key).auto_connect = auto_connect;
            if auto_connect {
                self.request_connect(&mut shared, key);
            }
            self.wake.notify_all();
        }
        debug!("port {} addr {} autoConnect: {}", self.name, key, auto_connect);
        self.announce(key, Exception::AutoConnect);
    }

    /// Blocks until `key` and its port are connected.
    pub(crate) fn wait_connect(&self, user: &AsynUser, key: i32, timeout: Duration) -> AsynResult {
        let deadline = Instant::now() + timeout;
        let mut shared = self.state();
        self.request_connect(&mut shared, key);
        while !shared.devices.is_connected(key) {
            if shared.shutdown {
                return asyn_err!(user => Disabled, "port {} has been shut down", self.name);
            }
            let now = Instant::now();
            if now >= deadline {
                return asyn_err!(user => Timeout, "port {} addr {} not connected after {:?}", self.name, key, timeout);
            }
            shared = wait_timeout(&self.wake, shared, deadline - now);
        }
        Ok(())
    }

    /// Acquires the lock of `key` for `user`, waiting until `deadline`.
    pub(crate) fn acquire(&self, user: &AsynUser, key: i32, deadline: Option<Instant>) -> AsynResult {
        let mut shared = self.state();
        loop {
            if shared.shutdown {
                return asyn_err!(user => Disabled, "port {} has been shut down", self.name);
            }
            if shared.locks.is_available(user.id(), key) {
                shared.locks.acquire(user.id(), key);
                trace!("port {} addr {} locked by user {}", self.name, key, user.id().0);
                return Ok(());
            }
            shared = match deadline {
                None => crate::lock::wait(&self.wake, shared),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return asyn_err!(user => Timeout, "port {} addr {} lock not available", self.name, key);
                    }
                    wait_timeout(&self.wake, shared, deadline - now)
                }
            };
        }
    }

    /// Undoes one acquisition of the lock of `key` by `user`.
    pub(crate) fn release(&self, user: &AsynUser, key: i32) -> AsynResult {
        let mut shared = self.state();
        match shared.locks.release(user.id(), key) {
            Some(freed) => {
                if freed {
                    trace!("port {} addr {} unlocked", self.name, key);
                }
                self.wake.notify_all();
                Ok(())
            }
            None => asyn_err!(user => Error, "user {} does not hold the lock of port {} addr {}", user.id().0, self.name, key),
        }
    }

    pub(crate) fn subscribe_exceptions<F>(&self, user: &AsynUser, key: i32, callback: F) -> AsynResult<SubscriptionHandle>
    where
        F: Fn(&AsynUser, Exception) + Send + Sync + 'static,
    {
        self.exceptions.subscribe(key, user, Box::new(callback))
    }

    /// Writes a free-form status report.
    pub(crate) fn report(&self, out: &mut dyn fmt::Write, level: u32) -> fmt::Result {
        let (devices, depths, owners, active, shutdown) = {
            let shared = self.state();
            let devices: Vec<(i32, DeviceStatus)> = shared.devices.iter().map(|(k, s)| (*k, *s)).collect();
            let depths = QueueLevel::ALL.map(|level| shared.queue.depth(level));
            (devices, depths, shared.locks.owners(), shared.active, shared.shutdown)
        };

        writeln!(
            out,
            "{} attributes:{:?} maxAddr:{} priority:{}{}",
            self.name,
            self.config.attributes,
            self.config.max_addr,
            self.config.priority,
            if shutdown { " (shut down)" } else { "" }
        )?;
        for (key, status) in &devices {
            writeln!(
                out,
                "    addr {:>3} connected:{} enabled:{} autoConnect:{}",
                key, status.connected, status.enabled, status.auto_connect
            )?;
        }
        writeln!(
            out,
            "    queued connect:{} high:{} medium:{} low:{}",
            depths[QueueLevel::Connect as usize],
            depths[QueueLevel::High as usize],
            depths[QueueLevel::Medium as usize],
            depths[QueueLevel::Low as usize],
        )?;
        if let Some(active) = active {
            writeln!(out, "    executing request {} of user {}", active.seq, active.user.0)?;
        }
        for (key, user, depth) in owners {
            writeln!(out, "    addr {} locked by user {} depth {}", key, user.0, depth)?;
        }

        if level >= 1 {
            for (addr, name, depth) in self.interfaces.entries() {
                writeln!(out, "    interface {} addr {} layers {}", name, addr, depth)?;
            }
            for (addr, name, count) in self.interrupts.counts() {
                writeln!(out, "    interrupt {} addr {} subscribers {}", name, addr, count)?;
            }
            writeln!(out, "    exception subscribers {}", self.exceptions.count())?;
            if let Ok(common) = self.interfaces.find::<dyn Common>(PORT_ADDR, true) {
                common.report(out, level)?;
            }
        }
        Ok(())
    }

    /// Disables the port, drops queued requests and stops the worker.
    pub(crate) fn shutdown(&self) {
        let drained = {
            let mut shared = self.state();
            if shared.shutdown {
                return;
            }
            shared.shutdown = true;
            shared.devices.disable_all();
            self.wake.notify_all();
            shared.queue.drain()
        };
        for request in &drained {
            if let Some(token) = request.timer {
                self.timer.cancel_timer(token);
            }
            if let RequestKind::Client { user, .. } = &request.kind {
                user.clear_queued();
            }
        }
        if !drained.is_empty() {
            debug!("port {}: dropped {} queued requests", self.name, drained.len());
        }
        drop(drained);

        self.announce(PORT_ADDR, Exception::Shutdown);
        let handle = guard(&self.worker).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        self.interrupts.clear();
        self.exceptions.clear();
        self.interfaces.clear();
        info!("port {} shut down", self.name);
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

/// Driver-side handle to a registered port.
///
/// Returned by [`register_port`](crate::AsynManager::register_port); the
/// driver keeps it to register interfaces, report connection changes and
/// distribute interrupts.
#[derive(Clone)]
pub struct PortHandle {
    port: Arc<Port>,
}

impl PortHandle {
    pub(crate) fn from_port(port: Arc<Port>) -> Self {
        Self { port }
    }

    /// Gets the port name.
    #[inline]
    pub fn name(&self) -> &str {
        self.port.name()
    }

    /// Gets the port configuration.
    #[inline]
    pub fn config(&self) -> &PortConfig {
        self.port.config()
    }

    /// Registers the driver's implementation of interface `T`.
    ///
    /// # Arguments
    ///
    /// * `addr` - Device address, or -1 for every address of the port.
    /// * `methods` - The implementation; it is also the driver context.
    ///
    /// # Errors
    ///
    /// `AlreadyRegistered` if `T` is already registered at `addr`; use
    /// [`interpose_interface`](Self::interpose_interface) to layer on top.
    pub fn register_interface<T: InterfaceType + ?Sized>(&self, addr: i32, methods: Arc<T>) -> AsynResult<Interface<T>> {
        self.port.check_addr(addr)?;
        let handle = self.port.interfaces.register(self.port.key(addr), methods)?;
        debug!("port {} registered {} at addr {}", self.name(), T::NAME, addr);
        Ok(handle)
    }

    /// Pushes `methods` on top of the stack of `T` at `addr` and returns the
    /// layer it now shadows, to which the new layer forwards.
    ///
    /// # Errors
    ///
    /// `NotFound` if `T` has no base registration for `addr` or the port.
    pub fn interpose_interface<T: InterfaceType + ?Sized>(&self, addr: i32, methods: Arc<T>) -> AsynResult<Interface<T>> {
        self.port.check_addr(addr)?;
        let (handle, previous) = self.port.interfaces.interpose(self.port.key(addr), methods)?;
        debug!(
            "port {} interposed {} at addr {} (layer {})",
            self.name(),
            T::NAME,
            addr,
            handle.depth()
        );
        Ok(previous)
    }

    /// Pushes the layer made by `build` on top of the stack of `T` at `addr`.
    ///
    /// `build` receives the layer being shadowed before the new one becomes
    /// visible to lookups, and must not register or look up interfaces.
    /// Returns the new top layer.
    ///
    /// # Errors
    ///
    /// `NotFound` if `T` has no base registration for `addr` or the port.
    pub fn interpose_interface_with<T, F>(&self, addr: i32, build: F) -> AsynResult<Interface<T>>
    where
        T: InterfaceType + ?Sized,
        F: FnOnce(Interface<T>) -> Arc<T>,
    {
        self.port.check_addr(addr)?;
        let (handle, _) = self.port.interfaces.interpose_with(self.port.key(addr), build)?;
        debug!(
            "port {} interposed {} at addr {} (layer {})",
            self.name(),
            T::NAME,
            addr,
            handle.depth()
        );
        Ok(handle)
    }

    /// Resolves interface `T` at `addr`.
    pub fn find_interface<T: InterfaceType + ?Sized>(&self, addr: i32, interpose_ok: bool) -> AsynResult<Interface<T>> {
        self.port.interfaces.find(self.port.key(addr), interpose_ok)
    }

    /// Reports that the port (`addr == -1`) or a device is now connected.
    ///
    /// # Errors
    ///
    /// `Error` if it was already connected, `BadAddress` for an invalid address.
    pub fn exception_connect(&self, addr: i32) -> AsynResult {
        self.port.exception_connect(addr)
    }

    /// Reports that the port or a device lost its connection.
    ///
    /// With autoconnect enabled a reconnect attempt is scheduled immediately
    /// and retried on a timer until it succeeds.
    pub fn exception_disconnect(&self, addr: i32) -> AsynResult {
        self.port.exception_disconnect(addr)
    }

    /// Delivers `value` to the interrupt subscribers of `T` at `addr`.
    ///
    /// Runs every callback in the calling thread, in registration order. With
    /// `reason` set only subscribers whose user carried that reason at
    /// registration are called. Returns the number of callbacks invoked.
    pub fn distribute<T: InterfaceType + ?Sized>(&self, addr: i32, reason: Option<i32>, value: &T::Value) -> usize {
        self.port.interrupts.distribute::<T>(self.port.key(addr), reason, value)
    }

    /// Whether `addr` and the port are connected.
    pub fn is_connected(&self, addr: i32) -> bool {
        self.port.state().devices.is_connected(self.port.key(addr))
    }

    /// Writes the port's status report.
    pub fn report(&self, out: &mut dyn fmt::Write, level: u32) -> fmt::Result {
        self.port.report(out, level)
    }
}

impl fmt::Debug for PortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PortHandle").field(&self.port.name()).finish()
    }
}
