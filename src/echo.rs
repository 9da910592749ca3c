//! Loopback driver.
//!
//! [`EchoDriver`] stores what is written and returns it on read. It serves
//! as a reference driver for the manager and as a fixture for tests: each
//! I/O call can be slowed down by a fixed delay, and the first connect
//! attempts can be made to fail.
//!
//! Every completed write is distributed to the interrupt subscribers of the
//! written address.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use spin::Mutex;

use crate::error::AsynResult;
use crate::interfaces::{Common, EomReason, Int32, Octet};
use crate::port::PortHandle;
use crate::user::AsynUser;

/// Tunables of an [`EchoDriver`].
#[derive(Debug, Clone, Default)]
pub struct EchoOptions {
    /// Time every read, write and connect takes.
    pub delay: Duration,
    /// Number of initial connect attempts that fail.
    pub fail_connects: u32,
}

#[derive(Default)]
struct Device {
    data: Vec<u8>,
    value: i32,
}

/// Loopback driver implementing [`Common`], [`Octet`] and [`Int32`].
pub struct EchoDriver {
    port: PortHandle,
    delay: Duration,
    fail_connects: AtomicU32,
    connect_attempts: AtomicUsize,
    devices: Mutex<BTreeMap<i32, Device>>,
}

impl EchoDriver {
    pub fn new(port: PortHandle, options: EchoOptions) -> Arc<Self> {
        Arc::new(Self {
            port,
            delay: options.delay,
            fail_connects: AtomicU32::new(options.fail_connects),
            connect_attempts: AtomicUsize::new(0),
            devices: Mutex::new(BTreeMap::new()),
        })
    }

    /// Registers the driver's interfaces for every address of its port.
    pub fn register(self: &Arc<Self>) -> AsynResult {
        self.port
            .register_interface::<dyn Common>(-1, Arc::clone(self) as Arc<dyn Common>)?;
        self.port
            .register_interface::<dyn Octet>(-1, Arc::clone(self) as Arc<dyn Octet>)?;
        self.port
            .register_interface::<dyn Int32>(-1, Arc::clone(self) as Arc<dyn Int32>)?;
        Ok(())
    }

    /// Gets the port the driver serves.
    #[inline]
    pub fn port(&self) -> &PortHandle {
        &self.port
    }

    /// Number of connect calls so far, failed ones included.
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::Acquire)
    }

    /// Simulates a link drop at `addr`.
    pub fn drop_link(&self, addr: i32) -> AsynResult {
        self.port.exception_disconnect(addr)
    }

    fn pause(&self) {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
    }

    fn connected(&self, user: &AsynUser) -> AsynResult<i32> {
        let addr = user.addr()?;
        if !self.port.is_connected(addr) {
            return asyn_err!(user => Disconnected, "{} addr {} not connected", self.port.name(), addr);
        }
        Ok(addr)
    }
}

impl Common for EchoDriver {
    fn report(&self, out: &mut dyn fmt::Write, level: u32) -> fmt::Result {
        writeln!(out, "    echo delay:{:?} connect attempts:{}", self.delay, self.connect_attempts())?;
        if level > 1 {
            for (addr, device) in self.devices.lock().iter() {
                writeln!(out, "    addr {:>3} buffered:{} value:{}", addr, device.data.len(), device.value)?;
            }
        }
        Ok(())
    }

    fn connect(&self, user: &AsynUser) -> AsynResult {
        let addr = user.addr()?;
        self.connect_attempts.fetch_add(1, Ordering::AcqRel);
        self.pause();
        let failing = self
            .fail_connects
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return asyn_err!(user => Error, "{} addr {}: connect refused", self.port.name(), addr);
        }
        self.port.exception_connect(addr)
    }

    fn disconnect(&self, user: &AsynUser) -> AsynResult {
        let addr = user.addr()?;
        self.devices.lock().remove(&addr);
        self.port.exception_disconnect(addr)
    }
}

impl Octet for EchoDriver {
    fn write(&self, user: &AsynUser, data: &[u8]) -> AsynResult<usize> {
        let addr = self.connected(user)?;
        self.pause();
        self.devices
            .lock()
            .entry(addr)
            .or_default()
            .data
            .extend_from_slice(data);
        trace!("{} addr {} wrote {} bytes", self.port.name(), addr, data.len());
        self.port.distribute::<dyn Octet>(addr, None, data);
        Ok(data.len())
    }

    fn read(&self, user: &AsynUser, buf: &mut [u8]) -> AsynResult<(usize, EomReason)> {
        let addr = self.connected(user)?;
        self.pause();
        let mut devices = self.devices.lock();
        let device = devices.entry(addr).or_default();
        if device.data.is_empty() {
            return asyn_err!(user => Timeout, "{} addr {}: no data", self.port.name(), addr);
        }
        let n = buf.len().min(device.data.len());
        buf[..n].copy_from_slice(&device.data[..n]);
        device.data.drain(..n);
        let eom = if device.data.is_empty() {
            EomReason::END
        } else {
            EomReason::CNT
        };
        Ok((n, eom))
    }

    fn flush(&self, user: &AsynUser) -> AsynResult {
        let addr = user.addr()?;
        if let Some(device) = self.devices.lock().get_mut(&addr) {
            device.data.clear();
        }
        Ok(())
    }
}

impl Int32 for EchoDriver {
    fn write(&self, user: &AsynUser, value: i32) -> AsynResult {
        let addr = self.connected(user)?;
        self.pause();
        self.devices.lock().entry(addr).or_default().value = value;
        self.port.distribute::<dyn Int32>(addr, Some(user.reason()), &value);
        Ok(())
    }

    fn read(&self, user: &AsynUser) -> AsynResult<i32> {
        let addr = self.connected(user)?;
        self.pause();
        Ok(self.devices.lock().get(&addr).map_or(0, |device| device.value))
    }
}

impl fmt::Debug for EchoDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EchoDriver")
            .field("port", &self.port.name())
            .field("delay", &self.delay)
            .finish()
    }
}
