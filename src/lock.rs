//! Exclusive-access bookkeeping for a port.
//!
//! Ownership is recorded per lock domain: the port itself, plus one domain per
//! device address when the driver declares per-device locking. A domain is
//! owned by at most one [`UserId`] and counts nested acquisitions by that
//! owner, so a user may lock again while already holding the lock (and the
//! worker may dispatch a request for the user holding an explicit lock).
//!
//! The table carries no synchronization of its own; it lives inside the
//! port's state mutex and waiters block on the port's condition variable.
//!
//! ```text
//!            per-device locking off          per-device locking on
//! addr -1    port domain                     port domain + every device
//! addr n     port domain                     port domain (must be free) + device n
//! ```

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::registry::PORT_ADDR;
use crate::user::UserId;

/// Locks `mutex`, recovering the data if a panicking thread poisoned it.
#[inline]
pub(crate) fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`Condvar::wait`] with poison recovery.
#[inline]
pub(crate) fn wait<'a, T>(cond: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

/// [`Condvar::wait_timeout`] with poison recovery.
#[inline]
pub(crate) fn wait_timeout<'a, T>(
    cond: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
) -> MutexGuard<'a, T> {
    match cond.wait_timeout(guard, timeout) {
        Ok((guard, _)) => guard,
        Err(poisoned) => poisoned.into_inner().0,
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Owner {
    user: Option<UserId>,
    depth: u32,
}

impl Owner {
    #[inline]
    fn admits(&self, user: UserId) -> bool {
        self.user.is_none_or(|owner| owner == user)
    }

    fn take(&mut self, user: UserId) {
        self.user = Some(user);
        self.depth += 1;
    }

    /// Returns `Some(true)` when the domain became free.
    fn give_back(&mut self, user: UserId) -> Option<bool> {
        if self.user != Some(user) {
            return None;
        }
        self.depth -= 1;
        if self.depth == 0 {
            self.user = None;
            Some(true)
        } else {
            Some(false)
        }
    }
}

/// Lock ownership of one port.
#[derive(Debug)]
pub(crate) struct LockTable {
    per_device: bool,
    port: Owner,
    devices: BTreeMap<i32, Owner>,
}

impl LockTable {
    pub fn new(per_device: bool) -> Self {
        Self {
            per_device,
            port: Owner::default(),
            devices: BTreeMap::new(),
        }
    }

    /// The device domain addressed by `addr`, if any.
    #[inline]
    fn device_domain(&self, addr: i32) -> Option<i32> {
        (self.per_device && addr != PORT_ADDR).then_some(addr)
    }

    /// Whether `user` could acquire the lock for `addr` now.
    pub fn is_available(&self, user: UserId, addr: i32) -> bool {
        if !self.port.admits(user) {
            return false;
        }
        match self.device_domain(addr) {
            Some(dev) => self.devices.get(&dev).is_none_or(|o| o.admits(user)),
            None => self.devices.values().all(|o| o.admits(user)),
        }
    }

    /// Records an acquisition; the caller has checked availability.
    pub fn acquire(&mut self, user: UserId, addr: i32) {
        debug_assert!(self.is_available(user, addr));
        match self.device_domain(addr) {
            Some(dev) => self.devices.entry(dev).or_default().take(user),
            None => self.port.take(user),
        }
    }

    /// Undoes one acquisition.
    ///
    /// Returns `None` if `user` does not own the domain, otherwise whether the
    /// domain became free.
    pub fn release(&mut self, user: UserId, addr: i32) -> Option<bool> {
        match self.device_domain(addr) {
            Some(dev) => {
                let freed = self.devices.get_mut(&dev)?.give_back(user)?;
                if freed {
                    self.devices.remove(&dev);
                }
                Some(freed)
            }
            None => self.port.give_back(user),
        }
    }

    /// Whether `user` owns any domain.
    pub fn holds_any(&self, user: UserId) -> bool {
        self.port.user == Some(user) || self.devices.values().any(|o| o.user == Some(user))
    }

    /// `(addr, owner, depth)` of every owned domain, for reports.
    pub fn owners(&self) -> Vec<(i32, UserId, u32)> {
        let port = self.port.user.map(|u| (PORT_ADDR, u, self.port.depth));
        port.into_iter()
            .chain(
                self.devices
                    .iter()
                    .filter_map(|(addr, o)| o.user.map(|u| (*addr, u, o.depth))),
            )
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: UserId = UserId(1);
    const B: UserId = UserId(2);

    #[test]
    fn test_lock_table_reentrant() {
        let mut table = LockTable::new(false);
        assert!(table.is_available(A, PORT_ADDR));
        table.acquire(A, PORT_ADDR);
        assert!(table.is_available(A, PORT_ADDR));
        table.acquire(A, PORT_ADDR);
        assert!(!table.is_available(B, PORT_ADDR));
        assert!(table.holds_any(A));

        assert_eq!(table.release(A, PORT_ADDR), Some(false));
        assert!(!table.is_available(B, PORT_ADDR));
        assert_eq!(table.release(A, PORT_ADDR), Some(true));
        assert!(table.is_available(B, PORT_ADDR));
        assert_eq!(table.release(A, PORT_ADDR), None);
    }

    #[test]
    fn test_lock_table_whole_port_without_per_device() {
        let mut table = LockTable::new(false);
        table.acquire(A, 3);
        // Without per-device locking every address maps to the port domain
        assert!(!table.is_available(B, 4));
        assert!(!table.is_available(B, PORT_ADDR));
        assert_eq!(table.release(B, 3), None);
        assert_eq!(table.release(A, 3), Some(true));
    }

    #[test]
    fn test_lock_table_per_device() {
        let mut table = LockTable::new(true);
        table.acquire(A, 1);
        assert!(table.is_available(B, 2));
        assert!(!table.is_available(B, 1));
        // The whole port needs every device free
        assert!(!table.is_available(B, PORT_ADDR));
        assert!(table.is_available(A, PORT_ADDR));

        table.acquire(B, 2);
        assert_eq!(table.owners(), vec![(1, A, 1), (2, B, 1)]);
        assert!(table.holds_any(B));

        table.release(A, 1);
        table.release(B, 2);
        table.acquire(A, PORT_ADDR);
        assert!(!table.is_available(B, 5));
        assert!(table.is_available(A, 5));
    }
}
