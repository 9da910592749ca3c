//! Exception callbacks: connection and configuration state changes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use spin::RwLock;

use super::subscribers::{SubscriberList, Subscribers, SubscriptionHandle};
use crate::error::AsynResult;
use crate::registry::PORT_ADDR;
use crate::user::AsynUser;

/// State change announced to exception subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exception {
    /// Connected state changed.
    Connect,
    /// Enabled state changed.
    Enable,
    /// Autoconnect policy changed.
    AutoConnect,
    /// The port is shutting down.
    Shutdown,
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Enable => "enable",
            Self::AutoConnect => "autoConnect",
            Self::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

type Callback = dyn Fn(&AsynUser, Exception) + Send + Sync;

/// One exception list per device key.
pub(crate) struct ExceptionRegistry {
    lists: RwLock<BTreeMap<i32, Arc<SubscriberList<Callback>>>>,
}

impl ExceptionRegistry {
    pub fn new() -> Self {
        Self {
            lists: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn subscribe(&self, key: i32, user: &AsynUser, callback: Box<Callback>) -> AsynResult<SubscriptionHandle> {
        let list = Arc::clone(
            self.lists
                .write()
                .entry(key)
                .or_insert_with(|| Arc::new(SubscriberList::new())),
        );
        let id = list.add(user, callback)?;
        let erased: Arc<dyn Subscribers> = list;
        Ok(SubscriptionHandle::new(&erased, id, user.id()))
    }

    /// Announces `exception` on `key`.
    ///
    /// With `fan_out` set, a port-level exception is also announced to every
    /// device list. Must be called without the port state locked.
    pub fn announce(&self, key: i32, exception: Exception, fan_out: bool) -> usize {
        let targets: Vec<Arc<SubscriberList<Callback>>> = {
            let lists = self.lists.read();
            if key == PORT_ADDR && fan_out {
                lists.values().cloned().collect()
            } else {
                lists.get(&key).cloned().into_iter().collect()
            }
        };
        trace!("announcing {} exception on addr {}", exception, key);
        targets
            .iter()
            .map(|list| list.distribute(None, |user, callback| callback(user, exception)))
            .sum()
    }

    /// Total number of exception subscribers.
    pub fn count(&self) -> usize {
        self.lists.read().values().map(|l| l.len()).sum()
    }

    pub fn clear(&self) {
        let lists = core::mem::take(&mut *self.lists.write());
        for list in lists.values() {
            list.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_exception_fan_out() {
        let registry = ExceptionRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for key in [PORT_ADDR, 0, 1] {
            let s = Arc::clone(&seen);
            registry
                .subscribe(key, &AsynUser::new(), Box::new(move |_, e| s.lock().unwrap().push((key, e))))
                .unwrap();
        }

        assert_eq!(registry.announce(1, Exception::Connect, true), 1);
        assert_eq!(registry.announce(PORT_ADDR, Exception::Enable, false), 1);
        assert_eq!(registry.announce(PORT_ADDR, Exception::Shutdown, true), 3);
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], (1, Exception::Connect));
        assert_eq!(seen[1], (PORT_ADDR, Exception::Enable));
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn test_exception_display() {
        assert_eq!(Exception::AutoConnect.to_string(), "autoConnect");
    }
}
