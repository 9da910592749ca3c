//! Interrupt subscriber lists of one port.

use std::collections::BTreeMap;
use std::sync::Arc;

use spin::RwLock;

use super::subscribers::{SubscriberList, Subscribers, SubscriptionHandle};
use crate::error::AsynResult;
use crate::interfaces::InterfaceType;
use crate::user::AsynUser;

/// Callback type of interrupt subscribers of interface `T`.
type Callback<T> = dyn Fn(&AsynUser, &<T as InterfaceType>::Value) + Send + Sync;

/// One subscriber list per `(addr, interface type)`, created on first use.
pub(crate) struct InterruptRegistry {
    lists: RwLock<BTreeMap<(i32, &'static str), Arc<dyn Subscribers>>>,
}

impl InterruptRegistry {
    pub fn new() -> Self {
        Self {
            lists: RwLock::new(BTreeMap::new()),
        }
    }

    fn typed<T: InterfaceType + ?Sized>(list: &Arc<dyn Subscribers>) -> Option<Arc<SubscriberList<Callback<T>>>> {
        Arc::clone(list).into_any().downcast().ok()
    }

    fn existing<T: InterfaceType + ?Sized>(&self, addr: i32) -> Option<Arc<SubscriberList<Callback<T>>>> {
        self.lists.read().get(&(addr, T::NAME)).and_then(Self::typed::<T>)
    }

    /// Adds `callback` for interrupts of `T` at `addr`.
    pub fn subscribe<T: InterfaceType + ?Sized>(
        &self,
        addr: i32,
        user: &AsynUser,
        callback: Box<Callback<T>>,
    ) -> AsynResult<SubscriptionHandle> {
        let erased = {
            let mut lists = self.lists.write();
            Arc::clone(lists.entry((addr, T::NAME)).or_insert_with(|| {
                let list: Arc<dyn Subscribers> = Arc::new(SubscriberList::<Callback<T>>::new());
                list
            }))
        };
        let Some(list) = Self::typed::<T>(&erased) else {
            return asyn_err!(user => NotFound, "{} interrupt list has a different type", T::NAME);
        };
        let id = list.add(user, callback)?;
        debug!("user {} subscribed to {} interrupts at addr {}", user.id().0, T::NAME, addr);
        Ok(SubscriptionHandle::new(&erased, id, user.id()))
    }

    /// Delivers `value` to the subscribers of `T` at `addr`.
    pub fn distribute<T: InterfaceType + ?Sized>(&self, addr: i32, reason: Option<i32>, value: &T::Value) -> usize {
        match self.existing::<T>(addr) {
            Some(list) => list.distribute(reason, |user, callback| callback(user, value)),
            None => 0,
        }
    }

    /// Lists `(addr, name, subscriber count)` for every non-empty list.
    pub fn counts(&self) -> Vec<(i32, &'static str, usize)> {
        self.lists
            .read()
            .iter()
            .map(|((addr, name), list)| (*addr, *name, list.count()))
            .filter(|(_, _, n)| *n > 0)
            .collect()
    }

    /// Drops every subscription.
    pub fn clear(&self) {
        let lists = core::mem::take(&mut *self.lists.write());
        for list in lists.values() {
            list.clear_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{Float64, Int32};
    use std::sync::Mutex;

    #[test]
    fn test_interrupts_keyed_by_addr_and_type() {
        let registry = InterruptRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        registry
            .subscribe::<dyn Int32>(1, &AsynUser::new(), Box::new(move |_, v| s.lock().unwrap().push(*v)))
            .unwrap();

        assert_eq!(registry.distribute::<dyn Int32>(1, None, &42), 1);
        assert_eq!(registry.distribute::<dyn Int32>(2, None, &43), 0);
        assert_eq!(registry.distribute::<dyn Float64>(1, None, &1.0), 0);
        assert_eq!(*seen.lock().unwrap(), vec![42]);
        assert_eq!(registry.counts(), vec![(1, "asynInt32", 1)]);
    }

    #[test]
    fn test_interrupt_handle_cancel() {
        let registry = InterruptRegistry::new();
        let handle = registry
            .subscribe::<dyn Int32>(-1, &AsynUser::new(), Box::new(|_, _| ()))
            .unwrap();
        assert_eq!(registry.distribute::<dyn Int32>(-1, None, &1), 1);
        handle.cancel().unwrap();
        assert_eq!(registry.distribute::<dyn Int32>(-1, None, &1), 0);
        assert!(handle.cancel().is_err());

        let handle = registry
            .subscribe::<dyn Int32>(-1, &AsynUser::new(), Box::new(|_, _| ()))
            .unwrap();
        registry.clear();
        assert_eq!(handle.cancel(), Err(crate::AsynError::NotFound));
    }
}
