//! Copy-on-iterate subscriber list.
//!
//! A distribution pass snapshots the list under its mutex and then invokes
//! each subscriber with the mutex released. Before every invocation the
//! subscriber's `live` flag is checked and the invocation is recorded as
//! running, both under the mutex; removal clears the flag under the same mutex
//! and then waits until no other thread is running that subscriber. Hence:
//!
//! - a subscriber added during a pass is not part of that pass,
//! - a subscriber removed during a pass may finish the invocation already in
//!   progress but is never invoked after the removal returns,
//! - a subscriber may remove itself from inside its own callback.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, ThreadId};

use crate::error::AsynResult;
use crate::lock::{guard, wait};
use crate::user::{AsynUser, UserId};

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

struct Subscriber<C: ?Sized> {
    id: u64,
    user: AsynUser,
    /// Reason captured from the user at registration.
    reason: i32,
    live: AtomicBool,
    callback: Box<C>,
}

struct ListState<C: ?Sized> {
    subscribers: Vec<Arc<Subscriber<C>>>,
    /// `(subscription id, thread)` of invocations in progress.
    running: Vec<(u64, ThreadId)>,
}

/// Ordered list of callbacks of type `C`.
pub(crate) struct SubscriberList<C: ?Sized> {
    state: Mutex<ListState<C>>,
    idle: Condvar,
}

impl<C: ?Sized> SubscriberList<C> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ListState {
                subscribers: Vec::new(),
                running: Vec::new(),
            }),
            idle: Condvar::new(),
        }
    }

    /// Appends a subscription owned by `user`.
    ///
    /// # Errors
    ///
    /// `AlreadyRegistered` if `user` already subscribes to this list.
    pub fn add(&self, user: &AsynUser, callback: Box<C>) -> AsynResult<u64> {
        let mut state = guard(&self.state);
        if state.subscribers.iter().any(|s| s.user.id() == user.id()) {
            return asyn_err!(user => AlreadyRegistered, "user {} already subscribed", user.id().0);
        }
        let id = NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed);
        state.subscribers.push(Arc::new(Subscriber {
            id,
            user: user.clone(),
            reason: user.reason(),
            live: AtomicBool::new(true),
            callback,
        }));
        Ok(id)
    }

    /// Removes subscription `id`, waiting for invocations of it on other
    /// threads to return.
    pub fn remove(&self, id: u64) -> AsynResult {
        let mut state = guard(&self.state);
        let Some(pos) = state.subscribers.iter().position(|s| s.id == id) else {
            return asyn_err!(NotFound, "subscription {} not registered", id);
        };
        let removed = state.subscribers.remove(pos);
        removed.live.store(false, Ordering::Release);

        let me = thread::current().id();
        while state.running.iter().any(|&(s, t)| s == id && t != me) {
            state = wait(&self.idle, state);
        }
        Ok(())
    }

    /// Invokes every live subscriber in registration order.
    ///
    /// With `reason` set, only subscribers registered with that reason are
    /// invoked. Returns the number of invocations that completed.
    pub fn distribute<F>(&self, reason: Option<i32>, mut invoke: F) -> usize
    where
        F: FnMut(&AsynUser, &C),
    {
        let snapshot: Vec<Arc<Subscriber<C>>> = guard(&self.state)
            .subscribers
            .iter()
            .filter(|s| reason.is_none_or(|r| s.reason == r))
            .cloned()
            .collect();

        let me = thread::current().id();
        let mut delivered = 0;
        for subscriber in snapshot {
            {
                let mut state = guard(&self.state);
                if !subscriber.live.load(Ordering::Acquire) {
                    continue;
                }
                state.running.push((subscriber.id, me));
            }
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                invoke(&subscriber.user, &subscriber.callback)
            }));
            {
                let mut state = guard(&self.state);
                if let Some(pos) = state
                    .running
                    .iter()
                    .position(|&(s, t)| s == subscriber.id && t == me)
                {
                    state.running.swap_remove(pos);
                }
            }
            self.idle.notify_all();
            match result {
                Ok(()) => delivered += 1,
                Err(_) => error!("subscriber {} panicked", subscriber.id),
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        guard(&self.state).subscribers.len()
    }

    /// Marks every subscriber dead and drops them.
    pub fn clear(&self) {
        let mut state = guard(&self.state);
        for s in state.subscribers.drain(..) {
            s.live.store(false, Ordering::Release);
        }
    }
}

/// Type-erased view of a [`SubscriberList`].
pub(crate) trait Subscribers: Send + Sync {
    fn unsubscribe(&self, id: u64) -> AsynResult;

    fn count(&self) -> usize;

    fn clear_all(&self);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<C: ?Sized + Send + Sync + 'static> Subscribers for SubscriberList<C> {
    fn unsubscribe(&self, id: u64) -> AsynResult {
        self.remove(id)
    }

    fn count(&self) -> usize {
        self.len()
    }

    fn clear_all(&self) {
        self.clear()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Handle returned by interrupt and exception registration.
///
/// Dropping the handle does not cancel the subscription.
#[derive(Clone)]
pub struct SubscriptionHandle {
    list: Weak<dyn Subscribers>,
    id: u64,
    user: UserId,
}

impl SubscriptionHandle {
    pub(crate) fn new(list: &Arc<dyn Subscribers>, id: u64, user: UserId) -> Self {
        Self {
            list: Arc::downgrade(list),
            id,
            user,
        }
    }

    /// Gets the subscription identifier.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Gets the subscribing user.
    #[inline]
    pub fn user(&self) -> UserId {
        self.user
    }

    /// Cancels the subscription.
    ///
    /// Once this returns the callback is not running on any other thread and
    /// will not be invoked again.
    ///
    /// # Errors
    ///
    /// `NotFound` if the subscription was already cancelled or its port shut
    /// down.
    pub fn cancel(&self) -> AsynResult {
        match self.list.upgrade() {
            Some(list) => list.unsubscribe(self.id),
            None => asyn_err!(NotFound, "subscription {} outlived its port", self.id),
        }
    }
}

impl core::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("user", &self.user)
            .finish()
    }
}
