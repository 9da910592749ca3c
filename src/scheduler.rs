//! Request dispatch and autoconnect.
//!
//! A port that can block owns one worker thread. The worker sleeps on the
//! port's condition variable until a request is eligible, takes it out of the
//! queue, locks its address for the request's user, releases the state mutex
//! and runs the callback. A port that cannot block has no worker: requests run
//! in the caller's thread under the same lock protocol.
//!
//! ```text
//!   queue_request ──▶ Queued ──dispatch──▶ Dispatched ──▶ Completed
//!                       │                  (lock held)
//!                       ├── cancel_request ─▶ Cancelled
//!                       └── queue timeout ──▶ on_timeout
//! ```
//!
//! Autoconnect is the only retry the core performs: a disconnected port or
//! device with autoconnect enabled gets a `Connect`-level request, and every
//! failed attempt re-arms a timer for the next one.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{AsynResult, CancelStatus};
use crate::interfaces::Common;
use crate::lock::{guard, wait};
use crate::port::{Active, DeviceTable, Port, PortShared};
use crate::queue::{PendingRequest, Priority, QueueLevel, Request, RequestKind};
use crate::registry::PORT_ADDR;
use crate::user::AsynUser;

impl Port {
    /// Spawns the worker thread of a port that can block.
    pub(crate) fn start_worker(self: &Arc<Self>) -> AsynResult {
        let port = Arc::clone(self);
        let mut builder = thread::Builder::new().name(self.name().to_owned());
        if let Some(stack_size) = self.config().stack_size {
            builder = builder.stack_size(stack_size);
        }
        match builder.spawn(move || port.run_worker()) {
            Ok(handle) => {
                *guard(&self.worker) = Some(handle);
                Ok(())
            }
            Err(e) => asyn_err!(Error, "cannot spawn worker of port {}: {}", self.name(), e),
        }
    }

    /// Submits `request` for `user` on address key `key`.
    ///
    /// # Errors
    ///
    /// - `AlreadyQueued` if the user has a request outstanding.
    /// - `Disabled` if the port or device is disabled or shut down.
    /// - `Disconnected` if it is disconnected and will not reconnect on its own.
    pub(crate) fn queue_request(&self, user: &AsynUser, key: i32, priority: Priority, request: Request) -> AsynResult {
        if !user.try_mark_queued() {
            return asyn_err!(user => AlreadyQueued, "user {} already has a request queued", user.id().0);
        }
        if self.config().can_block() {
            let result = self.enqueue(user, key, priority.into(), request);
            if result.is_err() {
                user.clear_queued();
            }
            result
        } else {
            let result = self.run_now(user, key, request);
            if result.is_err() {
                user.clear_queued();
            }
            result
        }
    }

    fn enqueue(&self, user: &AsynUser, key: i32, level: QueueLevel, request: Request) -> AsynResult {
        let mut shared = self.state();
        if shared.shutdown {
            return asyn_err!(user => Disabled, "port {} has been shut down", self.name());
        }
        if !shared.devices.is_enabled(key) {
            return asyn_err!(user => Disabled, "port {} addr {} disabled", self.name(), key);
        }
        if !shared.devices.is_connected(key) {
            if !shared.devices.can_auto_connect(key) {
                return asyn_err!(user => Disconnected, "port {} addr {} not connected", self.name(), key);
            }
            self.request_connect(&mut shared, key);
        }

        let seq = shared.next_seq();
        let timer = request.timeout().map(|timeout| {
            let port = self.this.clone();
            self.timer.register_timer(timeout, move || {
                if let Some(port) = port.upgrade() {
                    port.expire_request(seq);
                }
            })
        });
        shared.queue.push(PendingRequest {
            seq,
            level,
            addr: key,
            queued_at: Instant::now(),
            timer,
            kind: RequestKind::Client {
                user: user.clone(),
                request,
            },
        });
        trace!("port {}: queued request {} of user {} at {:?}", self.name(), seq, user.id().0, level);
        self.wake.notify_all();
        Ok(())
    }

    /// Runs a request synchronously for a port that cannot block.
    ///
    /// Frees the user's queued slot before the callback runs; on `Err` the
    /// caller frees it.
    fn run_now(&self, user: &AsynUser, key: i32, request: Request) -> AsynResult {
        {
            let shared = self.state();
            if shared.shutdown {
                return asyn_err!(user => Disabled, "port {} has been shut down", self.name());
            }
            if !shared.devices.is_enabled(key) {
                return asyn_err!(user => Disabled, "port {} addr {} disabled", self.name(), key);
            }
        }

        let deadline = request.timeout().map(|timeout| Instant::now() + timeout);
        match self.acquire(user, key, deadline) {
            Ok(()) => {}
            Err(crate::AsynError::Timeout) => {
                debug!("port {}: request of user {} timed out waiting for the lock", self.name(), user.id().0);
                user.clear_queued();
                Self::guarded(self.name(), user, |user| request.expire(user));
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let (connected, auto) = {
            let shared = self.state();
            (shared.devices.is_connected(key), shared.devices.can_auto_connect(key))
        };
        if !connected && auto {
            if let Some(connect_user) = self.internal_user(key) {
                self.attempt_connect(&connect_user, key);
            }
        }
        let (seq, outer) = {
            let mut shared = self.state();
            if !shared.devices.is_connected(key) {
                drop(shared);
                let _ = self.release(user, key);
                return asyn_err!(user => Disconnected, "port {} addr {} not connected", self.name(), key);
            }
            let seq = shared.next_seq();
            let outer = shared.active.replace(Active { user: user.id(), seq });
            user.clear_queued();
            (seq, outer)
        };

        trace!("port {}: running request {} of user {}", self.name(), seq, user.id().0);
        Self::guarded(self.name(), user, |user| request.process(user));
        self.finish(user, key, outer);
        Ok(())
    }

    fn run_worker(self: Arc<Self>) {
        debug!("port {}: worker started", self.name());
        let mut shared = self.state();
        loop {
            if shared.shutdown {
                break;
            }
            let next = {
                let PortShared {
                    queue, locks, devices, ..
                } = &mut *shared;
                queue.take_first(|r| {
                    locks.is_available(r.user().id(), r.addr) && (r.is_connect() || devices.is_ready(r.addr))
                })
            };
            let Some(pending) = next else {
                shared = wait(&self.wake, shared);
                continue;
            };

            if let Some(token) = pending.timer {
                self.timer.cancel_timer(token);
            }
            let user = pending.user().clone();
            let key = pending.addr;
            shared.locks.acquire(user.id(), key);
            shared.active = Some(Active {
                user: user.id(),
                seq: pending.seq,
            });
            if pending.is_connect() {
                shared.devices.status_mut(key).connect_pending = false;
            } else {
                // Dequeued: the callback may queue the next request
                user.clear_queued();
            }
            drop(shared);

            let waited = pending.queued_at.elapsed();
            match pending.kind {
                RequestKind::Client { user, request } => {
                    trace!(
                        "port {}: dispatching request {} of user {} after {:?}",
                        self.name(),
                        pending.seq,
                        user.id().0,
                        waited
                    );
                    Self::guarded(self.name(), &user, |user| request.process(user));
                    self.finish(&user, key, None);
                }
                RequestKind::Connect { user } => {
                    self.attempt_connect(&user, key);
                    self.finish(&user, key, None);
                }
            }
            shared = self.state();
        }
        debug!("port {}: worker exiting", self.name());
    }

    /// Releases the per-request lock and restores the active marker to
    /// `outer`, the request this one ran inside of, if any.
    fn finish(&self, user: &AsynUser, key: i32, outer: Option<Active>) {
        let mut shared = self.state();
        shared.locks.release(user.id(), key);
        shared.active = outer;
        self.wake.notify_all();
    }

    fn guarded<F>(port: &str, user: &AsynUser, callback: F)
    where
        F: FnOnce(&AsynUser),
    {
        if panic::catch_unwind(AssertUnwindSafe(|| callback(user))).is_err() {
            error!("port {}: callback of user {} panicked", port, user.id().0);
        }
    }

    /// Removes a request whose queue timeout expired and runs its timeout callback.
    fn expire_request(&self, seq: u64) {
        let expired = self.state().queue.remove_seq(seq);
        if let Some(PendingRequest {
            kind: RequestKind::Client { user, request },
            ..
        }) = expired
        {
            debug!("port {}: request {} of user {} timed out in queue", self.name(), seq, user.id().0);
            user.clear_queued();
            Self::guarded(self.name(), &user, |user| request.expire(user));
        }
    }

    /// Removes the request queued by `user`, if it has not started.
    pub(crate) fn cancel_request(&self, user: &AsynUser) -> CancelStatus {
        let mut shared = self.state();
        if let Some(pending) = shared.queue.remove_user(user.id()) {
            if let Some(token) = pending.timer {
                self.timer.cancel_timer(token);
            }
            drop(shared);
            user.clear_queued();
            debug!("port {}: cancelled request {} of user {}", self.name(), pending.seq, user.id().0);
            return CancelStatus::Cancelled;
        }
        match shared.active {
            Some(active) if active.user == user.id() => CancelStatus::CallbackActive,
            _ => CancelStatus::NotQueued,
        }
    }

    /// Schedules a connect attempt for every key in the chain of `key` that is
    /// disconnected, enabled and set to autoconnect.
    pub(crate) fn request_connect(&self, shared: &mut PortShared, key: i32) {
        for k in DeviceTable::chain(key) {
            let status = shared.devices.status(k);
            if !status.connected && status.auto_connect && status.enabled {
                self.schedule_connect(shared, k);
            }
        }
    }

    fn schedule_connect(&self, shared: &mut PortShared, key: i32) {
        if shared.shutdown {
            return;
        }
        let status = shared.devices.status_mut(key);
        if status.connected || status.connect_pending {
            return;
        }
        status.connect_pending = true;

        if self.config().can_block() {
            let Some(user) = self.internal_user(key) else {
                return;
            };
            let seq = shared.next_seq();
            shared.queue.push(PendingRequest {
                seq,
                level: QueueLevel::Connect,
                addr: key,
                queued_at: Instant::now(),
                timer: None,
                kind: RequestKind::Connect { user },
            });
            trace!("port {}: queued connect {} for addr {}", self.name(), seq, key);
            self.wake.notify_all();
        } else {
            let port = self.this.clone();
            self.timer.register_timer(Duration::ZERO, move || {
                if let Some(port) = port.upgrade() {
                    port.run_connect(key);
                }
            });
        }
    }

    /// Connect attempt of a port that cannot block, run on the timer thread.
    fn run_connect(&self, key: i32) {
        {
            let mut shared = self.state();
            shared.devices.status_mut(key).connect_pending = false;
            if shared.shutdown || shared.devices.status(key).connected {
                return;
            }
        }
        let Some(user) = self.internal_user(key) else {
            return;
        };
        let deadline = Instant::now() + user.timeout();
        if self.acquire(&user, key, Some(deadline)).is_err() {
            self.arm_retry(key);
            return;
        }
        self.attempt_connect(&user, key);
        let _ = self.release(&user, key);
    }

    /// Calls the driver's `connect` for the port and then for `key`.
    ///
    /// The caller holds the lock of `key`. Returns whether `key` is connected
    /// afterwards; a failed attempt arms the retry timer.
    pub(crate) fn attempt_connect(&self, user: &AsynUser, key: i32) -> bool {
        if key != PORT_ADDR && !self.state().devices.status(PORT_ADDR).connected {
            let Some(port_user) = self.internal_user(PORT_ADDR) else {
                return false;
            };
            if !self.connect_once(&port_user, PORT_ADDR) {
                self.arm_retry(key);
                return false;
            }
        }
        self.connect_once(user, key)
    }

    fn connect_once(&self, user: &AsynUser, key: i32) -> bool {
        if self.state().devices.status(key).connected {
            return true;
        }
        let common = match self.interfaces.find::<dyn Common>(key, true) {
            Ok(common) => common,
            Err(_) => {
                warn!("port {}: no asynCommon interface, cannot connect addr {}", self.name(), key);
                return false;
            }
        };
        user.clear_error_message();
        match common.connect(user) {
            Ok(()) => {
                let connected = self.state().devices.status(key).connected;
                if !connected {
                    warn!("port {} addr {}: connect succeeded without exception_connect", self.name(), key);
                }
                connected
            }
            Err(e) => {
                warn!(
                    "port {} addr {}: connect failed: {} {}",
                    self.name(),
                    key,
                    e,
                    user.error_message()
                );
                self.arm_retry(key);
                false
            }
        }
    }

    /// Arms the reconnect timer of `key` unless it is already running.
    fn arm_retry(&self, key: i32) {
        let mut shared = self.state();
        if shared.shutdown {
            return;
        }
        let status = shared.devices.status_mut(key);
        if status.connected || !status.auto_connect || !status.enabled || status.retry_armed {
            return;
        }
        status.retry_armed = true;
        let port = self.this.clone();
        debug!("port {} addr {}: reconnect in {:?}", self.name(), key, self.reconnect_interval);
        self.timer.register_timer(self.reconnect_interval, move || {
            if let Some(port) = port.upgrade() {
                port.retry_connect(key);
            }
        });
    }

    fn retry_connect(&self, key: i32) {
        let mut shared = self.state();
        shared.devices.status_mut(key).retry_armed = false;
        self.request_connect(&mut shared, key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PortAttributes, PortConfig};
    use crate::timer::TimerQueue;
    use std::sync::Mutex;
    use std::sync::mpsc;

    fn blocking_port() -> (Arc<Port>, Arc<TimerQueue>) {
        let timer = TimerQueue::new();
        let config = PortConfig::new(PortAttributes::CAN_BLOCK).with_auto_connect(false);
        let port = Port::new("S", config, Duration::from_secs(20), Arc::clone(&timer));
        port.start_worker().unwrap();
        (port, timer)
    }

    fn inline_port() -> (Arc<Port>, Arc<TimerQueue>) {
        let timer = TimerQueue::new();
        let config = PortConfig::new(PortAttributes::NONE).with_auto_connect(false);
        let port = Port::new("I", config, Duration::from_secs(20), Arc::clone(&timer));
        port.exception_connect(PORT_ADDR).unwrap();
        (port, timer)
    }

    fn bound_user(port: &Arc<Port>) -> AsynUser {
        let user = AsynUser::new();
        user.bind(Arc::clone(port), PORT_ADDR);
        user
    }

    /// A request that reports `left` and queues the next one until zero.
    fn countdown(port: Arc<Port>, left: u32, tx: mpsc::Sender<u32>) -> Request {
        Request::new(move |user| {
            tx.send(left).unwrap();
            if left > 0 {
                let next = countdown(Arc::clone(&port), left - 1, tx.clone());
                port.queue_request(user, PORT_ADDR, Priority::Medium, next).unwrap();
            }
        })
    }

    #[test]
    fn test_queue_request_disconnected_without_autoconnect() {
        let (port, timer) = blocking_port();
        let user = bound_user(&port);
        let result = port.queue_request(&user, PORT_ADDR, Priority::Low, Request::new(|_| ()));
        assert_eq!(result, Err(crate::AsynError::Disconnected));
        assert!(!user.is_queued());
        port.shutdown();
        timer.shutdown();
    }

    #[test]
    fn test_worker_runs_requests_with_lock_held() {
        let (port, timer) = blocking_port();
        port.exception_connect(PORT_ADDR).unwrap();
        let user = bound_user(&port);
        let (tx, rx) = mpsc::channel();
        let p = Arc::clone(&port);
        port.queue_request(
            &user,
            PORT_ADDR,
            Priority::Medium,
            Request::new(move |user| {
                let shared = p.state();
                let held = shared.locks.holds_any(user.id()) && shared.active.is_some_and(|a| a.user == user.id());
                tx.send(held).unwrap();
            }),
        )
        .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        port.shutdown();
        timer.shutdown();
    }

    #[test]
    fn test_callback_queues_next_request() {
        let (port, timer) = blocking_port();
        port.exception_connect(PORT_ADDR).unwrap();
        let user = bound_user(&port);
        let (tx, rx) = mpsc::channel();
        port.queue_request(&user, PORT_ADDR, Priority::Medium, countdown(Arc::clone(&port), 3, tx))
            .unwrap();
        let seen: Vec<u32> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(seen, vec![3, 2, 1, 0]);
        port.shutdown();
        timer.shutdown();
    }

    #[test]
    fn test_inline_callback_queues_next_request() {
        let (port, timer) = inline_port();
        let user = bound_user(&port);
        let (tx, rx) = mpsc::channel();
        port.queue_request(&user, PORT_ADDR, Priority::Medium, countdown(Arc::clone(&port), 3, tx))
            .unwrap();
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![3, 2, 1, 0]);
        assert!(!user.is_queued());
        assert!(port.state().active.is_none());
        assert!(!port.state().locks.holds_any(user.id()));
        timer.shutdown();
    }

    #[test]
    fn test_slot_free_once_callback_signals() {
        let (port, timer) = blocking_port();
        port.exception_connect(PORT_ADDR).unwrap();
        let user = bound_user(&port);
        let (tx, rx) = mpsc::channel();
        for _ in 0..500 {
            let tx = tx.clone();
            port.queue_request(&user, PORT_ADDR, Priority::High, Request::new(move |_| tx.send(()).unwrap()))
                .unwrap();
            rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert!(!user.is_queued());
            assert!(matches!(
                port.cancel_request(&user),
                CancelStatus::NotQueued | CancelStatus::CallbackActive
            ));
        }
        port.shutdown();
        timer.shutdown();
    }

    #[test]
    fn test_cancel_reports_running_callback() {
        let (port, timer) = blocking_port();
        port.exception_connect(PORT_ADDR).unwrap();
        let user = bound_user(&port);
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        port.queue_request(
            &user,
            PORT_ADDR,
            Priority::Medium,
            Request::new(move |_| {
                entered_tx.send(()).unwrap();
                let _ = release_rx.recv_timeout(Duration::from_secs(2));
            }),
        )
        .unwrap();
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!user.is_queued());
        assert_eq!(port.cancel_request(&user), CancelStatus::CallbackActive);
        release_tx.send(()).unwrap();
        port.shutdown();
        timer.shutdown();
    }

    #[test]
    fn test_panicking_callback_releases_port() {
        let (port, timer) = blocking_port();
        port.exception_connect(PORT_ADDR).unwrap();
        let a = bound_user(&port);
        let b = bound_user(&port);
        port.queue_request(&a, PORT_ADDR, Priority::High, Request::new(|_| panic!("driver fault")))
            .unwrap();
        let (tx, rx) = mpsc::channel();
        port.queue_request(&b, PORT_ADDR, Priority::Low, Request::new(move |_| tx.send(()).unwrap()))
            .unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!a.is_queued());
        port.shutdown();
        timer.shutdown();
    }

    #[test]
    fn test_queue_timeout_runs_timeout_callback() {
        let (port, timer) = blocking_port();
        port.exception_connect(PORT_ADDR).unwrap();
        let holder = bound_user(&port);
        port.acquire(&holder, PORT_ADDR, None).unwrap();

        let user = bound_user(&port);
        let (tx, rx) = mpsc::channel();
        let ran = Arc::new(Mutex::new(false));
        let r = Arc::clone(&ran);
        port.queue_request(
            &user,
            PORT_ADDR,
            Priority::Medium,
            Request::new(move |_| *r.lock().unwrap() = true)
                .with_timeout(Duration::from_millis(50), move |_| tx.send(()).unwrap()),
        )
        .unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!*ran.lock().unwrap());
        assert!(!user.is_queued());
        assert_eq!(port.cancel_request(&user), CancelStatus::NotQueued);

        port.release(&holder, PORT_ADDR).unwrap();
        port.shutdown();
        timer.shutdown();
    }

    #[test]
    fn test_shutdown_drops_queued_requests() {
        let (port, timer) = blocking_port();
        let holder = bound_user(&port);
        port.exception_connect(PORT_ADDR).unwrap();
        port.acquire(&holder, PORT_ADDR, None).unwrap();
        let user = bound_user(&port);
        port.queue_request(&user, PORT_ADDR, Priority::Low, Request::new(|_| ()))
            .unwrap();
        assert!(user.is_queued());
        port.shutdown();
        assert!(!user.is_queued());
        let result = port.queue_request(&user, PORT_ADDR, Priority::Low, Request::new(|_| ()));
        assert_eq!(result, Err(crate::AsynError::Disabled));
        timer.shutdown();
    }
}
