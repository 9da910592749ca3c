use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::lock::{guard, wait, wait_timeout};

/// Identifies a registered timer event.
pub(crate) type TimerToken = usize;

static TOKEN: AtomicUsize = AtomicUsize::new(1);

type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

struct TimerState {
    events: BTreeMap<(Instant, TimerToken), TimerCallback>,
    shutdown: bool,
}

/// One-shot timers served by a single background thread.
///
/// Used for request queue timeouts and autoconnect retries. Callbacks run on
/// the timer thread without the timer's own lock held, so they may register or
/// cancel timers and take port locks.
pub(crate) struct TimerQueue {
    state: Mutex<TimerState>,
    cond: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerQueue {
    /// Constructs a timer queue and starts its thread.
    pub fn new() -> Arc<Self> {
        let timer = Arc::new(Self {
            state: Mutex::new(TimerState {
                events: BTreeMap::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
            thread: Mutex::new(None),
        });
        let runner = Arc::clone(&timer);
        match thread::Builder::new()
            .name("asynTimer".into())
            .spawn(move || runner.run())
        {
            Ok(handle) => *guard(&timer.thread) = Some(handle),
            Err(e) => error!("failed to spawn timer thread: {}", e),
        }
        timer
    }

    /// Registers a callback to execute once `delay` has elapsed.
    ///
    /// # Returns
    /// A unique token that can be used to cancel this timer later
    pub fn register_timer<F>(&self, delay: Duration, handler: F) -> TimerToken
    where
        F: FnOnce() + Send + 'static,
    {
        let token = TOKEN.fetch_add(1, Ordering::Relaxed);
        let mut state = guard(&self.state);
        if state.shutdown {
            return token;
        }
        state.events.insert((Instant::now() + delay, token), Box::new(handler));
        self.cond.notify_one();
        token
    }

    /// Cancels a timer with the specified token.
    ///
    /// Returns `false` if the timer already fired or never existed.
    pub fn cancel_timer(&self, token: TimerToken) -> bool {
        let mut state = guard(&self.state);
        let key = state.events.keys().find(|(_, t)| *t == token).copied();
        key.and_then(|key| state.events.remove(&key)).is_some()
    }

    /// Number of timers waiting to fire.
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        guard(&self.state).events.len()
    }

    /// Drops every pending timer and joins the timer thread.
    pub fn shutdown(&self) {
        let dropped = {
            let mut state = guard(&self.state);
            state.shutdown = true;
            self.cond.notify_all();
            core::mem::take(&mut state.events)
        };
        drop(dropped);
        let handle = guard(&self.thread).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn run(&self) {
        let mut state = guard(&self.state);
        loop {
            if state.shutdown {
                break;
            }
            let now = Instant::now();
            let next = state.events.keys().next().copied();
            match next {
                Some(key) if key.0 <= now => {
                    let Some(event) = state.events.remove(&key) else {
                        continue;
                    };
                    drop(state);
                    trace!("timer {} expired", key.1);
                    if panic::catch_unwind(AssertUnwindSafe(event)).is_err() {
                        error!("timer callback {} panicked", key.1);
                    }
                    state = guard(&self.state);
                }
                Some((deadline, _)) => state = wait_timeout(&self.cond, state, deadline - now),
                None => state = wait(&self.cond, state),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_timer_fires_in_deadline_order() {
        let timer = TimerQueue::new();
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        timer.register_timer(Duration::from_millis(60), move || tx.send(2).unwrap());
        timer.register_timer(Duration::from_millis(10), move || tx2.send(1).unwrap());

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
        timer.shutdown();
    }

    #[test]
    fn test_timer_cancel() {
        let timer = TimerQueue::new();
        let (tx, rx) = mpsc::channel::<()>();
        let token = timer.register_timer(Duration::from_millis(50), move || tx.send(()).unwrap());
        assert_eq!(timer.pending(), 1);
        assert!(timer.cancel_timer(token));
        assert!(!timer.cancel_timer(token));
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
        timer.shutdown();
    }

    #[test]
    fn test_timer_survives_panicking_callback() {
        let timer = TimerQueue::new();
        let (tx, rx) = mpsc::channel();
        timer.register_timer(Duration::ZERO, || panic!("boom"));
        timer.register_timer(Duration::from_millis(20), move || tx.send(7).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 7);
        timer.shutdown();
        timer.register_timer(Duration::ZERO, || ());
        assert_eq!(timer.pending(), 0);
    }
}
