//! Per-port request queue.
//!
//! Requests are kept in one FIFO per priority level. Dispatch scans the levels
//! from highest to lowest and takes the first request that is eligible to run
//! now; a request waiting for a locked or disconnected device does not hold
//! up requests for other devices behind it.
//!
//! ## Types
//!
//! - [`Priority`]: levels available to clients
//! - `QueueLevel`: adds the `Connect` level reserved for autoconnect
//! - [`Request`]: the client's callback plus optional queue timeout
//! - `PendingRequest`: a queued entry with its sequence number

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::timer::TimerToken;
use crate::user::{AsynUser, UserId};

/// Client-visible request priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Background traffic.
    Low,
    /// Ordinary I/O.
    #[default]
    Medium,
    /// Latency-sensitive I/O.
    High,
}

/// Internal queue level; `Connect` outranks every client priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum QueueLevel {
    Low = 0,
    Medium = 1,
    High = 2,
    Connect = 3,
}

impl QueueLevel {
    pub const COUNT: usize = 4;

    pub const ALL: [QueueLevel; Self::COUNT] = [Self::Low, Self::Medium, Self::High, Self::Connect];

    #[inline]
    fn index(self) -> usize {
        self as usize
    }
}

impl From<Priority> for QueueLevel {
    fn from(priority: Priority) -> Self {
        match priority {
            Priority::Low => Self::Low,
            Priority::Medium => Self::Medium,
            Priority::High => Self::High,
        }
    }
}

type ProcessCallback = Box<dyn FnOnce(&AsynUser) + Send + 'static>;
type TimeoutCallback = Box<dyn FnOnce(&AsynUser) + Send + 'static>;

/// Work submitted with [`queue_request`](crate::AsynManager::queue_request).
///
/// The process callback runs with the port (or device) locked for the
/// submitting user. It is the only place a client may call interface methods
/// of a blocking port without an explicit lock.
///
/// ```rust,ignore
/// let request = Request::new(move |user| {
///     let _ = octet.write(user, b"*IDN?\n");
/// })
/// .with_timeout(Duration::from_secs(2), |user| {
///     warn!("request of {:?} timed out in queue", user);
/// });
/// manager.queue_request(&user, Priority::High, request)?;
/// ```
pub struct Request {
    process: ProcessCallback,
    timeout: Option<(Duration, TimeoutCallback)>,
}

impl Request {
    /// Creates a request that runs `process` when dispatched.
    pub fn new<F>(process: F) -> Self
    where
        F: FnOnce(&AsynUser) + Send + 'static,
    {
        Self {
            process: Box::new(process),
            timeout: None,
        }
    }

    /// Drops the request if it is still queued after `timeout`, running
    /// `on_timeout` instead of the process callback.
    ///
    /// On a port that cannot block the timeout bounds the wait for the lock.
    pub fn with_timeout<F>(mut self, timeout: Duration, on_timeout: F) -> Self
    where
        F: FnOnce(&AsynUser) + Send + 'static,
    {
        self.timeout = Some((timeout, Box::new(on_timeout)));
        self
    }

    /// Gets the queue timeout, if any.
    #[inline]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.as_ref().map(|(t, _)| *t)
    }

    /// Runs the process callback.
    pub(crate) fn process(self, user: &AsynUser) {
        (self.process)(user)
    }

    /// Runs the timeout callback, if any.
    pub(crate) fn expire(self, user: &AsynUser) {
        if let Some((_, on_timeout)) = self.timeout {
            on_timeout(user)
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request").field("timeout", &self.timeout()).finish()
    }
}

pub(crate) enum RequestKind {
    /// Client work submitted through `queue_request`.
    Client { user: AsynUser, request: Request },
    /// Internal autoconnect attempt, run as `user`.
    Connect { user: AsynUser },
}

/// A queued request.
pub(crate) struct PendingRequest {
    /// Insertion sequence number, unique per port.
    pub seq: u64,
    pub level: QueueLevel,
    /// Lock/status key the request targets.
    pub addr: i32,
    pub queued_at: Instant,
    /// Queue-timeout timer, cancelled on dispatch.
    pub timer: Option<TimerToken>,
    pub kind: RequestKind,
}

impl PendingRequest {
    /// The user the request runs as.
    #[inline]
    pub fn user(&self) -> &AsynUser {
        match &self.kind {
            RequestKind::Client { user, .. } | RequestKind::Connect { user } => user,
        }
    }

    #[inline]
    pub fn is_connect(&self) -> bool {
        matches!(self.kind, RequestKind::Connect { .. })
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("seq", &self.seq)
            .field("level", &self.level)
            .field("addr", &self.addr)
            .field("user", &self.user().id())
            .finish()
    }
}

/// FIFO per level, serviced highest level first.
pub(crate) struct RequestQueue {
    levels: [VecDeque<PendingRequest>; QueueLevel::COUNT],
}

impl RequestQueue {
    pub fn new() -> Self {
        Self {
            levels: Default::default(),
        }
    }

    /// Appends a request to the tail of its level.
    pub fn push(&mut self, request: PendingRequest) {
        self.levels[request.level.index()].push_back(request);
    }

    /// Removes and returns the first request accepted by `eligible`,
    /// scanning `Connect`, `High`, `Medium`, `Low`, each in FIFO order.
    pub fn take_first<F>(&mut self, mut eligible: F) -> Option<PendingRequest>
    where
        F: FnMut(&PendingRequest) -> bool,
    {
        for level in self.levels.iter_mut().rev() {
            if let Some(pos) = level.iter().position(&mut eligible) {
                return level.remove(pos);
            }
        }
        None
    }

    /// Removes the client request queued by `user`.
    pub fn remove_user(&mut self, user: UserId) -> Option<PendingRequest> {
        self.remove_where(|r| matches!(&r.kind, RequestKind::Client { user: u, .. } if u.id() == user))
    }

    /// Removes the request with sequence number `seq`.
    pub fn remove_seq(&mut self, seq: u64) -> Option<PendingRequest> {
        self.remove_where(|r| r.seq == seq)
    }

    fn remove_where<F>(&mut self, pred: F) -> Option<PendingRequest>
    where
        F: Fn(&PendingRequest) -> bool,
    {
        for level in self.levels.iter_mut() {
            if let Some(pos) = level.iter().position(&pred) {
                return level.remove(pos);
            }
        }
        None
    }

    /// Number of requests queued at `level`.
    pub fn depth(&self, level: QueueLevel) -> usize {
        self.levels[level.index()].len()
    }

    /// Removes every request, highest level first.
    pub fn drain(&mut self) -> Vec<PendingRequest> {
        self.levels.iter_mut().rev().flat_map(|level| level.drain(..)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn total(queue: &RequestQueue) -> usize {
        QueueLevel::ALL.iter().map(|&level| queue.depth(level)).sum()
    }

    fn pending(seq: u64, level: QueueLevel, addr: i32, user: &AsynUser) -> PendingRequest {
        PendingRequest {
            seq,
            level,
            addr,
            queued_at: Instant::now(),
            timer: None,
            kind: RequestKind::Client {
                user: user.clone(),
                request: Request::new(|_| ()),
            },
        }
    }

    #[test]
    fn test_queue_priority_then_fifo() {
        let mut queue = RequestQueue::new();
        let users: Vec<_> = (0..4).map(|_| AsynUser::new()).collect();
        queue.push(pending(0, QueueLevel::Low, -1, &users[0]));
        queue.push(pending(1, QueueLevel::High, -1, &users[1]));
        queue.push(pending(2, QueueLevel::High, -1, &users[2]));
        queue.push(PendingRequest {
            seq: 3,
            level: QueueLevel::Connect,
            addr: -1,
            queued_at: Instant::now(),
            timer: None,
            kind: RequestKind::Connect { user: users[3].clone() },
        });
        assert_eq!(total(&queue), 4);
        assert_eq!(queue.depth(QueueLevel::High), 2);

        let order: Vec<u64> = core::iter::from_fn(|| queue.take_first(|_| true))
            .map(|r| r.seq)
            .collect();
        assert_eq!(order, vec![3, 1, 2, 0]);
        assert_eq!(total(&queue), 0);
    }

    #[test]
    fn test_queue_skips_ineligible() {
        let mut queue = RequestQueue::new();
        let user = AsynUser::new();
        queue.push(pending(0, QueueLevel::High, 1, &user));
        queue.push(pending(1, QueueLevel::High, 2, &user));
        queue.push(pending(2, QueueLevel::Low, 1, &user));

        // Device 1 is busy: the device 2 request goes first
        let first = queue.take_first(|r| r.addr != 1).unwrap();
        assert_eq!(first.seq, 1);
        assert!(queue.take_first(|r| r.addr != 1).is_none());
        assert_eq!(total(&queue), 2);
    }

    #[test]
    fn test_queue_remove() {
        let mut queue = RequestQueue::new();
        let a = AsynUser::new();
        let b = AsynUser::new();
        queue.push(pending(0, QueueLevel::Medium, -1, &a));
        queue.push(pending(1, QueueLevel::Medium, -1, &b));

        assert_eq!(queue.remove_user(b.id()).map(|r| r.seq), Some(1));
        assert!(queue.remove_user(b.id()).is_none());
        assert_eq!(queue.remove_seq(0).map(|r| r.seq), Some(0));
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_priority_maps_below_connect() {
        assert!(QueueLevel::from(Priority::High) < QueueLevel::Connect);
        assert_eq!(QueueLevel::from(Priority::default()), QueueLevel::Medium);
        assert_eq!(QueueLevel::ALL.len(), QueueLevel::COUNT);
    }
}
