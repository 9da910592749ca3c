//! Interruptible blocking system calls.
//!
//! A driver arms an [`InterruptibleSyscall`] with the descriptor and thread of
//! a slow `read`/`recv` before issuing it. Another thread (typically a timeout
//! or cancellation path) calls [`interrupt`](InterruptibleSyscall::interrupt)
//! to force the call to return, using the mechanism that works on this
//! platform:
//!
//! | mechanism          | action                                 | descriptor afterwards |
//! |--------------------|----------------------------------------|-----------------------|
//! | `SignalRequired`   | `pthread_kill(thread, SIGALRM)`        | usable                |
//! | `ShutdownRequired` | `shutdown(fd, SHUT_RDWR)`              | shut down             |
//! | `CloseRequired`    | `shutdown` then `close(fd)`            | closed, never reuse   |
//!
//! The platform mechanism is queried once per process.

use std::os::fd::RawFd;
use std::sync::{Mutex, Once, OnceLock};

use crate::lock::guard;

/// How a blocked socket call is forced to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptMechanism {
    /// Send a thread-directed `SIGALRM`; the call fails with `EINTR`.
    SignalRequired,
    /// Shut the socket down for reading and writing.
    ShutdownRequired,
    /// Shutdown alone does not wake the caller; close the descriptor.
    CloseRequired,
}

impl InterruptMechanism {
    /// The mechanism for this platform.
    pub fn platform() -> Self {
        static MECHANISM: OnceLock<InterruptMechanism> = OnceLock::new();
        *MECHANISM.get_or_init(|| {
            let mechanism = detect();
            debug!("interruptible syscalls use {:?}", mechanism);
            mechanism
        })
    }
}

fn detect() -> InterruptMechanism {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            InterruptMechanism::ShutdownRequired
        } else if #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
        ))] {
            InterruptMechanism::CloseRequired
        } else {
            InterruptMechanism::SignalRequired
        }
    }
}

extern "C" fn wake_handler(_signal: libc::c_int) {}

/// Installs a no-op `SIGALRM` handler without `SA_RESTART`, so a signalled
/// call returns `EINTR` instead of resuming.
fn install_wake_handler() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // SAFETY: `action` is fully initialized before use and the handler is
        // async-signal-safe (it does nothing).
        let rc = unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = wake_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
            libc::sigemptyset(&mut action.sa_mask);
            action.sa_flags = 0;
            libc::sigaction(libc::SIGALRM, &action, std::ptr::null_mut())
        };
        if rc != 0 {
            warn!("cannot install SIGALRM handler: {}", std::io::Error::last_os_error());
        }
    });
}

/// What [`InterruptibleSyscall::interrupt`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// The mechanism was applied to the armed call.
    Delivered,
    /// Already interrupted since the last arm; nothing was done.
    Repeated,
    /// Not armed; nothing was done.
    Disarmed,
}

#[derive(Clone, Copy)]
struct ThreadHandle(libc::pthread_t);

// SAFETY: a pthread_t is an identifier only used as the target of pthread_kill.
unsafe impl Send for ThreadHandle {}

struct ArmState {
    fd: Option<RawFd>,
    thread: Option<ThreadHandle>,
    interrupted: bool,
    closed: bool,
}

/// Interrupt context of one blocking I/O thread.
pub struct InterruptibleSyscall {
    mechanism: InterruptMechanism,
    state: Mutex<ArmState>,
}

impl InterruptibleSyscall {
    /// Creates a context using the platform mechanism.
    pub fn new() -> Self {
        Self::with_mechanism(InterruptMechanism::platform())
    }

    /// Creates a context using `mechanism`.
    pub fn with_mechanism(mechanism: InterruptMechanism) -> Self {
        if mechanism == InterruptMechanism::SignalRequired {
            install_wake_handler();
        }
        Self {
            mechanism,
            state: Mutex::new(ArmState {
                fd: None,
                thread: None,
                interrupted: false,
                closed: false,
            }),
        }
    }

    #[inline]
    pub fn mechanism(&self) -> InterruptMechanism {
        self.mechanism
    }

    /// Associates the context with `fd` and the thread that will block on it.
    ///
    /// Clears the interrupted and closed flags.
    pub fn arm(&self, fd: RawFd, thread: libc::pthread_t) {
        let mut state = guard(&self.state);
        state.fd = Some(fd);
        state.thread = Some(ThreadHandle(thread));
        state.interrupted = false;
        state.closed = false;
    }

    /// Arms the context for `fd` and the calling thread.
    pub fn arm_current(&self, fd: RawFd) {
        // SAFETY: pthread_self has no preconditions.
        let thread = unsafe { libc::pthread_self() };
        self.arm(fd, thread)
    }

    /// Detaches the context after the call returned.
    ///
    /// A later [`interrupt`](Self::interrupt) is a no-op; the flags keep their
    /// values until the next arm.
    pub fn disarm(&self) {
        let mut state = guard(&self.state);
        state.fd = None;
        state.thread = None;
    }

    /// Forces the armed thread out of its blocking call.
    ///
    /// Interrupting a disarmed context does nothing. Interrupting twice
    /// before rearming is tolerated and logged, including after
    /// `CloseRequired` gave the descriptor up.
    pub fn interrupt(&self) -> InterruptOutcome {
        let mut state = guard(&self.state);
        if state.thread.is_none() {
            debug!("interrupt of a disarmed syscall context ignored");
            return InterruptOutcome::Disarmed;
        }
        if state.interrupted {
            warn!("syscall on fd {:?} interrupted twice before rearm", state.fd);
            return InterruptOutcome::Repeated;
        }
        let Some(fd) = state.fd else {
            debug!("interrupt of a syscall context without descriptor ignored");
            return InterruptOutcome::Disarmed;
        };
        state.interrupted = true;

        match self.mechanism {
            InterruptMechanism::SignalRequired => {
                if let Some(thread) = state.thread {
                    // SAFETY: the thread was alive when armed; a stale id
                    // makes pthread_kill fail with ESRCH.
                    let rc = unsafe { libc::pthread_kill(thread.0, libc::SIGALRM) };
                    if rc != 0 {
                        debug!("pthread_kill failed: {}", std::io::Error::from_raw_os_error(rc));
                    }
                }
            }
            InterruptMechanism::ShutdownRequired => {
                // SAFETY: shutting down a descriptor the caller armed us with.
                if unsafe { libc::shutdown(fd, libc::SHUT_RDWR) } != 0 {
                    debug!("shutdown of fd {} failed: {}", fd, std::io::Error::last_os_error());
                }
            }
            InterruptMechanism::CloseRequired => {
                // SAFETY: ownership of the descriptor is taken over here; the
                // caller learns it through `was_closed`.
                unsafe {
                    libc::shutdown(fd, libc::SHUT_RDWR);
                    libc::close(fd);
                }
                state.closed = true;
                state.fd = None;
            }
        }
        InterruptOutcome::Delivered
    }

    /// Whether an interrupt was delivered since the last arm.
    pub fn was_interrupted(&self) -> bool {
        guard(&self.state).interrupted
    }

    /// Whether the interrupt closed the descriptor; it must not be used again.
    pub fn was_closed(&self) -> bool {
        guard(&self.state).closed
    }
}

impl Default for InterruptibleSyscall {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for InterruptibleSyscall {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = guard(&self.state);
        f.debug_struct("InterruptibleSyscall")
            .field("mechanism", &self.mechanism)
            .field("fd", &state.fd)
            .field("interrupted", &state.interrupted)
            .field("closed", &state.closed)
            .finish()
    }
}
