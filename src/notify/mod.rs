//! Callback fan-out: interrupt and exception subscribers.
//!
//! ```text
//!  driver                      port
//! ┌────────────┐  distribute  ┌──────────────────────┐
//! │ I/O thread │─────────────▶│ InterruptRegistry    │──▶ subscriber 1, 2, 3 ...
//! └────────────┘              │  (addr, type) lists  │    (caller's thread,
//!                             ├──────────────────────┤     registration order)
//!  exception_connect ────────▶│ ExceptionRegistry    │──▶ exception subscribers
//!  enable / auto_connect      │  per-device lists    │
//!                             └──────────────────────┘
//! ```
//!
//! Distribution never takes the port's I/O lock; subscribers must not block.

mod exception;
mod interrupt;
mod subscribers;

pub use exception::Exception;
pub use subscribers::SubscriptionHandle;

pub(crate) use exception::ExceptionRegistry;
pub(crate) use interrupt::InterruptRegistry;
