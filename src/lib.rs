//! # asyn
//!
//! A queued, interface-based I/O layer between clients and instrument
//! drivers. Drivers own *ports*; a port serves one device or, with
//! [`PortAttributes::MULTI_DEVICE`], a range of addressed devices. Clients
//! never call each other: they bind an [`AsynUser`] to `(port, addr)`,
//! resolve the interfaces they need, and either queue requests or lock the
//! port and call the driver directly.
//!
//! ## Architecture
//!
//! ### Core
//! - [`AsynManager`]: port table and every client entry point
//! - [`PortHandle`]: the driver's view of its port (interfaces, connection
//!   state, interrupt distribution)
//! - [`AsynUser`]: per-client context carrying timeout, reason, error text and
//!   per-layer private data
//!
//! ### Requests
//! - [`Request`] and [`Priority`]: callbacks queued per port, run one at a
//!   time on the port's worker thread (or inline for ports that cannot block)
//! - explicit locks via [`AsynManager::lock`] and [`AsynManager::unlock`]
//! - autoconnect with periodic retry
//!
//! ### Interfaces
//! - [`Common`], [`Octet`], [`Int32`] and [`Float64`], plus any trait bound
//!   through [`InterfaceType`]
//! - interpose stacks: [`PortHandle::interpose_interface`] layers a new
//!   implementation over an existing one, as [`EosInterpose`] does
//!
//! ### Notification
//! - interrupt subscribers per `(addr, interface)`
//! - exception callbacks for connect, enable, autoconnect and shutdown
//!
//! ### Helpers
//! - [`OctetSyncIo`] and [`Int32SyncIo`]: lock, call, unlock
//! - [`EchoDriver`]: loopback reference driver
//! - `interruptible` (unix): forcing blocked socket calls to return
//!
//! ## Examples
//!
//! ### Driver and queued client
//!
//! ```rust,ignore
//! use asyn::*;
//!
//! let manager = AsynManager::new(ManagerConfig::default());
//! let port = manager.register_port("L0", PortConfig::new(PortAttributes::CAN_BLOCK))?;
//! EchoDriver::new(port, EchoOptions::default()).register()?;
//!
//! let user = manager.create_user();
//! manager.connect_device(&user, "L0", 0)?;
//! let octet = manager.find_interface::<dyn Octet>(&user, true)?;
//! manager.queue_request(&user, Priority::High, Request::new(move |user| {
//!     let _ = octet.write(user, b"*IDN?");
//! }))?;
//! ```
//!
//! ### Interrupt subscription
//!
//! ```rust,ignore
//! let handle = manager.register_interrupt_user::<dyn Int32, _>(&user, |_user, value| {
//!     info!("new value {}", value);
//! })?;
//! // ...
//! manager.cancel_interrupt_user(&handle)?;
//! ```
//!
//! ### Synchronous I/O
//!
//! ```rust,ignore
//! let io = OctetSyncIo::connect(&manager, "L0", 0)?;
//! let mut reply = [0u8; 64];
//! let (n, eom) = io.write_read(b"*IDN?", &mut reply, Duration::from_secs(1))?;
//! ```

#[macro_use]
extern crate log;

#[macro_use]
mod error;

mod config;
mod echo;
mod eos;
mod interfaces;
#[cfg(unix)]
pub mod interruptible;
mod lock;
mod manager;
mod notify;
mod port;
mod queue;
mod registry;
mod scheduler;
mod sync_io;
mod timer;
mod user;

pub use config::{ManagerConfig, PortAttributes, PortConfig};
pub use echo::{EchoDriver, EchoOptions};
pub use eos::{EOS_MAX, EosInterpose, escape_eos, parse_eos};
pub use error::{AsynError, AsynResult, CancelStatus};
pub use interfaces::{Common, EomReason, Float64, Int32, InterfaceType, Octet};
pub use manager::AsynManager;
pub use notify::{Exception, SubscriptionHandle};
pub use port::PortHandle;
pub use queue::{Priority, Request};
pub use registry::{Interface, LayerId};
pub use sync_io::{Int32SyncIo, OctetSyncIo, SyncIo};
pub use user::{AsynUser, DEFAULT_TIMEOUT, ERROR_MESSAGE_SIZE, UserId};
