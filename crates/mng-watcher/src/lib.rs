//! Host-resident idle watcher for mng.
//!
//! Runs inside every host. Each tick it re-reads the host's activity config,
//! takes the newest marker time across the relevant sources, and decides:
//!
//! ```text
//! boot + max_host_age <= now      -> shut down ("max-age")
//! idle_mode == disabled           -> keep running
//! no relevant marker              -> keep running
//! latest + idle_timeout <= now    -> shut down ("idle")
//! ```
//!
//! On shutdown the decision is appended to `logs/idle_watcher.log` and
//! `commands/shutdown.sh` runs once. The hook owns what "shut down" means for
//! its backend: pause, stop, or terminate.
//!
//! The watcher depends on nothing but `mng-core` and the host filesystem.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod decision;
pub mod error;
pub mod watcher;

pub use decision::{decide, Decision};
pub use error::{Result, WatcherError};
pub use watcher::{IdleWatcher, DEFAULT_INTERVAL_SECONDS};
