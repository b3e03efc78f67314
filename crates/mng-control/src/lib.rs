//! Control layer for mng.
//!
//! This crate turns a set of configured provider instances into one fleet:
//! it discovers hosts across every instance, drives single hosts through
//! their lifecycle under a per-host lock, and manages snapshots.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      InvocationContext                      │
//! │   config · provider arena · host cache · hook registry      │
//! └─────────────────────────────────────────────────────────────┘
//!          │                    │                     │
//!          ▼                    ▼                     ▼
//!   ┌─────────────┐     ┌────────────────┐    ┌─────────────────┐
//!   │ Reconciler  │◀────│ HostController │◀───│ SnapshotManager │
//!   │  (fan-out)  │     │  (lifecycle)   │    │                 │
//!   └─────────────┘     └────────────────┘    └─────────────────┘
//!          │                    │
//!          ▼                    ▼
//!   ┌─────────────┐     ┌────────────────┐
//!   │  Provider   │     │  Record store  │
//!   │  instances  │     │  + host locks  │
//!   └─────────────┘     └────────────────┘
//! ```
//!
//! Nothing observed here outlives the invocation: every command builds a
//! fresh [`InvocationContext`] and re-derives what it needs.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use mng_control::{HostController, HostLifecycle, InvocationContext, MngConfig};
//! use mng_provider::{BackendRegistry, BuildConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MngConfig::from_env();
//! let ctx = Arc::new(InvocationContext::from_config(config, &BackendRegistry::with_builtin())?);
//! let controller = HostController::new(Arc::clone(&ctx));
//!
//! let host = controller
//!     .create_host("docker", "scratch".parse()?, BuildConfig::default())
//!     .await?;
//! controller
//!     .stop_host(&mng_core::HostRef::Id(host.id), true, Duration::from_secs(30))
//!     .await?;
//!
//! let listing = controller.reconciler().list_hosts().await;
//! for error in &listing.errors {
//!     eprintln!("{}: {}", error.instance, error.message);
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod fanout;
pub mod hooks;
pub mod lifecycle;
pub mod reconcile;
pub mod snapshot;
pub mod types;

pub use config::{MngConfig, ProviderConfig};
pub use context::InvocationContext;
pub use controller::{HostController, HostLifecycle};
pub use error::{ControlError, Result};
pub use fanout::{fan_out, FanOutOptions, UnitOutcome};
pub use hooks::{Hook, HookInput, HookPoint, HookRegistry, HostHook};
pub use reconcile::Reconciler;
pub use snapshot::SnapshotManager;
pub use types::{
    Agent, Host, HostListing, HostView, InstanceError, NewAgent, OfflineHost, StopOutcome,
};
