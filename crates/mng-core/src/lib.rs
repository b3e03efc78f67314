//! Core types and utilities for mng.
//!
//! This crate provides the foundational types shared by every other mng crate,
//! including the standalone idle watcher which must not depend on anything else:
//!
//! - **Identifiers**: prefixed 128-bit `HostId` / `AgentId`, opaque `SnapshotId`
//! - **Names**: DNS-safe `HostName` / `AgentName` and the `HostRef` lookup key
//! - **Lifecycle states**: `HostState` and the computed `AgentObservedState`
//! - **Activity**: sources, idle modes, `ActivityConfig`, and the on-host ledger
//! - **Layout**: the fixed host-side file contract (`HostLayout`)
//! - **Error taxonomy**: `ErrorCategory` shared by all error enums
//!
//! # Example
//!
//! ```
//! use mng_core::{HostId, HostName, IdleMode, ActivityConfig};
//!
//! let host_id = HostId::generate();
//! let name: HostName = "dev-box".parse().unwrap();
//! let config = ActivityConfig::new(IdleMode::Agent, 900);
//!
//! assert!(host_id.to_string().starts_with("host-"));
//! assert_eq!(name.as_str(), "dev-box");
//! assert!(!config.relevant_sources().is_empty());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod activity;
pub mod error;
pub mod ids;
pub mod layout;
pub mod ledger;
pub mod names;
pub mod state;

pub use activity::{ActivityConfig, ActivityScope, ActivitySource, IdleMode};
pub use error::{CoreError, ErrorCategory, Result};
pub use ids::{AgentId, HostId, IdError, SnapshotId};
pub use layout::HostLayout;
pub use ledger::{ActivityLedger, ActivityObservations};
pub use names::{AgentName, HostName, HostRef, NameError};
pub use state::{AgentObservedState, HostState};
