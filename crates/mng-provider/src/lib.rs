//! Provider backends for mng hosts.
//!
//! A *backend* is a kind of infrastructure; a *provider instance* is one
//! configured use of a backend. Every instance implements [`ProviderInstance`]
//! and advertises [`ProviderCapabilities`] so the control layer can gate
//! stop, resume, snapshot, and destroy operations.
//!
//! Built-in backends:
//!
//! | backend  | shutdown | snapshots | resume | destroy |
//! |----------|----------|-----------|--------|---------|
//! | `local`  | no       | no        | no     | no      |
//! | `docker` | yes      | yes       | yes    | yes     |
//! | `ssh`    | no       | no        | no     | yes     |
//! | `cloud`  | no       | yes       | yes    | yes     |
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     Control layer                        │
//! └──────────────────────────────────────────────────────────┘
//!                │ BackendRegistry::build        │ host_access
//!                ▼                               ▼
//! ┌──────────────────────────────┐   ┌──────────────────────┐
//! │       ProviderInstance       │   │      HostAccess      │
//! │ local │ docker │ ssh │ cloud │   │ local │ exec │ ssh   │
//! └──────────────────────────────┘   └──────────────────────┘
//!                │                               │
//!                ▼                               ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │   Host data root: data.json, activity/, agents/, hook    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Testing
//!
//! Enable the `test-utils` feature for a directory-backed mock instance with
//! configurable capabilities and failure injection:
//!
//! ```ignore
//! use mng_provider::{MockProvider, ProviderInstance};
//!
//! # async fn example(dir: &std::path::Path) -> mng_provider::Result<()> {
//! let provider = MockProvider::new("mock", dir, MockProvider::full_capabilities());
//! provider.fail_discovery(Some("backend unavailable"));
//! assert!(provider.discover_hosts().await.is_err());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod access;
pub mod bootstrap;
pub mod cloud;
pub mod docker;
pub mod error;
pub mod instance;
pub mod local;
pub mod ssh;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use access::{CommandAccess, ExecOutput, HostAccess, LocalAccess, Transport};
pub use cloud::{CloudBackend, CloudProvider};
pub use docker::{DockerBackend, DockerProvider};
pub use error::{ProviderError, Result};
pub use instance::{
    BackendContext, BackendRegistry, ConfigField, FieldKind, ProviderBackend, ProviderInstance,
};
pub use local::{LocalBackend, LocalProvider};
pub use ssh::{SshBackend, SshProvider};
pub use types::{
    BuildConfig, CreateHostRequest, ProviderCapabilities, ProviderHost, ResourceDescriptor,
};

#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockProvider;
