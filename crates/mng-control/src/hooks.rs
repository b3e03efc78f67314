//! Typed lifecycle hooks.
//!
//! Hooks are registered once when the invocation context is built and run in
//! registration order. A hook that fails is logged, disabled for the rest of
//! the invocation, and the lifecycle operation carries on. The provisioning
//! step that turns a bare sandbox into an agent-capable one plugs in here as
//! an `AfterHostCreated` / `AfterHostStarted` hook.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mng_provider::HostAccess;

use crate::error::{ControlError, Result};
use crate::types::HostView;

/// Where in a lifecycle operation a hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// After `create_host` reached RUNNING.
    AfterHostCreated,
    /// After `start_host` reached RUNNING.
    AfterHostStarted,
    /// Before a host is stopped, while it may still be live.
    BeforeHostStopped,
    /// Before a host's backing resource is destroyed.
    BeforeHostDestroyed,
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AfterHostCreated => "after_host_created",
            Self::AfterHostStarted => "after_host_started",
            Self::BeforeHostStopped => "before_host_stopped",
            Self::BeforeHostDestroyed => "before_host_destroyed",
        })
    }
}

/// What a hook is handed.
pub struct HookInput<'a> {
    /// Which point fired.
    pub point: HookPoint,
    /// The host, as last observed.
    pub host: &'a HostView,
    /// File and command access, when the host is live.
    pub access: Option<&'a dyn HostAccess>,
}

/// A lifecycle hook implementation.
#[async_trait]
pub trait HostHook: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Run the hook.
    ///
    /// # Errors
    ///
    /// Any error disables this hook for the rest of the invocation.
    async fn run(&self, input: HookInput<'_>) -> Result<()>;
}

/// A hook bound to the point it runs at.
#[derive(Clone)]
pub enum Hook {
    /// Runs after host creation.
    AfterHostCreated(Arc<dyn HostHook>),
    /// Runs after a host is started.
    AfterHostStarted(Arc<dyn HostHook>),
    /// Runs before a host is stopped.
    BeforeHostStopped(Arc<dyn HostHook>),
    /// Runs before a host is destroyed.
    BeforeHostDestroyed(Arc<dyn HostHook>),
}

impl Hook {
    /// The point this hook runs at.
    #[must_use]
    pub const fn point(&self) -> HookPoint {
        match self {
            Self::AfterHostCreated(_) => HookPoint::AfterHostCreated,
            Self::AfterHostStarted(_) => HookPoint::AfterHostStarted,
            Self::BeforeHostStopped(_) => HookPoint::BeforeHostStopped,
            Self::BeforeHostDestroyed(_) => HookPoint::BeforeHostDestroyed,
        }
    }

    fn handler(&self) -> &Arc<dyn HostHook> {
        match self {
            Self::AfterHostCreated(h)
            | Self::AfterHostStarted(h)
            | Self::BeforeHostStopped(h)
            | Self::BeforeHostDestroyed(h) => h,
        }
    }
}

struct Entry {
    hook: Hook,
    disabled: AtomicBool,
}

/// Ordered table of hooks for one invocation.
#[derive(Default)]
pub struct HookRegistry {
    entries: Vec<Entry>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| (e.hook.point(), e.hook.handler().name())))
            .finish()
    }
}

impl HookRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook. Hooks at the same point run in registration order.
    pub fn register(&mut self, hook: Hook) {
        self.entries.push(Entry {
            hook,
            disabled: AtomicBool::new(false),
        });
    }

    /// Number of registered hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of hooks disabled by an earlier failure.
    #[must_use]
    pub fn disabled(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.disabled.load(Ordering::SeqCst))
            .map(|e| e.hook.handler().name().to_string())
            .collect()
    }

    /// Run every enabled hook registered for `point`.
    ///
    /// Returns the failures, each already logged; the caller continues.
    pub async fn run(
        &self,
        point: HookPoint,
        host: &HostView,
        access: Option<&dyn HostAccess>,
    ) -> Vec<ControlError> {
        let mut failures = Vec::new();
        for entry in self.entries.iter().filter(|e| e.hook.point() == point) {
            if entry.disabled.load(Ordering::SeqCst) {
                continue;
            }
            let handler = entry.hook.handler();
            let input = HookInput {
                point,
                host,
                access,
            };
            if let Err(e) = handler.run(input).await {
                entry.disabled.store(true, Ordering::SeqCst);
                tracing::error!(
                    hook = handler.name(),
                    point = %point,
                    host_id = %host.id(),
                    host_name = %host.name(),
                    error = %e,
                    "Hook failed; disabled for this invocation"
                );
                failures.push(ControlError::Hook {
                    hook: handler.name().to_string(),
                    message: e.to_string(),
                });
            }
        }
        failures
    }
}
