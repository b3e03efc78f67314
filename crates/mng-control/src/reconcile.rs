//! The reconciliation layer.
//!
//! Every answer is re-derived from provider instances and host filesystems.
//! Discovery fans out across instances; an instance that fails, times out, or
//! panics is reported next to the hosts the others returned and never aborts
//! the call.

use std::collections::HashSet;
use std::sync::Arc;

use mng_core::{layout, AgentId, AgentObservedState, ErrorCategory, HostRef, HostState};
use mng_provider::{HostAccess, ProviderError, ProviderInstance};
use mng_store::{AgentRecord, Store};

use crate::context::InvocationContext;
use crate::error::{ControlError, Result};
use crate::fanout::{fan_out, UnitOutcome};
use crate::types::{Agent, Host, HostListing, HostView, InstanceError};

/// Name used in [`InstanceError`] for failures reading the record store.
pub const STORE_SOURCE: &str = "record-store";

/// Turn one instance's fan-out outcome into its value or an error entry.
fn settle<T>(instance: &str, outcome: UnitOutcome<T, ProviderError>) -> std::result::Result<T, InstanceError> {
    let (category, message) = match outcome {
        UnitOutcome::Ok(value) => return Ok(value),
        UnitOutcome::Failed(e) => (e.category(), e.to_string()),
        UnitOutcome::TimedOut(after) => (
            ErrorCategory::Transient,
            format!("no answer within {after:?}"),
        ),
        UnitOutcome::Panicked(message) => (ErrorCategory::Unexpected, format!("panicked: {message}")),
    };
    tracing::warn!(provider = %instance, ?category, error = %message, "Provider instance failed during discovery");
    Err(InstanceError {
        instance: instance.to_string(),
        category,
        message,
    })
}

/// Queries provider instances and host filesystems on behalf of one invocation.
#[derive(Debug, Clone)]
pub struct Reconciler {
    ctx: Arc<InvocationContext>,
}

impl Reconciler {
    /// Create a reconciler over an invocation context.
    #[must_use]
    pub const fn new(ctx: Arc<InvocationContext>) -> Self {
        Self { ctx }
    }

    /// The invocation context.
    #[must_use]
    pub const fn context(&self) -> &Arc<InvocationContext> {
        &self.ctx
    }

    /// Every host on every configured instance, plus FAILED creations.
    ///
    /// Never fails: per-instance failures are returned in `errors`.
    pub async fn list_hosts(&self) -> HostListing {
        let units = self
            .ctx
            .providers()
            .iter()
            .map(|provider| {
                let provider = Arc::clone(provider);
                (provider.name().to_string(), async move {
                    provider.discover_hosts().await
                })
            })
            .collect();

        let mut listing = HostListing::default();
        for (instance, outcome) in fan_out(units, self.ctx.fan_out_options()).await {
            match settle(&instance, outcome) {
                Ok(hosts) => listing
                    .hosts
                    .extend(hosts.into_iter().map(|h| HostView::from_provider(&instance, h))),
                Err(error) => listing.errors.push(error),
            }
        }

        match self.failed_records() {
            Ok(failed) => {
                for view in failed {
                    if !listing.hosts.iter().any(|h| h.id() == view.id()) {
                        listing.hosts.push(view);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read failure records");
                listing.errors.push(InstanceError {
                    instance: STORE_SOURCE.to_string(),
                    category: e.category(),
                    message: e.to_string(),
                });
            }
        }

        self.sort(&mut listing.hosts);
        for view in &listing.hosts {
            self.ctx.cache_host(view.clone());
        }
        tracing::debug!(
            hosts = listing.hosts.len(),
            errors = listing.errors.len(),
            "Listed hosts"
        );
        listing
    }

    /// Find one host by id or name.
    ///
    /// Hosts already observed in this invocation are answered from its cache.
    ///
    /// # Errors
    ///
    /// Returns `HostNotFound` only after every instance answered;
    /// `LookupIncomplete` if the host was not found and some instance failed;
    /// `AmbiguousName` if a name matches several hosts.
    pub async fn get_host(&self, reference: &HostRef) -> Result<HostView> {
        if let HostRef::Id(id) = reference {
            if let Some(view) = self.ctx.cached_host(id) {
                return Ok(view);
            }
        }

        let units = self
            .ctx
            .providers()
            .iter()
            .map(|provider| {
                let provider = Arc::clone(provider);
                let reference = reference.clone();
                (provider.name().to_string(), async move {
                    match reference {
                        HostRef::Id(id) => provider.get_host(&id).await.map(|h| h.into_iter().collect::<Vec<_>>()),
                        HostRef::Name(name) => provider.discover_hosts().await.map(|hosts| {
                            hosts.into_iter().filter(|h| h.name == name).collect::<Vec<_>>()
                        }),
                    }
                })
            })
            .collect();

        let mut matches = Vec::new();
        let mut failed = Vec::new();
        for (instance, outcome) in fan_out(units, self.ctx.fan_out_options()).await {
            match settle(&instance, outcome) {
                Ok(hosts) => matches.extend(
                    hosts
                        .into_iter()
                        .map(|h: mng_provider::ProviderHost| HostView::from_provider(&instance, h)),
                ),
                Err(_) => failed.push(instance),
            }
        }
        for view in self.failed_records()? {
            if reference.matches(view.id(), view.name()) && !matches.iter().any(|m| m.id() == view.id()) {
                matches.push(view);
            }
        }

        let view = self.pick(reference, matches, failed)?;
        self.ctx.cache_host(view.clone());
        Ok(view)
    }

    /// Re-read one host from its owning instance, bypassing the cache.
    ///
    /// Returns `None` if neither the instance nor the record store knows it.
    ///
    /// # Errors
    ///
    /// Returns the provider's error, naming the host.
    pub async fn refresh(&self, known: &HostView) -> Result<Option<HostView>> {
        if known.state().is_terminal() {
            return Ok(Some(known.clone()));
        }
        let instance = known.provider_instance_name();
        let provider = self.ctx.provider(instance)?;
        let found = provider
            .get_host(known.id())
            .await
            .map_err(|e| ControlError::host_operation(*known.id(), known.name(), instance, e))?;

        let view = match found {
            Some(host) => Some(HostView::from_provider(instance, host)),
            None => self
                .ctx
                .store()
                .get_record(known.id())?
                .filter(|r| r.failure.is_some())
                .map(|r| HostView::from_record(&r)),
        };
        if let Some(view) = &view {
            self.ctx.cache_host(view.clone());
        }
        Ok(view)
    }

    /// Agents on an online host, with their observed state.
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot be reached. Agents whose records
    /// are unreadable are skipped and logged.
    pub async fn list_agents(&self, host: &Host) -> Result<Vec<Agent>> {
        let provider = self.ctx.provider_for_host(host)?;
        let on_host = |e: ProviderError| ControlError::host_operation(host.id, &host.name, &host.provider_instance_name, e);
        let access = provider.host_access(&host.id).await.map_err(on_host)?;

        let entries = access.list_dir(layout::AGENTS_DIR).await.map_err(on_host)?;
        let sessions = self.live_sessions(access.as_ref()).await.map_err(on_host)?;

        let mut agents = Vec::new();
        for entry in entries {
            let Ok(agent_id) = entry.parse::<AgentId>() else {
                continue;
            };
            match self.read_agent(access.as_ref(), &agent_id, host, &sessions).await {
                Ok(Some(agent)) => agents.push(agent),
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    host_id = %host.id,
                    agent_id = %agent_id,
                    error = %e,
                    "Skipping unreadable agent"
                ),
            }
        }

        agents.sort_by(|a, b| {
            a.create_time
                .cmp(&b.create_time)
                .then_with(|| a.name.as_str().cmp(b.name.as_str()))
        });
        for agent in &agents {
            tracing::trace!(agent_id = %agent.id, state = ?agent.state, "Observed agent");
        }
        Ok(agents)
    }

    async fn read_agent(
        &self,
        access: &dyn HostAccess,
        agent_id: &AgentId,
        host: &Host,
        sessions: &HashSet<String>,
    ) -> std::result::Result<Option<Agent>, ProviderError> {
        let Some(raw) = access.read_file(&layout::agent_data(agent_id)).await? else {
            return Ok(None);
        };
        let record: AgentRecord = serde_json::from_slice(&raw)?;
        if record.host_id != host.id {
            tracing::warn!(
                host_id = %host.id,
                agent_id = %agent_id,
                recorded_host = %record.host_id,
                "Agent record names another host"
            );
            return Ok(None);
        }
        let status = access
            .read_file(&layout::agent_status(agent_id))
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
        let alive = sessions.contains(&self.session_name(&record));
        let state = AgentObservedState::observe(alive, status.as_deref());
        Ok(Some(Agent::from_record(record, state)))
    }

    /// Name of the managed session running an agent.
    #[must_use]
    pub fn session_name(&self, agent: &AgentRecord) -> String {
        format!("{}{}", self.ctx.config().prefix, agent.name)
    }

    async fn live_sessions(&self, access: &dyn HostAccess) -> std::result::Result<HashSet<String>, ProviderError> {
        let output = access
            .run("tmux list-sessions -F '#{session_name}' 2>/dev/null || true", None)
            .await?;
        let prefix = &self.ctx.config().prefix;
        Ok(output
            .stdout_lossy()
            .lines()
            .filter(|line| line.starts_with(prefix.as_str()))
            .map(str::to_string)
            .collect())
    }

    fn failed_records(&self) -> Result<Vec<HostView>> {
        Ok(self
            .ctx
            .store()
            .list_records()?
            .iter()
            .filter(|r| r.failure.is_some())
            .map(HostView::from_record)
            .collect())
    }

    fn pick(&self, reference: &HostRef, mut matches: Vec<HostView>, failed: Vec<String>) -> Result<HostView> {
        self.sort(&mut matches);
        match matches.len() {
            0 if failed.is_empty() => Err(ControlError::HostNotFound(reference.clone())),
            0 => Err(ControlError::LookupIncomplete {
                reference: reference.clone(),
                failed,
            }),
            1 => Ok(matches.remove(0)),
            count => {
                let mut live: Vec<HostView> = matches
                    .iter()
                    .filter(|m| occupies_name(m.state()))
                    .cloned()
                    .collect();
                match (reference, live.len()) {
                    (HostRef::Id(_), _) => Ok(matches.remove(0)),
                    (HostRef::Name(_), 1) => Ok(live.remove(0)),
                    (HostRef::Name(name), _) => Err(ControlError::AmbiguousName {
                        name: name.clone(),
                        count,
                    }),
                }
            }
        }
    }

    fn sort(&self, hosts: &mut [HostView]) {
        hosts.sort_by(|a, b| {
            let pos = |h: &HostView| {
                self.ctx
                    .provider_position(h.provider_instance_name())
                    .unwrap_or(usize::MAX)
            };
            pos(a)
                .cmp(&pos(b))
                .then_with(|| a.name().as_str().cmp(b.name().as_str()))
                .then_with(|| a.id().cmp(b.id()))
        });
    }

    /// Find a host's owning provider and its current view, preferring a fresh read.
    pub(crate) async fn resolve(
        &self,
        reference: &HostRef,
    ) -> Result<(HostView, Arc<dyn ProviderInstance>)> {
        let view = self.get_host(reference).await?;
        let provider = self.ctx.provider_for_view(&view)?;
        Ok((view, provider))
    }
}

/// Returns true if a host in this state keeps its name reserved.
pub(crate) const fn occupies_name(state: HostState) -> bool {
    !matches!(state, HostState::Failed | HostState::Destroyed)
}
