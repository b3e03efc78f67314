//! Fleet-level behavior of the control layer against mock provider instances.
//!
//! Each test builds one or more invocations over shared mock instances and a
//! shared record store root, the way separate command runs would see them.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mng_control::{
    ControlError, Hook, HookInput, HookRegistry, HostController, HostHook, HostLifecycle,
    HostView, InvocationContext, MngConfig, SnapshotManager, StopOutcome,
};
use mng_core::{HostId, HostRef, HostState};
use mng_provider::{BuildConfig, MockProvider, ProviderCapabilities, ProviderInstance};
use mng_store::{FileStore, LockError};
use tempfile::TempDir;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Fixture
// =============================================================================

struct Fleet {
    _dir: TempDir,
    mocks: Vec<Arc<MockProvider>>,
    config: MngConfig,
}

impl Fleet {
    fn new(instances: &[(&str, ProviderCapabilities)]) -> Self {
        let dir = TempDir::new().unwrap();
        let mocks = instances
            .iter()
            .map(|(name, caps)| Arc::new(MockProvider::new(name, dir.path().join(name), *caps)))
            .collect();
        let config = MngConfig {
            store_root: dir.path().join("store"),
            discovery_timeout_seconds: 2,
            lock_wait_seconds: 10,
            ..MngConfig::default()
        };
        Self {
            _dir: dir,
            mocks,
            config,
        }
    }

    fn full(names: &[&str]) -> Self {
        let instances: Vec<_> = names
            .iter()
            .map(|n| (*n, MockProvider::full_capabilities()))
            .collect();
        Self::new(&instances)
    }

    /// A fresh invocation: new context, empty host cache, same backends and store.
    fn invocation(&self) -> Arc<InvocationContext> {
        self.invocation_with(self.config.clone(), HookRegistry::new())
    }

    fn invocation_with(&self, config: MngConfig, hooks: HookRegistry) -> Arc<InvocationContext> {
        let store = Arc::new(FileStore::open(&config.store_root, config.lock_config()).unwrap());
        let providers = self
            .mocks
            .iter()
            .map(|m| Arc::clone(m) as Arc<dyn ProviderInstance>)
            .collect();
        Arc::new(
            InvocationContext::new(config, store, providers)
                .unwrap()
                .with_hooks(hooks),
        )
    }

    fn controller(&self) -> HostController {
        HostController::new(self.invocation())
    }

    fn mock(&self, name: &str) -> &Arc<MockProvider> {
        self.mocks.iter().find(|m| m.name() == name).unwrap()
    }
}

async fn create(controller: &HostController, instance: &str, name: &str) -> HostId {
    controller
        .create_host(instance, name.parse().unwrap(), BuildConfig::default())
        .await
        .unwrap()
        .id
}

fn summary(hosts: &[HostView]) -> Vec<(HostId, HostState)> {
    hosts.iter().map(|h| (*h.id(), h.state())).collect()
}

fn write_fixture(root: &Path) -> BTreeMap<String, String> {
    let files = BTreeMap::from([
        ("work/notes.txt".to_string(), "first draft\n".to_string()),
        ("work/src/main.rs".to_string(), "fn main() {}\n".to_string()),
        ("data/cache/blob".to_string(), "0123456789".repeat(100)),
    ]);
    for (path, contents) in &files {
        let path = root.join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }
    files
}

fn read_fixture(root: &Path, files: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    files
        .keys()
        .filter_map(|path| {
            fs::read_to_string(root.join(path))
                .ok()
                .map(|contents| (path.clone(), contents))
        })
        .collect()
}

// =============================================================================
// Discovery
// =============================================================================

#[tokio::test]
async fn discovery_is_idempotent() {
    let fleet = Fleet::full(&["alpha", "beta"]);
    let controller = fleet.controller();
    create(&controller, "alpha", "one").await;
    create(&controller, "beta", "two").await;
    let stopped = create(&controller, "beta", "three").await;
    controller
        .stop_host(&HostRef::Id(stopped), false, STOP_TIMEOUT)
        .await
        .unwrap();

    let first = fleet.controller().reconciler().list_hosts().await;
    let second = fleet.controller().reconciler().list_hosts().await;

    assert!(first.errors.is_empty());
    assert_eq!(first.hosts.len(), 3);
    assert_eq!(summary(&first.hosts), summary(&second.hosts));
    assert_eq!(first.hosts[0].provider_instance_name(), "alpha");
}

#[tokio::test]
async fn one_failing_instance_does_not_hide_the_others() {
    let fleet = Fleet::full(&["a", "b", "c"]);
    let controller = fleet.controller();
    create(&controller, "a", "host-a").await;
    create(&controller, "b", "host-b").await;
    create(&controller, "c", "host-c").await;
    fleet.mock("b").fail_discovery(Some("api unavailable"));

    let listing = fleet.controller().reconciler().list_hosts().await;

    let names: Vec<_> = listing.hosts.iter().map(|h| h.name().to_string()).collect();
    assert_eq!(names, ["host-a", "host-c"]);
    assert_eq!(listing.errors.len(), 1);
    assert_eq!(listing.errors[0].instance, "b");
    assert!(listing.errors[0].message.contains("api unavailable"));
}

#[tokio::test]
async fn lookup_by_name_through_a_failing_instance_is_retriable() {
    let fleet = Fleet::full(&["a", "b"]);
    fleet.mock("a").fail_discovery(Some("timeout"));

    let err = fleet
        .controller()
        .reconciler()
        .get_host(&HostRef::Name("missing".parse().unwrap()))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::LookupIncomplete { .. }));
    assert!(err.is_retriable());
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn failed_creation_stays_visible() {
    let fleet = Fleet::full(&["mock"]);
    fleet.mock("mock").fail_next_create("step 3/7: pull failed: manifest unknown");

    let err = fleet
        .controller()
        .create_host("mock", "doomed".parse().unwrap(), BuildConfig::default())
        .await
        .unwrap_err();
    let ControlError::CreateFailed { host_id, .. } = err else {
        panic!("expected CreateFailed, got {err:?}");
    };

    let listing = fleet.controller().reconciler().list_hosts().await;
    assert_eq!(listing.hosts.len(), 1);
    let HostView::Offline(failed) = &listing.hosts[0] else {
        panic!("a failed host is never online");
    };
    assert_eq!(failed.id, host_id);
    assert_eq!(failed.state, HostState::Failed);
    assert!(failed
        .failure
        .as_ref()
        .unwrap()
        .build_log
        .contains("manifest unknown"));

    // The name is free again for a retry.
    let retry = create(&fleet.controller(), "mock", "doomed").await;
    assert_ne!(retry, host_id);

    fleet
        .controller()
        .destroy_host(&HostRef::Id(host_id), false)
        .await
        .unwrap();
    let listing = fleet.controller().reconciler().list_hosts().await;
    assert_eq!(summary(&listing.hosts), [(retry, HostState::Running)]);
}

#[tokio::test]
async fn destroyed_host_never_leaves_destroyed() {
    let fleet = Fleet::full(&["mock"]);
    let controller = fleet.controller();
    let host_id = create(&controller, "mock", "short-lived").await;
    let host = HostRef::Id(host_id);

    controller.destroy_host(&host, true).await.unwrap();

    for result in [
        controller.start_host(&host, None).await.map(|_| ()),
        controller.stop_host(&host, false, STOP_TIMEOUT).await.map(|_| ()),
        controller.destroy_host(&host, false).await,
    ] {
        assert!(matches!(
            result,
            Err(ControlError::InvalidTransition {
                from: HostState::Destroyed,
                ..
            })
        ));
    }
    assert_eq!(
        controller.stop_host(&host, true, STOP_TIMEOUT).await.unwrap(),
        StopOutcome::AlreadyGone
    );

    assert!(matches!(
        fleet.controller().reconciler().get_host(&host).await,
        Err(ControlError::HostNotFound(_))
    ));
    assert_eq!(fleet.mock("mock").host_count(), 0);
}

#[tokio::test]
async fn stop_then_start_round_trip() {
    let fleet = Fleet::full(&["mock"]);
    let host_id = create(&fleet.controller(), "mock", "cycle").await;
    let host = HostRef::Name("cycle".parse().unwrap());

    let outcome = fleet.controller().stop_host(&host, false, STOP_TIMEOUT).await.unwrap();
    let StopOutcome::Stopped(view) = outcome else {
        panic!("expected a stopped host");
    };
    assert_eq!(view.state(), HostState::Stopped);

    let started = fleet.controller().start_host(&host, None).await.unwrap();
    assert_eq!(started.id, host_id);
    assert_eq!(started.state, HostState::Running);
}

#[tokio::test]
async fn concurrent_creates_under_one_name_yield_one_host() {
    let fleet = Fleet::full(&["mock"]);
    let first = fleet.controller();
    let second = fleet.controller();

    let (a, b) = tokio::join!(
        first.create_host("mock", "dup".parse().unwrap(), BuildConfig::default()),
        second.create_host("mock", "dup".parse().unwrap(), BuildConfig::default()),
    );

    let (created, rejected) = match (a, b) {
        (Ok(host), Err(err)) | (Err(err), Ok(host)) => (host, err),
        (a, b) => panic!("expected exactly one creation to succeed: {a:?} / {b:?}"),
    };
    assert!(matches!(rejected, ControlError::NameTaken { host_id, .. } if host_id == created.id));
    assert_eq!(fleet.mock("mock").host_count(), 1);
}

#[tokio::test]
async fn boot_launches_the_idle_watcher() {
    let fleet = Fleet::full(&["mock"]);
    let bin = TempDir::new().unwrap();
    let program = bin.path().join("idle-watcher");
    fs::write(
        &program,
        "#!/bin/sh\necho \"$@\" >> \"$2/launches\"\nexec sleep 30\n",
    )
    .unwrap();
    let mut perms = fs::metadata(&program).unwrap().permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
    fs::set_permissions(&program, perms).unwrap();
    fleet
        .mock("mock")
        .set_watcher_program(Some(program.to_str().unwrap()));

    let host_id = create(&fleet.controller(), "mock", "watched").await;
    let root = fleet.mock("mock").host_dir(&host_id);
    let launches = root.join("launches");
    for _ in 0..100 {
        if fs::read_to_string(&launches).is_ok_and(|s| s.ends_with('\n')) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let recorded = fs::read_to_string(&launches).unwrap();
    assert_eq!(recorded.trim(), format!("--host-dir {}", root.display()));

    // Booting again while the watcher is still alive does not start another.
    let controller = fleet.controller();
    let host = HostRef::Id(host_id);
    controller.stop_host(&host, false, STOP_TIMEOUT).await.unwrap();
    controller.start_host(&host, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fs::read_to_string(&launches).unwrap().lines().count(), 1);

    let pid = fs::read_to_string(root.join(mng_core::layout::WATCHER_PID)).unwrap();
    std::process::Command::new("kill")
        .arg(pid.trim())
        .status()
        .unwrap();
}

// =============================================================================
// Snapshots
// =============================================================================

#[tokio::test]
async fn snapshot_restores_captured_files() {
    let fleet = Fleet::full(&["mock"]);
    let controller = fleet.controller();
    let host_id = create(&controller, "mock", "snap").await;
    let host = HostRef::Id(host_id);
    let root = fleet.mock("mock").host_dir(&host_id);

    let fixture = write_fixture(&root);
    let snapshot = SnapshotManager::new(controller.clone())
        .create_snapshot(&host, Some("fixture".into()))
        .await
        .unwrap();

    fs::write(root.join("work/notes.txt"), "rewritten").unwrap();
    fs::remove_file(root.join("work/src/main.rs")).unwrap();
    fs::write(root.join("work/extra.txt"), "not in the snapshot").unwrap();

    controller.stop_host(&host, false, STOP_TIMEOUT).await.unwrap();
    let restored = controller.start_host(&host, Some(&snapshot)).await.unwrap();

    assert_eq!(restored.state, HostState::Running);
    assert_eq!(read_fixture(&root, &fixture), fixture);
    assert!(!root.join("work/extra.txt").exists());
}

#[tokio::test]
async fn terminated_host_restarts_from_its_snapshot() {
    let fleet = Fleet::new(&[(
        "mock",
        ProviderCapabilities {
            supports_shutdown_hosts: false,
            ..MockProvider::full_capabilities()
        },
    )]);
    let controller = fleet.controller();
    let host_id = create(&controller, "mock", "ephemeral").await;
    let host = HostRef::Id(host_id);
    let root = fleet.mock("mock").host_dir(&host_id);

    let fixture = write_fixture(&root);
    let snapshot = SnapshotManager::new(controller.clone())
        .create_snapshot(&host, Some("before-stop".into()))
        .await
        .unwrap();

    let outcome = controller.stop_host(&host, false, STOP_TIMEOUT).await.unwrap();
    assert!(matches!(outcome, StopOutcome::Stopped(ref v) if v.state() == HostState::Stopped));
    assert!(fleet.mock("mock").calls().iter().any(|c| c.starts_with("terminate")));
    assert!(!root.exists(), "terminate keeps no filesystem");

    let restored = controller.start_host(&host, Some(&snapshot)).await.unwrap();
    assert_eq!(restored.state, HostState::Running);
    assert_eq!(read_fixture(&root, &fixture), fixture);
}

#[tokio::test]
async fn starting_a_running_host_from_a_snapshot_restores_it() {
    let fleet = Fleet::full(&["mock"]);
    let controller = fleet.controller();
    let host_id = create(&controller, "mock", "hot").await;
    let host = HostRef::Id(host_id);
    let root = fleet.mock("mock").host_dir(&host_id);

    let fixture = write_fixture(&root);
    let snapshot = SnapshotManager::new(controller.clone())
        .create_snapshot(&host, None)
        .await
        .unwrap();
    fs::write(root.join("work/notes.txt"), "changed").unwrap();

    controller.start_host(&host, Some(&snapshot)).await.unwrap();
    assert_eq!(read_fixture(&root, &fixture), fixture);
    assert!(fleet
        .mock("mock")
        .calls()
        .iter()
        .any(|c| c.starts_with("stop")));
}

// =============================================================================
// Locking
// =============================================================================

#[tokio::test]
async fn concurrent_mutations_on_one_host_serialize() {
    let fleet = Fleet::full(&["mock"]);
    let host_id = create(&fleet.controller(), "mock", "contended").await;

    let holder = fleet.invocation();
    let guard = holder.locks().acquire(&host_id, "test").await.unwrap();

    let waiter = fleet.controller();
    let task = tokio::spawn(async move {
        waiter
            .stop_host(&HostRef::Id(host_id), false, STOP_TIMEOUT)
            .await
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    let stopped_early = fleet.mock("mock").calls().iter().any(|c| c.starts_with("stop"));
    assert!(!stopped_early, "stop ran while another invocation held the lock");

    drop(guard);
    let outcome = task.await.unwrap().unwrap();
    assert!(matches!(outcome, StopOutcome::Stopped(_)));
    assert_eq!(fleet.mock("mock").state_of(&host_id), Some(HostState::Stopped));
}

#[tokio::test]
async fn lock_wait_timeout_is_retriable() {
    let fleet = Fleet::full(&["mock"]);
    let host_id = create(&fleet.controller(), "mock", "busy").await;

    let holder = fleet.invocation();
    let _guard = holder.locks().acquire(&host_id, "test").await.unwrap();

    let impatient = MngConfig {
        lock_wait_seconds: 1,
        ..fleet.config.clone()
    };
    let controller = HostController::new(fleet.invocation_with(impatient, HookRegistry::new()));
    let err = controller
        .destroy_host(&HostRef::Id(host_id), false)
        .await
        .unwrap_err();

    assert!(matches!(err, ControlError::Lock(LockError::Timeout { .. })));
    assert!(err.is_retriable());
    assert_eq!(fleet.mock("mock").state_of(&host_id), Some(HostState::Running));
}

// =============================================================================
// Hooks
// =============================================================================

struct Provisioner;

#[async_trait]
impl HostHook for Provisioner {
    fn name(&self) -> &str {
        "provisioner"
    }

    async fn run(&self, input: HookInput<'_>) -> mng_control::Result<()> {
        let access = input.access.expect("created hosts are live");
        access
            .write_file("provisioned", input.host.name().as_str().as_bytes(), false)
            .await?;
        Ok(())
    }
}

struct Broken;

#[async_trait]
impl HostHook for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    async fn run(&self, _input: HookInput<'_>) -> mng_control::Result<()> {
        Err(ControlError::Config("broken hook".into()))
    }
}

#[tokio::test]
async fn failing_hook_is_disabled_and_the_command_continues() {
    let fleet = Fleet::full(&["mock"]);
    let mut hooks = HookRegistry::new();
    hooks.register(Hook::AfterHostCreated(Arc::new(Broken)));
    hooks.register(Hook::AfterHostCreated(Arc::new(Provisioner)));
    let ctx = fleet.invocation_with(fleet.config.clone(), hooks);
    let controller = HostController::new(Arc::clone(&ctx));

    let first = create(&controller, "mock", "hooked-1").await;
    let second = create(&controller, "mock", "hooked-2").await;

    assert_eq!(ctx.hooks().disabled(), ["broken"]);
    for host_id in [first, second] {
        let marker = fleet.mock("mock").host_dir(&host_id).join("provisioned");
        assert!(marker.exists());
    }
}
