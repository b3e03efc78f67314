//! Host-side files every provider writes at creation.

use chrono::Utc;
use mng_core::layout::{
    self, ACTIVITY_CONFIG_FILE, HOST_DATA_FILE, SHUTDOWN_HOOK, WATCHER_OUTPUT, WATCHER_PID,
};
use mng_core::ActivitySource;
use mng_store::CertifiedHostData;

use crate::access::{ensure_success, shell_quote, HostAccess};
use crate::error::Result;

/// Outcome of asking a host to run its idle watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherLaunch {
    /// A new watcher process was started in the background.
    Started,
    /// The pid file points at a live watcher; nothing was started.
    AlreadyRunning,
    /// The watcher program is not installed on the host.
    Unavailable,
}

/// Write certified data, the activity config, the shutdown hook, and the
/// boot marker onto a freshly allocated host.
///
/// # Errors
///
/// Returns the first write that fails.
pub async fn write_host_files(
    access: &dyn HostAccess,
    certified: &CertifiedHostData,
    shutdown_script: &str,
) -> Result<()> {
    let data = serde_json::to_vec_pretty(certified)?;
    access.write_file(HOST_DATA_FILE, &data, false).await?;

    let config = serde_json::to_vec_pretty(&certified.activity_config)?;
    access.write_file(ACTIVITY_CONFIG_FILE, &config, false).await?;

    access
        .write_file(SHUTDOWN_HOOK, shutdown_script.as_bytes(), true)
        .await?;

    touch_marker(access, ActivitySource::Boot).await?;

    tracing::debug!(
        host_id = %certified.host_id,
        host_dir = access.host_dir(),
        "Wrote host bootstrap files"
    );
    Ok(())
}

/// Refresh a host-scoped activity marker.
///
/// # Errors
///
/// Returns an error if the marker cannot be written.
pub async fn touch_marker(access: &dyn HostAccess, source: ActivitySource) -> Result<()> {
    access
        .write_file(
            &layout::host_marker(source),
            Utc::now().to_rfc3339().as_bytes(),
            false,
        )
        .await
}

/// Read back the certified data of a live host.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be parsed.
pub async fn read_certified(access: &dyn HostAccess) -> Result<Option<CertifiedHostData>> {
    match access.read_file(HOST_DATA_FILE).await? {
        Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        None => Ok(None),
    }
}

/// Start the idle watcher on a host unless one is already running.
///
/// The watcher is detached from the access channel with all of its standard
/// streams redirected, and its pid is recorded under `logs/` so a later boot
/// does not start a second copy.
///
/// # Errors
///
/// Returns an error if the transport fails or the launch script exits non-zero.
pub async fn launch_watcher(access: &dyn HostAccess, program: &str) -> Result<WatcherLaunch> {
    let pid = shell_quote(&access.resolve(WATCHER_PID));
    let out = shell_quote(&access.resolve(WATCHER_OUTPUT));
    let logs = shell_quote(&access.resolve("logs"));
    let quoted = shell_quote(program);
    let installed = if program.contains('/') {
        format!("[ -x {quoted} ]")
    } else {
        format!("command -v {quoted} >/dev/null 2>&1")
    };
    let script = format!(
        "mkdir -p {logs}\n\
         if [ -f {pid} ] && kill -0 \"$(cat {pid})\" 2>/dev/null; then echo running; exit 0; fi\n\
         if ! {installed}; then echo missing; exit 0; fi\n\
         nohup {quoted} --host-dir {dir} < /dev/null >> {out} 2>&1 &\n\
         echo $! > {pid}\n\
         echo started\n",
        dir = shell_quote(access.host_dir()),
    );
    let output = ensure_success("sh", &script, access.run(&script, None).await?)?;
    let launch = match output.stdout_lossy().trim() {
        "running" => WatcherLaunch::AlreadyRunning,
        "missing" => WatcherLaunch::Unavailable,
        _ => WatcherLaunch::Started,
    };
    tracing::debug!(host_dir = access.host_dir(), program, ?launch, "Idle watcher launch");
    Ok(launch)
}

/// Launch the idle watcher, logging instead of failing.
///
/// A host without a watcher still works; it just never stops itself.
pub async fn ensure_watcher(access: &dyn HostAccess, program: &str) {
    match launch_watcher(access, program).await {
        Ok(WatcherLaunch::Unavailable) => tracing::warn!(
            host_dir = access.host_dir(),
            program,
            "Idle watcher is not installed on the host; idle shutdown is disabled"
        ),
        Ok(_) => {}
        Err(e) => tracing::warn!(
            host_dir = access.host_dir(),
            program,
            error = %e,
            "Failed to launch idle watcher"
        ),
    }
}

/// Wrap a backend-specific body into a shutdown hook script.
///
/// The hook records its invocation in the watcher log before acting.
#[must_use]
pub fn shutdown_script(body: &str) -> String {
    format!(
        "#!/bin/sh\n\
         set -u\n\
         HOST_DIR=\"$(cd \"$(dirname \"$0\")/..\" && pwd)\"\n\
         mkdir -p \"$HOST_DIR/logs\"\n\
         echo \"$(date -u +%Y-%m-%dT%H:%M:%SZ) shutdown hook invoked: ${{1:-idle}}\" >> \"$HOST_DIR/{log}\"\n\
         {body}\n",
        log = layout::WATCHER_LOG,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::LocalAccess;
    use mng_core::{ActivityConfig, HostId, IdleMode};
    use tempfile::TempDir;

    #[tokio::test]
    async fn bootstrap_writes_contract_files() {
        let dir = TempDir::new().unwrap();
        let access = LocalAccess::new(dir.path());
        let certified = CertifiedHostData::new(
            HostId::generate(),
            "dev".parse().unwrap(),
            ActivityConfig::new(IdleMode::Ssh, 300),
        );

        write_host_files(&access, &certified, &shutdown_script("exit 0"))
            .await
            .unwrap();

        assert!(dir.path().join("activity/boot").exists());
        assert!(dir.path().join("commands/shutdown.sh").exists());
        let config: ActivityConfig = serde_json::from_slice(
            &std::fs::read(dir.path().join("activity_config.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(config.idle_mode, IdleMode::Ssh);
        assert_eq!(read_certified(&access).await.unwrap(), Some(certified));
    }

    #[tokio::test]
    async fn shutdown_script_logs_invocation() {
        let dir = TempDir::new().unwrap();
        let access = LocalAccess::new(dir.path());
        access
            .write_file(SHUTDOWN_HOOK, shutdown_script("exit 0").as_bytes(), true)
            .await
            .unwrap();

        let output = access.run("./commands/shutdown.sh max_age", None).await.unwrap();
        assert!(output.success(), "{}", output.stderr);
        let log = std::fs::read_to_string(dir.path().join(layout::WATCHER_LOG)).unwrap();
        assert!(log.contains("shutdown hook invoked: max_age"));
    }

    fn fake_watcher(dir: &std::path::Path) -> String {
        let program = dir.join("fake-watcher");
        std::fs::write(
            &program,
            "#!/bin/sh\necho \"$@\" > \"$2/launched\"\nexec sleep 30\n",
        )
        .unwrap();
        let mut perms = std::fs::metadata(&program).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&program, perms).unwrap();
        program.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn watcher_is_launched_once_with_host_dir() {
        let bin = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let access = LocalAccess::new(dir.path());
        let program = fake_watcher(bin.path());

        let launch = launch_watcher(&access, &program).await.unwrap();
        assert_eq!(launch, WatcherLaunch::Started);

        let launched = dir.path().join("launched");
        for _ in 0..100 {
            if std::fs::read_to_string(&launched).is_ok_and(|s| s.ends_with('\n')) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        let args = std::fs::read_to_string(&launched).unwrap();
        assert_eq!(args.trim(), format!("--host-dir {}", access.host_dir()));

        let again = launch_watcher(&access, &program).await.unwrap();
        assert_eq!(again, WatcherLaunch::AlreadyRunning);

        let pid = std::fs::read_to_string(dir.path().join(WATCHER_PID)).unwrap();
        access.run(&format!("kill {}", pid.trim()), None).await.unwrap();
    }

    #[tokio::test]
    async fn missing_watcher_is_reported_unavailable() {
        let dir = TempDir::new().unwrap();
        let access = LocalAccess::new(dir.path());

        let launch = launch_watcher(&access, "mng-idle-watcher-not-installed")
            .await
            .unwrap();
        assert_eq!(launch, WatcherLaunch::Unavailable);
        assert!(!dir.path().join(WATCHER_PID).exists());
    }
}
