//! Reading, writing, and executing on a live host.
//!
//! Every backend exposes a [`HostAccess`] handle. Paths passed to it are
//! relative to the host data root (see `mng_core::layout`). The default
//! file operations are expressed as small `sh` scripts so that a backend only
//! has to implement [`HostAccess::run`].

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use mng_store::SshInfo;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{ProviderError, Result};

/// Exit code used by `read_file` scripts to signal a missing file.
const MISSING_FILE_EXIT: i32 = 44;

/// Result of running a script on a host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code, `None` if the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: String,
}

impl ExecOutput {
    /// Returns true if the script exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Standard output decoded lossily.
    #[must_use]
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Quote a string for safe inclusion in a POSIX shell command line.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// A channel to a live host's filesystem and shell.
#[async_trait]
pub trait HostAccess: Send + Sync {
    /// Host data root as seen from inside the host.
    fn host_dir(&self) -> &str;

    /// Run an `sh` script on the host, optionally feeding `stdin`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails. A non-zero exit status is
    /// reported through [`ExecOutput`], not as an error.
    async fn run(&self, script: &str, stdin: Option<&[u8]>) -> Result<ExecOutput>;

    /// Absolute in-host path of a host-relative path.
    fn resolve(&self, relative: &str) -> String {
        format!("{}/{}", self.host_dir().trim_end_matches('/'), relative)
    }

    /// Read a file, returning `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails or the file is unreadable.
    async fn read_file(&self, relative: &str) -> Result<Option<Vec<u8>>> {
        let path = shell_quote(&self.resolve(relative));
        let script = format!("[ -f {path} ] || exit {MISSING_FILE_EXIT}; cat {path}");
        let output = self.run(&script, None).await?;
        match output.exit_code {
            Some(0) => Ok(Some(output.stdout)),
            Some(MISSING_FILE_EXIT) => Ok(None),
            code => Err(ProviderError::Command {
                program: "sh".into(),
                args: script,
                code,
                stderr: output.stderr,
            }),
        }
    }

    /// Write a file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails or the write is rejected.
    async fn write_file(&self, relative: &str, contents: &[u8], executable: bool) -> Result<()> {
        let resolved = self.resolve(relative);
        let parent = resolved
            .rsplit_once('/')
            .map_or(".", |(dir, _)| if dir.is_empty() { "/" } else { dir })
            .to_string();
        let path = shell_quote(&resolved);
        let mut script = format!("mkdir -p {} && cat > {path}", shell_quote(&parent));
        if executable {
            script.push_str(&format!(" && chmod +x {path}"));
        }
        let output = self.run(&script, Some(contents)).await?;
        ensure_success("sh", &script, output).map(|_| ())
    }

    /// List the entry names of a directory; a missing directory is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    async fn list_dir(&self, relative: &str) -> Result<Vec<String>> {
        let script = format!("ls -1A {} 2>/dev/null || true", shell_quote(&self.resolve(relative)));
        let output = self.run(&script, None).await?;
        let output = ensure_success("sh", &script, output)?;
        Ok(output
            .stdout_lossy()
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

pub(crate) fn ensure_success(program: &str, args: &str, output: ExecOutput) -> Result<ExecOutput> {
    if output.success() {
        Ok(output)
    } else {
        Err(ProviderError::Command {
            program: program.to_string(),
            args: args.to_string(),
            code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

/// Run a local process to completion, killing it if the future is dropped.
pub(crate) async fn run_process(
    program: &str,
    args: &[String],
    stdin: Option<&[u8]>,
    current_dir: Option<&Path>,
) -> Result<ExecOutput> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = current_dir {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|source| ProviderError::Spawn {
        program: program.to_string(),
        source,
    })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input)
            .await
            .map_err(|e| ProviderError::io(program, e))?;
        drop(pipe);
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| ProviderError::io(program, e))?;

    Ok(ExecOutput {
        exit_code: output.status.code(),
        stdout: output.stdout,
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Access to a host whose data root is a directory on this machine.
#[derive(Debug, Clone)]
pub struct LocalAccess {
    root: PathBuf,
    root_str: String,
}

impl LocalAccess {
    /// Create access rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root_str = root.to_string_lossy().into_owned();
        Self { root, root_str }
    }

    /// The data root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl HostAccess for LocalAccess {
    fn host_dir(&self) -> &str {
        &self.root_str
    }

    async fn run(&self, script: &str, stdin: Option<&[u8]>) -> Result<ExecOutput> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| ProviderError::io(&self.root, e))?;
        run_process("sh", &["-c".to_string(), script.to_string()], stdin, Some(&self.root)).await
    }

    async fn read_file(&self, relative: &str) -> Result<Option<Vec<u8>>> {
        let path = self.root.join(relative);
        match tokio::fs::read(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProviderError::io(path, e)),
        }
    }

    async fn write_file(&self, relative: &str, contents: &[u8], executable: bool) -> Result<()> {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProviderError::io(parent, e))?;
        }
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| ProviderError::io(&path, e))?;

        #[cfg(unix)]
        if executable {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .await
                .map_err(|e| ProviderError::io(&path, e))?;
        }
        #[cfg(not(unix))]
        let _ = executable;
        Ok(())
    }

    async fn list_dir(&self, relative: &str) -> Result<Vec<String>> {
        let path = self.root.join(relative);
        let mut entries = match tokio::fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ProviderError::io(path, e)),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ProviderError::io(&path, e))?
        {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

/// How [`CommandAccess`] reaches the host.
#[derive(Debug, Clone)]
pub enum Transport {
    /// `docker exec` into a running container.
    Docker {
        /// The docker binary.
        binary: String,
        /// Container id or name.
        container: String,
    },
    /// `ssh` to a remote machine.
    Ssh(SshInfo),
}

/// Access to a host through an external command.
#[derive(Debug, Clone)]
pub struct CommandAccess {
    transport: Transport,
    host_dir: String,
}

impl CommandAccess {
    /// Create access over `transport` with the given in-host data root.
    #[must_use]
    pub fn new(transport: Transport, host_dir: impl Into<String>) -> Self {
        Self {
            transport,
            host_dir: host_dir.into(),
        }
    }

    fn command_line(&self, script: &str, interactive: bool) -> (String, Vec<String>) {
        match &self.transport {
            Transport::Docker { binary, container } => {
                let mut args = vec!["exec".to_string()];
                if interactive {
                    args.push("-i".to_string());
                }
                args.extend([
                    container.clone(),
                    "sh".to_string(),
                    "-c".to_string(),
                    script.to_string(),
                ]);
                (binary.clone(), args)
            }
            Transport::Ssh(info) => {
                let mut args = vec![
                    "-o".to_string(),
                    "BatchMode=yes".to_string(),
                    "-o".to_string(),
                    "StrictHostKeyChecking=accept-new".to_string(),
                    "-p".to_string(),
                    info.port.to_string(),
                ];
                if let Some(key) = &info.key_path {
                    args.push("-i".to_string());
                    args.push(key.to_string_lossy().into_owned());
                }
                args.push(info.destination());
                args.push(format!("sh -c {}", shell_quote(script)));
                ("ssh".to_string(), args)
            }
        }
    }
}

#[async_trait]
impl HostAccess for CommandAccess {
    fn host_dir(&self) -> &str {
        &self.host_dir
    }

    async fn run(&self, script: &str, stdin: Option<&[u8]>) -> Result<ExecOutput> {
        let (program, args) = self.command_line(script, stdin.is_some());
        tracing::trace!(program = %program, "Running host command");
        run_process(&program, &args, stdin, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn quoting_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn docker_command_line() {
        let access = CommandAccess::new(
            Transport::Docker {
                binary: "docker".into(),
                container: "mng-dev".into(),
            },
            "/mng",
        );
        let (program, args) = access.command_line("true", true);
        assert_eq!(program, "docker");
        assert_eq!(args, vec!["exec", "-i", "mng-dev", "sh", "-c", "true"]);
        assert_eq!(access.resolve("data.json"), "/mng/data.json");
    }

    #[test]
    fn ssh_command_line_quotes_script() {
        let access = CommandAccess::new(
            Transport::Ssh(SshInfo {
                address: "10.0.0.2".into(),
                port: 2222,
                user: "ubuntu".into(),
                key_path: None,
            }),
            "/srv/mng",
        );
        let (program, args) = access.command_line("echo 'hi'", false);
        assert_eq!(program, "ssh");
        assert!(args.contains(&"2222".to_string()));
        assert_eq!(args.last().unwrap(), r"sh -c 'echo '\''hi'\'''");
    }

    #[tokio::test]
    async fn local_access_round_trip() {
        let dir = TempDir::new().unwrap();
        let access = LocalAccess::new(dir.path());

        assert_eq!(access.read_file("data.json").await.unwrap(), None);
        access
            .write_file("commands/shutdown.sh", b"#!/bin/sh\nexit 0\n", true)
            .await
            .unwrap();
        assert_eq!(access.list_dir("commands").await.unwrap(), vec!["shutdown.sh"]);
        assert!(access.list_dir("missing").await.unwrap().is_empty());

        let output = access.run("./commands/shutdown.sh && echo ok", None).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout_lossy().trim(), "ok");
    }

    #[tokio::test]
    async fn default_file_ops_over_shell() {
        struct ShellOnly(LocalAccess);

        #[async_trait]
        impl HostAccess for ShellOnly {
            fn host_dir(&self) -> &str {
                self.0.host_dir()
            }

            async fn run(&self, script: &str, stdin: Option<&[u8]>) -> Result<ExecOutput> {
                self.0.run(script, stdin).await
            }
        }

        let dir = TempDir::new().unwrap();
        let access = ShellOnly(LocalAccess::new(dir.path()));

        assert_eq!(access.read_file("agents/x/status").await.unwrap(), None);
        access.write_file("agents/x/status", b"waiting", false).await.unwrap();
        assert_eq!(
            access.read_file("agents/x/status").await.unwrap().as_deref(),
            Some(&b"waiting"[..])
        );
        assert_eq!(access.list_dir("agents").await.unwrap(), vec!["x"]);
    }
}
