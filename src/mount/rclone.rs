//! rclone mount backend
//!
//! Mounts are served by `rclone mount` using an on-the-fly remote
//! (`:ftp,host=...:/path`), so nothing is written to rclone's own config.
//! Each mount process is started with its remote-control server on a private
//! loopback port; the liveness probe calls `rc/noop` on that port.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::{MountBackend, MountError, MountProcess, MountSpec, ProcessHandle};
use crate::config::{ConnectionConfig, Protocol};

/// Grace period between SIGTERM and a hard kill
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Timeout for `rclone obscure`
const OBSCURE_TIMEOUT: Duration = Duration::from_secs(10);

/// Backend that drives the `rclone` binary
pub struct RcloneBackend {
    binary: PathBuf,
    client: reqwest::Client,
    /// Live mount processes keyed by pid
    children: Mutex<HashMap<u32, Child>>,
}

impl RcloneBackend {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            client: reqwest::Client::new(),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Encode a password the way rclone expects it in a remote string
    async fn obscure(&self, password: &str) -> Result<String, MountError> {
        let mut child = Command::new(&self.binary)
            .args(["obscure", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MountError::Spawn(format!("{}: {}", self.binary.display(), e)))?;

        // Passed on stdin so the secret never shows up in the process list
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(password.as_bytes()).await?;
        }

        let output = timeout(OBSCURE_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| MountError::Spawn("rclone obscure timed out".to_string()))??;

        if !output.status.success() {
            return Err(MountError::Spawn(format!(
                "rclone obscure failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Quote a connection-string value when it contains separators
fn quote(value: &str) -> String {
    if value.contains([',', ':', '"', '\'', '=']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Build the on-the-fly remote, e.g. `:ftp,host=h,port=21,user=u,pass=X:/srv`
pub fn remote_string(config: &ConnectionConfig, obscured_password: &str) -> String {
    let backend = match config.protocol {
        Protocol::Ftp | Protocol::Ftps => "ftp",
        Protocol::Sftp => "sftp",
    };

    let mut params = vec![
        format!("host={}", quote(&config.host)),
        format!("port={}", config.effective_port()),
        format!("user={}", quote(&config.username)),
        format!("pass={}", quote(obscured_password)),
        format!("idle_timeout={}", quote(&config.idle_timeout)),
    ];

    match config.protocol {
        Protocol::Ftps if !config.explicit_tls => params.push("tls=true".to_string()),
        Protocol::Ftps | Protocol::Ftp if config.explicit_tls => {
            params.push("explicit_tls=true".to_string())
        }
        _ => {}
    }
    if config.protocol != Protocol::Sftp && config.ignore_cert_errors {
        params.push("no_check_certificate=true".to_string());
    }

    let root = if config.remote_path.starts_with('/') {
        config.remote_path.clone()
    } else {
        format!("/{}", config.remote_path)
    };

    format!(":{},{}:{}", backend, params.join(","), root)
}

/// Arguments for `rclone mount`
pub fn mount_args(spec: &MountSpec, remote: &str, control_port: u16) -> Vec<String> {
    let mut args = vec![
        "mount".to_string(),
        remote.to_string(),
        spec.mount_point.path.to_string_lossy().to_string(),
        "--vfs-cache-mode".to_string(),
        spec.cache.mode.as_str().to_string(),
        "--volname".to_string(),
        spec.name.clone(),
        "--rc".to_string(),
        "--rc-addr".to_string(),
        format!("127.0.0.1:{}", control_port),
        "--rc-no-auth".to_string(),
    ];

    if let Some(refresh) = spec.cache.refresh_interval {
        args.push("--dir-cache-time".to_string());
        args.push(format!("{}s", refresh.as_secs()));
    }

    args
}

/// Find an available port by binding to :0, reading the assigned port, then releasing.
///
/// TOCTOU: the port may be taken before rclone binds it. The mount readiness
/// timeout catches that case.
async fn find_free_port() -> Result<u16, MountError> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Forward the mount process's stderr into our log
fn forward_stderr(child: &mut Child, name: String) {
    let Some(stderr) = child.stderr.take() else {
        return;
    };
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(target: "rclone", "[{}] {}", name, line);
        }
    });
}

#[async_trait]
impl MountBackend for RcloneBackend {
    async fn spawn(&self, spec: &MountSpec) -> Result<MountProcess, MountError> {
        let obscured = self.obscure(&spec.password).await?;
        let remote = remote_string(&spec.remote, &obscured);
        let control_port = find_free_port().await?;

        // FUSE needs an existing empty directory; Windows drive letters must not exist
        #[cfg(not(windows))]
        tokio::fs::create_dir_all(&spec.mount_point.path).await?;

        let mut child = Command::new(&self.binary)
            .args(mount_args(spec, &remote, control_port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MountError::Spawn(format!("{}: {}", self.binary.display(), e)))?;

        let pid = child
            .id()
            .ok_or_else(|| MountError::Spawn("mount process exited immediately".to_string()))?;

        forward_stderr(&mut child, spec.name.clone());
        self.children.lock().await.insert(pid, child);

        tracing::info!(
            "rclone mount for '{}' started (pid={}, mount={}, rc=127.0.0.1:{})",
            spec.name,
            pid,
            spec.mount_point,
            control_port
        );

        Ok(MountProcess {
            handle: ProcessHandle(pid),
            control_port,
        })
    }

    async fn probe(&self, control_port: u16, probe_timeout: Duration) -> Result<(), MountError> {
        let url = format!("http://127.0.0.1:{}/rc/noop", control_port);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body("{}")
            .timeout(probe_timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MountError::ProbeTimeout(probe_timeout)
                } else {
                    MountError::Probe(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(MountError::Probe(format!("HTTP {}", response.status())));
        }
        Ok(())
    }

    async fn terminate(&self, handle: ProcessHandle) -> Result<(), MountError> {
        let Some(mut child) = self.children.lock().await.remove(&handle.pid()) else {
            return Err(MountError::UnknownProcess(handle.pid()));
        };

        // SIGTERM lets rclone unmount cleanly
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Err(e) = kill(Pid::from_raw(handle.pid() as i32), Signal::SIGTERM) {
                tracing::debug!("SIGTERM to {} failed: {}", handle, e);
            }
            match timeout(TERMINATE_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!("Mount process {} exited: {}", handle, status);
                    return Ok(());
                }
                Ok(Err(e)) => {
                    return Err(MountError::Terminate {
                        pid: handle.pid(),
                        reason: e.to_string(),
                    })
                }
                Err(_) => {
                    tracing::warn!(
                        "Mount process {} ignored SIGTERM for {:?}, killing",
                        handle,
                        TERMINATE_GRACE
                    );
                }
            }
        }

        child.kill().await.map_err(|e| MountError::Terminate {
            pid: handle.pid(),
            reason: e.to_string(),
        })?;
        tracing::info!("Mount process {} killed", handle);
        Ok(())
    }

    async fn list_dir(
        &self,
        config: &ConnectionConfig,
        password: &str,
        list_timeout: Duration,
    ) -> Result<Vec<String>, MountError> {
        let obscured = self.obscure(password).await?;
        let remote = remote_string(config, &obscured);

        let output = timeout(
            list_timeout,
            Command::new(&self.binary)
                .args(["lsf", remote.as_str(), "--max-depth", "1"])
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| MountError::List(format!("timed out after {:?}", list_timeout)))?
        .map_err(|e| MountError::Spawn(format!("{}: {}", self.binary.display(), e)))?;

        if !output.status.success() {
            return Err(MountError::List(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}
