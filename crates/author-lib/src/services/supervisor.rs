//! Backend Process Supervisor
//!
//! Launches the agent runtime as a child process in its own process group,
//! waits for its health endpoint, and shuts it down with SIGTERM followed by
//! SIGKILL after a grace period.

use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use url::Url;

use crate::services::error::{AuthorError, AuthorResult};
use crate::utils::config::BackendConfig;

/// Upper bound for a single health request
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Endpoint
// ============================================================================

/// Network location of the agent runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendEndpoint {
    pub host: String,
    pub port: u16,
}

impl BackendEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(config.host.clone(), config.port)
    }

    fn url(&self, scheme: &str, path: &str) -> AuthorResult<Url> {
        let raw = format!("{}://{}:{}", scheme, self.host, self.port);
        let base = Url::parse(&raw)
            .map_err(|e| AuthorError::Config(format!("Invalid backend address {}: {}", raw, e)))?;
        base.join(path)
            .map_err(|e| AuthorError::Config(format!("Invalid path {}: {}", path, e)))
    }

    pub fn health_url(&self, path: &str) -> AuthorResult<Url> {
        self.url("http", path)
    }

    pub fn agent_url(&self, path: &str) -> AuthorResult<Url> {
        self.url("ws", path)
    }
}

// ============================================================================
// Supervisor
// ============================================================================

struct RunningBackend {
    child: Child,
    /// Process group ID (for termination)
    #[cfg(unix)]
    pgid: Option<i32>,
}

pub struct BackendSupervisor {
    config: BackendConfig,
    endpoint: BackendEndpoint,
    health_url: Url,
    http: reqwest::Client,
    running: Mutex<Option<RunningBackend>>,
}

impl BackendSupervisor {
    pub fn new(config: BackendConfig) -> AuthorResult<Self> {
        let endpoint = BackendEndpoint::from_config(&config);
        let health_url = endpoint.health_url(&config.health_path)?;
        // Loopback probe; a system proxy must never see it
        let http = reqwest::Client::builder()
            .no_proxy()
            .timeout(HEALTH_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AuthorError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config,
            endpoint,
            health_url,
            http,
            running: Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> &BackendEndpoint {
        &self.endpoint
    }

    /// Launch the runtime and wait until it is healthy
    ///
    /// Returns immediately if a healthy child is already running. With
    /// `spawn = false` only the health check is performed.
    pub async fn start(&self) -> AuthorResult<BackendEndpoint> {
        let mut running = self.running.lock().await;

        if let Some(backend) = running.as_mut() {
            match backend.child.try_wait() {
                Ok(None) => return Ok(self.endpoint.clone()),
                Ok(Some(status)) => {
                    log::warn!("[BackendSupervisor] Previous backend exited with {}", status);
                    *running = None;
                }
                Err(e) => {
                    log::warn!("[BackendSupervisor] Cannot query previous backend: {}", e);
                    *running = None;
                }
            }
        }

        if !self.config.spawn {
            log::info!(
                "[BackendSupervisor] Spawning disabled, waiting for {}",
                self.health_url
            );
            self.wait_until_healthy(None).await?;
            return Ok(self.endpoint.clone());
        }

        let mut backend = self.spawn()?;
        if let Err(e) = self.wait_until_healthy(Some(&mut backend)).await {
            if matches!(e, AuthorError::StartupTimeout(_)) {
                terminate(&mut backend, Duration::ZERO).await;
            }
            return Err(e);
        }

        log::info!(
            "[BackendSupervisor] Backend healthy at {}:{}",
            self.endpoint.host,
            self.endpoint.port
        );
        *running = Some(backend);
        Ok(self.endpoint.clone())
    }

    /// Terminate the runtime. Stopping a stopped supervisor is a no-op.
    pub async fn stop(&self) -> AuthorResult<()> {
        let Some(mut backend) = self.running.lock().await.take() else {
            return Ok(());
        };
        terminate(&mut backend, self.config.shutdown_grace()).await;
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        match self.running.lock().await.as_mut() {
            Some(backend) => matches!(backend.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn spawn(&self) -> AuthorResult<RunningBackend> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| AuthorError::Config("backend command is empty".to_string()))?;

        let mut std_cmd = std::process::Command::new(program);
        std_cmd
            .args(args)
            .env("BACKEND_HOST", &self.endpoint.host)
            .env("BACKEND_PORT", self.endpoint.port.to_string())
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.config.working_dir {
            std_cmd.current_dir(dir);
        }

        // New process group so the runtime's own children are signalled too
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }

        let mut child = Command::from(std_cmd)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AuthorError::SpawnFailed(format!("{}: {}", program, e)))?;

        let pid = child.id();
        log::info!(
            "[BackendSupervisor] Spawned {} (pid {:?}) for {}:{}",
            self.config.command.join(" "),
            pid,
            self.endpoint.host,
            self.endpoint.port
        );

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pipe_lines(stdout, log::Level::Info));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pipe_lines(stderr, log::Level::Warn));
        }

        Ok(RunningBackend {
            child,
            #[cfg(unix)]
            pgid: pid.map(|p| p as i32),
        })
    }

    async fn wait_until_healthy(&self, mut backend: Option<&mut RunningBackend>) -> AuthorResult<()> {
        let timeout = self.config.startup_timeout();
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(backend) = backend.as_deref_mut() {
                match backend.child.try_wait() {
                    Ok(Some(status)) => {
                        log::error!("[BackendSupervisor] Backend exited during startup: {}", status);
                        return Err(AuthorError::BackendExited(status.to_string()));
                    }
                    Ok(None) => {}
                    Err(e) => return Err(AuthorError::BackendExited(e.to_string())),
                }
            }

            if self.probe().await {
                return Ok(());
            }

            if Instant::now() >= deadline {
                log::error!(
                    "[BackendSupervisor] No healthy response from {} within {:?}",
                    self.health_url,
                    timeout
                );
                return Err(AuthorError::StartupTimeout(timeout.as_millis() as u64));
            }
            tokio::time::sleep(self.config.health_poll_interval()).await;
        }
    }

    async fn probe(&self) -> bool {
        match self.http.get(self.health_url.clone()).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                log::debug!("[BackendSupervisor] Health probe failed: {}", e);
                false
            }
        }
    }
}

/// SIGTERM the process group, then SIGKILL once `grace` has elapsed
async fn terminate(backend: &mut RunningBackend, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pgid) = backend.pgid {
            log::info!("[BackendSupervisor] Stopping process group {}", pgid);
            unsafe {
                libc::kill(-pgid, libc::SIGTERM);
            }

            if tokio::time::timeout(grace, backend.child.wait()).await.is_err() {
                log::warn!(
                    "[BackendSupervisor] Process group {} ignored SIGTERM, killing",
                    pgid
                );
                unsafe {
                    libc::kill(-pgid, libc::SIGKILL);
                }
            }
        } else {
            let _ = backend.child.kill().await;
        }
    }

    #[cfg(not(unix))]
    {
        let _ = grace;
        let _ = backend.child.kill().await;
    }

    match backend.child.wait().await {
        Ok(status) => log::info!("[BackendSupervisor] Backend stopped ({})", status),
        Err(e) => log::warn!("[BackendSupervisor] Failed to reap backend: {}", e),
    }
}

/// Forward child output to the log, one line per record
async fn pipe_lines<R>(reader: R, level: log::Level)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        log::log!(level, "[backend] {}", line);
    }
}
