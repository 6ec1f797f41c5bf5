use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use super::client::embed_batch;
use super::error::InferenceError;
use super::registry;
use crate::os::{lower_priority, terminate_process};

const STDERR_TAIL_LINES: usize = 40;
const PORT_RANGE: std::ops::Range<u16> = 20_000..60_000;
const PORT_ATTEMPTS: usize = 20;
const STOP_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServerRole {
    Background,
    Query,
}

impl ServerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Background => "background",
            Self::Query => "query",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub executable: PathBuf,
    pub model: PathBuf,
    pub threads: Option<usize>,
    pub gpu_layers: u32,
    pub context_size: u32,
    pub batch_tokens: u32,
    pub parallel: u32,
    pub niceness: i32,
    pub startup_timeout: Duration,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    pub request_timeout: Duration,
}

impl ServerConfig {
    pub fn new(executable: impl Into<PathBuf>, model: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            model: model.into(),
            threads: None,
            gpu_layers: 99,
            context_size: 8192,
            batch_tokens: 2048,
            parallel: 4,
            niceness: 10,
            startup_timeout: Duration::from_secs(30),
            health_interval: Duration::from_millis(250),
            health_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(120),
        }
    }

    fn args(&self, port: u16) -> Vec<String> {
        let mut args = vec![
            "--model".to_string(),
            self.model.display().to_string(),
            "--host".to_string(),
            Ipv4Addr::LOCALHOST.to_string(),
            "--port".to_string(),
            port.to_string(),
            "--embeddings".to_string(),
            "--pooling".to_string(),
            "mean".to_string(),
            "--alias".to_string(),
            "embedding".to_string(),
            "-ngl".to_string(),
            self.gpu_layers.to_string(),
            "--flash-attn".to_string(),
            "--cont-batching".to_string(),
            "--ctx-size".to_string(),
            self.context_size.to_string(),
            "--batch-size".to_string(),
            self.batch_tokens.to_string(),
            "--ubatch-size".to_string(),
            self.batch_tokens.to_string(),
            "--parallel".to_string(),
            self.parallel.to_string(),
        ];
        if let Some(threads) = self.threads {
            args.push("--threads".to_string());
            args.push(threads.to_string());
        }
        args
    }
}

/// A running `llama-server` child. Dropping the handle kills the process.
pub struct ServerHandle {
    child: Child,
    pid: u32,
    port: u16,
    role: ServerRole,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_reader: Option<thread::JoinHandle<()>>,
    agent: ureq::Agent,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("pid", &self.pid)
            .field("port", &self.port)
            .field("role", &self.role)
            .finish()
    }
}

impl ServerHandle {
    /// Spawns the server and waits until `/health` answers.
    pub fn start(config: &ServerConfig, role: ServerRole) -> Result<Self, InferenceError> {
        let port = pick_free_port()?;
        let mut command = Command::new(&config.executable);
        command
            .args(config.args(port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        // Terminal signals go to our group only; the server is stopped by us.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        if let Some(lib_dir) = config.executable.parent() {
            prepend_library_path(&mut command, lib_dir);
        }

        let mut child = command.spawn().map_err(|err| {
            InferenceError::io(format!("spawn {}", config.executable.display()), err)
        })?;
        let pid = child.id();
        registry::register(pid, role);
        lower_priority(pid, config.niceness);

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let mut stderr_reader = None;
        if let Some(stderr) = child.stderr.take() {
            let tail = Arc::clone(&stderr_tail);
            let spawned = thread::Builder::new()
                .name(format!("llama-{}-stderr", role.as_str()))
                .spawn(move || {
                    for line in BufReader::new(stderr).lines() {
                        let Ok(line) = line else { break };
                        let mut tail = tail.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                });
            match spawned {
                Ok(reader) => stderr_reader = Some(reader),
                Err(err) => warn!(error = %err, "failed to capture inference server stderr"),
            }
        }

        let agent_config = ureq::Agent::config_builder()
            .timeout_global(Some(config.request_timeout))
            .build();
        let mut handle = Self {
            child,
            pid,
            port,
            role,
            stderr_tail,
            stderr_reader,
            agent: ureq::Agent::new_with_config(agent_config),
        };

        info!(pid, port, role = role.as_str(), "inference server starting");
        handle.wait_until_healthy(config)?;
        info!(pid, port, role = role.as_str(), "inference server ready");
        Ok(handle)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", Ipv4Addr::LOCALHOST, self.port)
    }

    pub fn recent_stderr(&self) -> String {
        let tail = self
            .stderr_tail
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tail.iter().cloned().collect::<Vec<String>>().join("\n")
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    pub fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, InferenceError> {
        embed_batch(&self.agent, &self.base_url(), texts)
    }

    /// SIGTERM, a short wait, then SIGKILL.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn wait_until_healthy(&mut self, config: &ServerConfig) -> Result<(), InferenceError> {
        let started = Instant::now();
        let probe_config = ureq::Agent::config_builder()
            .timeout_global(Some(config.health_timeout))
            .build();
        let probe = ureq::Agent::new_with_config(probe_config);
        let url = format!("{}/health", self.base_url());

        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                // The pipe is closed now, so the reader finishes the tail.
                if let Some(reader) = self.stderr_reader.take() {
                    let _ = reader.join();
                }
                registry::unregister(self.pid);
                return Err(InferenceError::ExitedEarly {
                    status: status.to_string(),
                    stderr: self.recent_stderr(),
                });
            }

            match probe.get(&url).call() {
                Ok(_) => return Ok(()),
                Err(err) => debug!(port = self.port, error = %err, "inference server not ready yet"),
            }

            if started.elapsed() >= config.startup_timeout {
                let stderr = self.recent_stderr();
                self.shutdown();
                return Err(InferenceError::StartupTimeout {
                    seconds: config.startup_timeout.as_secs(),
                    stderr,
                });
            }
            thread::sleep(config.health_interval);
        }
    }

    fn shutdown(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            registry::unregister(self.pid);
            return;
        }

        terminate_process(self.pid);
        let deadline = Instant::now() + STOP_GRACE;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                registry::unregister(self.pid);
                debug!(pid = self.pid, "inference server stopped");
                return;
            }
            thread::sleep(Duration::from_millis(50));
        }

        warn!(pid = self.pid, "inference server ignored SIGTERM; killing");
        let _ = self.child.kill();
        let _ = self.child.wait();
        registry::unregister(self.pid);
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.is_running() {
            self.shutdown();
        }
    }
}

/// At most one live server for one role; `start` while running is a no-op.
#[derive(Debug)]
pub struct InferenceService {
    config: ServerConfig,
    role: ServerRole,
    handle: Option<ServerHandle>,
}

impl InferenceService {
    pub fn new(config: ServerConfig, role: ServerRole) -> Self {
        Self {
            config,
            role,
            handle: None,
        }
    }

    pub fn start(&mut self) -> Result<u16, InferenceError> {
        if let Some(handle) = self.handle.as_mut() {
            if handle.is_running() {
                return Ok(handle.port());
            }
            warn!(pid = handle.pid(), "inference server died; restarting");
            self.handle = None;
        }

        let handle = ServerHandle::start(&self.config, self.role)?;
        let port = handle.port();
        self.handle = Some(handle);
        Ok(port)
    }

    pub fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, InferenceError> {
        self.handle
            .as_ref()
            .ok_or(InferenceError::NotRunning)?
            .embed(texts)
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop();
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().map(ServerHandle::pid)
    }
}

/// Random port in a high range, confirmed by binding it; falls back to an
/// OS-assigned port.
pub fn pick_free_port() -> Result<u16, InferenceError> {
    let mut rng = rand::thread_rng();
    for _ in 0..PORT_ATTEMPTS {
        let port = rng.gen_range(PORT_RANGE);
        if TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok() {
            return Ok(port);
        }
    }

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .map_err(|err| InferenceError::io("bind an ephemeral port", err))?;
    let port = listener
        .local_addr()
        .map_err(|err| InferenceError::io("read ephemeral port", err))?
        .port();
    Ok(port)
}

fn prepend_library_path(command: &mut Command, lib_dir: &Path) {
    let variable = if cfg!(target_os = "macos") {
        "DYLD_LIBRARY_PATH"
    } else if cfg!(windows) {
        "PATH"
    } else {
        "LD_LIBRARY_PATH"
    };

    let mut paths = vec![lib_dir.to_path_buf()];
    if let Some(existing) = std::env::var_os(variable) {
        paths.extend(std::env::split_paths(&existing));
    }
    if let Ok(joined) = std::env::join_paths(paths) {
        command.env(variable, joined);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_args_request_mean_pooled_embeddings() {
        let mut config = ServerConfig::new("/opt/llama-server", "/models/m.gguf");
        config.threads = Some(6);
        let args = config.args(41_234);
        let joined = args.join(" ");
        assert!(joined.contains("--embeddings"));
        assert!(joined.contains("--pooling mean"));
        assert!(joined.contains("--port 41234"));
        assert!(joined.contains("--host 127.0.0.1"));
        assert!(joined.contains("--flash-attn"));
        assert!(joined.contains("--cont-batching"));
        assert!(joined.contains("--threads 6"));
    }

    #[test]
    fn picked_port_is_bindable() {
        let port = pick_free_port().unwrap();
        assert!(port > 0);
    }

    #[cfg(unix)]
    #[test]
    fn early_exit_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-server");
        std::fs::write(&script, "#!/bin/sh\necho 'model file is broken' >&2\nexit 3\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let mut config = ServerConfig::new(&script, dir.path().join("m.gguf"));
        config.startup_timeout = Duration::from_secs(10);
        config.health_interval = Duration::from_millis(50);
        let err = ServerHandle::start(&config, ServerRole::Query).unwrap_err();
        match err {
            InferenceError::ExitedEarly { stderr, .. } => {
                assert!(stderr.contains("model file is broken"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn embed_without_start_is_not_running() {
        let service = InferenceService::new(
            ServerConfig::new("/nonexistent", "/nonexistent.gguf"),
            ServerRole::Background,
        );
        assert!(matches!(
            service.embed(&["hi".to_string()]),
            Err(InferenceError::NotRunning)
        ));
    }
}
