//! Supervision of the stream subsystem process: launch, watchdog, restart,
//! log collection

pub mod heartbeat;
pub mod journal;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::Config;
use heartbeat::{assess, Heartbeat, Liveness};
use journal::LogJournal;

/// Variables handing the stream target to the child
pub const ENV_PRIMARY: &str = "RTMP_URL";
pub const ENV_BACKUP: &str = "BACKUP_RTMP_URL";
pub const ENV_STREAM_KEY: &str = "STREAM_KEY";
pub const ENV_OVERLAY: &str = "OVERLAY_URL";

const TAIL_LINES: usize = 200;

/// Where the child should stream to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub primary: String,
    pub backup: Option<String>,
    pub stream_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub log_file: PathBuf,
    pub monitor_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub stop_grace: Duration,
    pub overlay_url: Option<String>,
    pub tail_lines: usize,
}

impl SupervisorConfig {
    /// Defaults to relaunching this executable as `stream`, passing the same
    /// configuration file along.
    pub fn from_config(config: &Config, config_path: Option<&Path>) -> Result<Self> {
        let settings = &config.supervisor;
        let (program, args) = match &settings.command {
            Some(command) => (command.clone(), settings.args.clone()),
            None => {
                let exe = std::env::current_exe()
                    .map_err(|e| eyre!("Failed to locate own executable: {}", e))?;
                let mut args = Vec::new();
                if let Some(path) = config_path {
                    args.push("--config".to_string());
                    args.push(path.display().to_string());
                }
                args.push("stream".to_string());
                (exe, args)
            }
        };

        Ok(Self {
            program,
            args,
            log_file: settings.log_file.clone(),
            monitor_interval: Duration::from_secs(settings.monitor_interval_secs.max(1)),
            heartbeat_timeout: Duration::from_secs(settings.heartbeat_timeout_secs),
            stop_grace: Duration::from_secs(settings.stop_grace_secs),
            overlay_url: Some(config.overlay.url.clone()).filter(|u| !u.is_empty()),
            tail_lines: TAIL_LINES,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartStatus {
    Started,
    AlreadyRunning,
}

#[derive(Default)]
struct SupervisorState {
    should_run: bool,
    target: Option<StreamTarget>,
    child: Option<Child>,
    monitor: Option<JoinHandle<()>>,
}

/// Keeps one stream subsystem process running while asked to
pub struct StreamSupervisor {
    config: SupervisorConfig,
    state: Mutex<SupervisorState>,
    heartbeat: Arc<Heartbeat>,
    journal: Arc<LogJournal>,
    launches: AtomicUsize,
}

impl StreamSupervisor {
    pub fn new(config: SupervisorConfig) -> Arc<Self> {
        let journal = Arc::new(LogJournal::new(&config.log_file, config.tail_lines));
        Arc::new(Self {
            config,
            state: Mutex::new(SupervisorState::default()),
            heartbeat: Arc::new(Heartbeat::new()),
            journal,
            launches: AtomicUsize::new(0),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.journal.subscribe()
    }

    pub fn recent_logs(&self) -> Vec<String> {
        self.journal.recent()
    }

    /// Children launched so far
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::Relaxed)
    }

    pub async fn pid(&self) -> Option<u32> {
        let mut state = self.state.lock().await;
        if child_alive(&mut state) {
            state.child.as_ref().and_then(Child::id)
        } else {
            None
        }
    }

    #[instrument(skip(self, target), fields(primary = %target.primary))]
    pub async fn start(self: &Arc<Self>, target: StreamTarget) -> Result<StartStatus> {
        let mut state = self.state.lock().await;
        // The target is recorded even when a child is already running; the
        // next launch picks it up.
        self.journal.set_secrets(target.stream_key.clone());
        state.target = Some(target);
        state.should_run = true;

        let status = if child_alive(&mut state) {
            StartStatus::AlreadyRunning
        } else {
            self.launch(&mut state)?;
            StartStatus::Started
        };

        let monitor_running = state.monitor.as_ref().is_some_and(|m| !m.is_finished());
        if !monitor_running {
            state.monitor = Some(tokio::spawn(Arc::clone(self).monitor()));
        }
        Ok(status)
    }

    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.should_run = false;
        self.terminate(&mut state).await;
    }

    pub async fn status(&self) -> bool {
        let mut state = self.state.lock().await;
        child_alive(&mut state)
    }

    /// Stop the child and the monitor.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.should_run = false;
        if let Some(monitor) = state.monitor.take() {
            monitor.abort();
        }
        self.terminate(&mut state).await;
    }

    async fn monitor(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.monitor_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        debug!("Supervisor monitor started");

        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    /// One watchdog pass.
    pub async fn tick(&self) {
        let mut state = self.state.lock().await;

        if !state.should_run {
            if state.child.is_some() {
                self.terminate(&mut state).await;
            }
            return;
        }

        if !child_alive(&mut state) {
            info!("Stream subsystem not running, launching");
            if let Err(e) = self.launch(&mut state) {
                error!("Failed to launch stream subsystem: {}", e);
            }
            return;
        }

        if let Liveness::Stale(age) = assess(self.heartbeat.age(), self.config.heartbeat_timeout) {
            warn!("Stream subsystem silent for {:?}, killing", age);
            metrics::counter!("supervisor_watchdog_kills").increment(1);
            if let Some(mut child) = state.child.take() {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill stream subsystem: {}", e);
                }
            }
        }
    }

    fn launch(&self, state: &mut SupervisorState) -> Result<()> {
        let target = state
            .target
            .as_ref()
            .ok_or_else(|| eyre!("No stream target set"))?;

        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .env(ENV_PRIMARY, &target.primary)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match &target.backup {
            Some(backup) => command.env(ENV_BACKUP, backup),
            None => command.env_remove(ENV_BACKUP),
        };
        match &target.stream_key {
            Some(key) => command.env(ENV_STREAM_KEY, key),
            None => command.env_remove(ENV_STREAM_KEY),
        };
        if let Some(overlay) = &self.config.overlay_url {
            command.env(ENV_OVERLAY, overlay);
        }

        let mut child = command
            .spawn()
            .map_err(|e| eyre!("Failed to spawn {}: {}", self.config.program.display(), e))?;

        self.heartbeat.beat();
        self.launches.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("supervisor_launches").increment(1);
        info!("Stream subsystem launched (pid {:?})", child.id());

        if let Some(stdout) = child.stdout.take() {
            self.spawn_reader(stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_reader(stderr);
        }
        state.child = Some(child);
        Ok(())
    }

    /// Every line is a heartbeat and goes to the journal.
    fn spawn_reader(&self, stream: impl AsyncRead + Unpin + Send + 'static) {
        let heartbeat = Arc::clone(&self.heartbeat);
        let journal = Arc::clone(&self.journal);
        tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        heartbeat.beat();
                        journal.record(&String::from_utf8_lossy(&buf)).await;
                    }
                    Err(e) => {
                        debug!("Stopped reading child output: {}", e);
                        break;
                    }
                }
            }
        });
    }

    /// SIGTERM, wait for the grace period, then SIGKILL.
    async fn terminate(&self, state: &mut SupervisorState) {
        let Some(mut child) = state.child.take() else {
            return;
        };

        if let Some(pid) = child.id() {
            info!("Stopping stream subsystem (pid {})", pid);
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!("SIGTERM failed: {}", e);
            }
        }

        match tokio::time::timeout(self.config.stop_grace, child.wait()).await {
            Ok(Ok(status)) => info!("Stream subsystem exited: {}", status),
            Ok(Err(e)) => warn!("Failed to wait for stream subsystem: {}", e),
            Err(_) => {
                warn!(
                    "Stream subsystem ignored SIGTERM for {:?}, killing",
                    self.config.stop_grace
                );
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill stream subsystem: {}", e);
                }
            }
        }
    }
}

/// Reaps an exited child and reports whether one is still running.
fn child_alive(state: &mut SupervisorState) -> bool {
    let Some(child) = state.child.as_mut() else {
        return false;
    };
    match child.try_wait() {
        Ok(None) => true,
        Ok(Some(status)) => {
            warn!("Stream subsystem exited: {}", status);
            state.child = None;
            false
        }
        Err(e) => {
            warn!("Failed to poll stream subsystem: {}", e);
            state.child = None;
            false
        }
    }
}
