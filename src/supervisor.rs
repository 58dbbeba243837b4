//! Local process supervisor
//!
//! Starts, stops and reports on the configured service processes, driven
//! by requests from the event bus. Stopping waits for a voluntary exit
//! within the configured timeout before killing the child.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::bus::{Bus, BusRequest, ProcessState, Topic};
use crate::config::{ProcessConfig, SupervisorConfig};
use crate::logger::log;

/// Supervisor over the configured process list
pub struct Supervisor {
    cfg: SupervisorConfig,
    children: Mutex<HashMap<String, Child>>,
}

impl Supervisor {
    pub fn new(cfg: SupervisorConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            children: Mutex::new(HashMap::new()),
        })
    }

    fn find_config(&self, name: &str) -> Option<&ProcessConfig> {
        self.cfg.process_list.iter().find(|p| p.name == name)
    }

    /// Start a configured process. Starting an already-running process is
    /// an error; a process that exited can be started again.
    pub async fn start(&self, name: &str) -> Result<()> {
        let process = self
            .find_config(name)
            .ok_or_else(|| anyhow!("unknown process: {}", name))?;

        let mut children = self.children.lock().await;
        if let Some(child) = children.get_mut(name) {
            if child.try_wait()?.is_none() {
                return Err(anyhow!("process '{}' is already running", name));
            }
            children.remove(name);
        }

        let child = Command::new(&process.path)
            .args(&process.args)
            .kill_on_drop(self.cfg.stop_process_when_exit)
            .spawn()
            .map_err(|e| anyhow!("failed to spawn '{}': {}", name, e))?;

        log::info!(process = name, pid = child.id(), "process started");
        children.insert(name.to_string(), child);
        Ok(())
    }

    /// Stop a running process: wait `stop_process_timeout` for a voluntary
    /// exit, then kill.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let mut children = self.children.lock().await;
        let Some(mut child) = children.remove(name) else {
            return Err(anyhow!("process '{}' is not running", name));
        };

        let timeout = Duration::from_millis(self.cfg.stop_process_timeout);
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => {
                log::info!(process = name, status = ?status.ok(), "process exited");
            }
            Err(_) => {
                log::warn!(process = name, "process did not exit in time, killing");
                child.kill().await?;
            }
        }
        Ok(())
    }

    /// Report the last observed state of a process
    pub async fn status(&self, name: &str) -> ProcessState {
        let mut children = self.children.lock().await;
        match children.get_mut(name) {
            Some(child) => match child.try_wait() {
                Ok(None) => ProcessState::Running { pid: child.id() },
                Ok(Some(status)) => ProcessState::Exited {
                    code: status.code(),
                },
                Err(_) => ProcessState::NotStarted,
            },
            None => ProcessState::NotStarted,
        }
    }

    /// Start every configured process (used when auto-start is enabled)
    pub async fn start_all(&self) {
        for process in &self.cfg.process_list {
            if let Err(e) = self.start(&process.name).await {
                log::error!(process = %process.name, error = %e, "auto-start failed");
            }
        }
    }

    /// Stop every running process
    pub async fn stop_all(&self) {
        let names: Vec<String> = {
            let children = self.children.lock().await;
            children.keys().cloned().collect()
        };
        for name in names {
            if let Err(e) = self.stop(&name).await {
                log::warn!(process = %name, error = %e, "stop failed");
            }
        }
    }

    /// Serve process requests from the bus until cancelled
    pub fn serve_bus(self: &Arc<Self>, bus: &Bus, cancel: CancellationToken) {
        let mut rx = bus.subscribe(Topic::Process);
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    request = rx.recv() => request,
                    _ = cancel.cancelled() => break,
                };
                let Some(request) = request else { break };
                match request {
                    BusRequest::ProcessStart { name, reply } => {
                        let result = supervisor.start(&name).await.map_err(|e| e.to_string());
                        let _ = reply.send(result);
                    }
                    BusRequest::ProcessStop { name, reply } => {
                        let result = supervisor.stop(&name).await.map_err(|e| e.to_string());
                        let _ = reply.send(result);
                    }
                    BusRequest::ProcessStatus { name, reply } => {
                        let _ = reply.send(supervisor.status(&name).await);
                    }
                    // Other request kinds are not for this handler
                    _ => {}
                }
            }
        });
    }
}
