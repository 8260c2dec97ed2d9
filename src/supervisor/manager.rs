//! Supervision of several named streams

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use super::{HealthProbe, Launcher, WorkerStatus, WorkerSupervisor};
use crate::config::SupervisorConfig;
use crate::{FrameLockError, Result};

/// One [`WorkerSupervisor`] per configured stream.
pub struct StreamManager {
    launcher: Arc<dyn Launcher>,
    config: SupervisorConfig,
    streams: HashMap<String, WorkerSupervisor>,
}

impl StreamManager {
    pub fn new(launcher: Arc<dyn Launcher>, config: SupervisorConfig) -> Self {
        Self { launcher, config, streams: HashMap::new() }
    }

    /// Register a stream; its worker is not started.
    pub fn add(&mut self, stream: &str, probe: Option<Arc<dyn HealthProbe>>) -> Result<()> {
        if self.streams.contains_key(stream) {
            return Err(FrameLockError::invalid_config("stream", format!("'{}' already exists", stream)));
        }
        let supervisor =
            WorkerSupervisor::spawn(stream, Arc::clone(&self.launcher), probe, self.config);
        self.streams.insert(stream.to_string(), supervisor);
        info!(stream, "Stream added");
        Ok(())
    }

    /// Stop the stream's worker and discard its record.
    pub async fn remove(&mut self, stream: &str) -> Result<()> {
        let supervisor = self.streams.remove(stream).ok_or_else(|| unknown(stream))?;
        supervisor.shutdown().await;
        info!(stream, "Stream removed");
        Ok(())
    }

    pub async fn start(&self, stream: &str, binary: impl Into<PathBuf>, args: Vec<String>) -> Result<()> {
        self.get(stream)?.start(binary, args).await
    }

    pub async fn stop(&self, stream: &str) -> Result<()> {
        self.get(stream)?.stop().await
    }

    pub fn status(&self, stream: &str) -> Result<WorkerStatus> {
        Ok(self.get(stream)?.status())
    }

    /// Status of every stream, ordered by name.
    pub fn statuses(&self) -> Vec<WorkerStatus> {
        let mut statuses: Vec<_> = self.streams.values().map(WorkerSupervisor::status).collect();
        statuses.sort_by(|a, b| a.stream.cmp(&b.stream));
        statuses
    }

    pub fn get(&self, stream: &str) -> Result<&WorkerSupervisor> {
        self.streams.get(stream).ok_or_else(|| unknown(stream))
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Stop every worker and drop all records.
    pub async fn shutdown(&mut self) {
        let streams: Vec<_> = self.streams.drain().collect();
        futures::future::join_all(streams.iter().map(|(_, supervisor)| supervisor.shutdown())).await;
        info!(count = streams.len(), "All streams shut down");
    }
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.streams.keys().collect();
        names.sort();
        f.debug_struct("StreamManager").field("streams", &names).finish()
    }
}

fn unknown(stream: &str) -> FrameLockError {
    FrameLockError::UnknownStream { stream: stream.to_string() }
}
