//! A persisted queue driven by three concurrent workers — downloader,
//! encoder, uploader — for source files that live on slow remote storage.
//!
//! "Remote" is abstracted behind [`RemoteStore`] so the pipeline is testable
//! without a real network mount; [`LocalFsStore`] treats another path on the
//! local filesystem as the remote, which is also the common case for a slow
//! network share mounted read/write.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::copier;
use crate::encoder::{self, EncodeFlags, EncodeResult};
use crate::error::{EngineError, Result};
use crate::media_info;
use crate::quality_policy::TargetCodec;
use crate::shutdown::ShutdownCoordinator;

pub const DEFAULT_BUFFER_SIZE: usize = 4;
pub const MIN_BUFFER_SIZE: usize = 2;
pub const MAX_BUFFER_SIZE: usize = 5;
pub const DEFAULT_MAX_TEMP_SIZE_BYTES: u64 = 50 * 1024 * 1024 * 1024;

const QUEUE_SCHEMA_VERSION: u32 = 1;
const WORKER_IDLE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueEntryState {
    Pending,
    Downloading,
    Local,
    Encoding,
    Encoded,
    Uploading,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub remote_source_path: PathBuf,
    pub final_remote_path: PathBuf,
    pub local_input_path: Option<PathBuf>,
    pub local_output_path: Option<PathBuf>,
    pub target_codec: TargetCodec,
    pub crf: f32,
    pub flags: EncodeFlags,
    pub state: QueueEntryState,
    pub error: Option<String>,
    pub local_input_size_bytes: Option<u64>,
}

impl QueueEntry {
    pub fn new(remote_source_path: PathBuf, final_remote_path: PathBuf, target_codec: TargetCodec, crf: f32, flags: EncodeFlags) -> Self {
        Self {
            remote_source_path,
            final_remote_path,
            local_input_path: None,
            local_output_path: None,
            target_codec,
            crf,
            flags,
            state: QueueEntryState::Pending,
            error: None,
            local_input_size_bytes: None,
        }
    }

    fn in_flight(&self) -> bool {
        matches!(
            self.state,
            QueueEntryState::Local | QueueEntryState::Encoding | QueueEntryState::Encoded | QueueEntryState::Uploading
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueFile {
    schema: u32,
    entries: Vec<QueueEntry>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub buffer_size: usize,
    pub max_temp_size_bytes: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_temp_size_bytes: DEFAULT_MAX_TEMP_SIZE_BYTES,
        }
    }
}

impl PipelineConfig {
    /// Clamps `buffer_size` into the valid `2..=5` range, so an out-of-range
    /// CLI flag degrades to the nearest bound instead of producing undefined
    /// concurrency behavior.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE);
        self
    }
}

/// Abstracts the remote side of a transfer so the pipeline can be exercised
/// against a plain directory in tests.
pub trait RemoteStore: Send + Sync {
    fn download(&self, remote: &Path, local: &Path) -> Result<()>;
    fn upload(&self, local: &Path, remote: &Path) -> Result<()>;
    fn delete_remote(&self, remote: &Path) -> Result<()>;
}

/// Treats another filesystem path as "remote" — the common case when the
/// slow storage is an NFS/SMB mount rather than a bespoke protocol.
pub struct LocalFsStore;

impl RemoteStore for LocalFsStore {
    fn download(&self, remote: &Path, local: &Path) -> Result<()> {
        copier::copy_preserving_metadata(remote, local)?;
        Ok(())
    }

    fn upload(&self, local: &Path, remote: &Path) -> Result<()> {
        copier::copy_preserving_metadata(local, remote)?;
        Ok(())
    }

    fn delete_remote(&self, remote: &Path) -> Result<()> {
        std::fs::remove_file(remote)?;
        Ok(())
    }
}

struct SharedState {
    entries: Vec<QueueEntry>,
    queue_path: PathBuf,
}

impl SharedState {
    /// Write-to-temp-then-rename so a reader never observes a half-written
    /// file.
    fn persist(&self) -> Result<()> {
        let file = QueueFile {
            schema: QUEUE_SCHEMA_VERSION,
            entries: self.entries.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;
        let tmp_path = self.queue_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &bytes).map_err(|e| EngineError::QueueIo { reason: e.to_string() })?;
        std::fs::rename(&tmp_path, &self.queue_path).map_err(|e| EngineError::QueueIo { reason: e.to_string() })?;
        Ok(())
    }

    /// Persists and logs rather than propagating: a transient `QueueIO`
    /// failure here falls back to the last good state file on disk rather
    /// than aborting an in-flight worker; the surviving on-disk copy is
    /// still enough to resume from on restart.
    fn persist_logged(&self) {
        if let Err(e) = self.persist() {
            warn!(path = %self.queue_path.display(), error = %e, "failed to persist queue state, continuing with last good on-disk copy");
        }
    }

    fn in_flight_count(&self) -> usize {
        self.entries.iter().filter(|e| e.in_flight()).count()
    }

    fn staged_bytes(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| matches!(e.state, QueueEntryState::Local | QueueEntryState::Encoding | QueueEntryState::Encoded))
            .filter_map(|e| e.local_input_size_bytes)
            .sum()
    }
}

pub struct PipelineController {
    state: Arc<Mutex<SharedState>>,
    temp_dir: PathBuf,
    config: PipelineConfig,
    shutdown: ShutdownCoordinator,
    store: Arc<dyn RemoteStore>,
}

impl PipelineController {
    pub fn new(queue_path: PathBuf, temp_dir: PathBuf, config: PipelineConfig, shutdown: ShutdownCoordinator, store: Arc<dyn RemoteStore>) -> Result<Self> {
        std::fs::create_dir_all(&temp_dir)?;
        let entries = load_queue_entries(&queue_path)?;
        Ok(Self {
            state: Arc::new(Mutex::new(SharedState { entries, queue_path })),
            temp_dir,
            config,
            shutdown,
            store,
        })
    }

    /// Adds `entry`, replacing any existing entry for the same source path,
    /// so at most one entry ever exists per source path.
    pub fn enqueue(&self, entry: QueueEntry) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.entries.retain(|e| e.remote_source_path != entry.remote_source_path);
        state.entries.push(entry);
        state.persist()
    }

    pub fn entries(&self) -> Vec<QueueEntry> {
        self.state.lock().unwrap().entries.clone()
    }

    /// Applies the startup resume rules to every entry before workers start.
    pub fn resume(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for entry in state.entries.iter_mut() {
            match entry.state {
                QueueEntryState::Complete | QueueEntryState::Failed => {}
                QueueEntryState::Uploading => {
                    if entry.local_output_path.as_deref().map(|p| p.exists()).unwrap_or(false) {
                        entry.state = QueueEntryState::Uploading;
                    } else {
                        entry.state = QueueEntryState::Pending;
                        entry.local_input_path = None;
                        entry.local_output_path = None;
                    }
                }
                QueueEntryState::Encoded => {
                    if entry.local_output_path.as_deref().map(|p| p.exists()).unwrap_or(false) {
                        entry.state = QueueEntryState::Encoded;
                    } else if entry.local_input_path.as_deref().map(|p| p.exists()).unwrap_or(false) {
                        entry.state = QueueEntryState::Encoding;
                    } else {
                        entry.state = QueueEntryState::Pending;
                    }
                }
                QueueEntryState::Encoding => {
                    if entry.local_input_path.as_deref().map(|p| p.exists()).unwrap_or(false) {
                        entry.state = QueueEntryState::Local;
                    } else {
                        entry.state = QueueEntryState::Pending;
                    }
                }
                QueueEntryState::Local => {
                    if !entry.local_input_path.as_deref().map(|p| p.exists()).unwrap_or(false) {
                        entry.state = QueueEntryState::Pending;
                    }
                }
                QueueEntryState::Downloading => {
                    if let Some(partial) = &entry.local_input_path {
                        let _ = std::fs::remove_file(partial);
                    }
                    entry.local_input_path = None;
                    entry.state = QueueEntryState::Pending;
                }
                QueueEntryState::Pending => {}
            }
        }
        state.persist()
    }

    fn staging_paths(&self, remote: &Path) -> (PathBuf, PathBuf) {
        let basename = remote.file_name().and_then(|n| n.to_str()).unwrap_or("input");
        let stem = remote.file_stem().and_then(|n| n.to_str()).unwrap_or("output");
        (
            self.temp_dir.join(format!("download_{basename}")),
            self.temp_dir.join(format!("encoded_{stem}.mp4")),
        )
    }

    fn run_downloader(&self) {
        loop {
            if self.shutdown.is_stopped() {
                return;
            }
            let mut state = self.state.lock().unwrap();
            let in_flight = state.in_flight_count();
            let staged = state.staged_bytes();
            if in_flight >= self.config.buffer_size || staged >= self.config.max_temp_size_bytes {
                drop(state);
                thread::sleep(WORKER_IDLE_POLL);
                continue;
            }
            let index = state.entries.iter().position(|e| e.state == QueueEntryState::Pending);
            let Some(index) = index else {
                return;
            };
            let (local_input, local_output) = self.staging_paths(&state.entries[index].remote_source_path);
            state.entries[index].state = QueueEntryState::Downloading;
            state.entries[index].local_input_path = Some(local_input.clone());
            state.entries[index].local_output_path = Some(local_output);
            let remote = state.entries[index].remote_source_path.clone();
            state.persist_logged();
            drop(state);

            let result = self.store.download(&remote, &local_input);
            let mut state = self.state.lock().unwrap();
            match result {
                Ok(()) => {
                    let size = std::fs::metadata(&local_input).map(|m| m.len()).ok();
                    state.entries[index].local_input_size_bytes = size;
                    state.entries[index].state = QueueEntryState::Local;
                    info!(remote = %remote.display(), "download complete");
                }
                Err(e) => {
                    error!(remote = %remote.display(), error = %e, "download failed");
                    state.entries[index].state = QueueEntryState::Failed;
                    state.entries[index].error = Some(e.to_string());
                }
            }
            state.persist_logged();
        }
    }

    fn run_encoder(&self) {
        loop {
            if self.shutdown.is_stopped() {
                return;
            }
            let mut state = self.state.lock().unwrap();
            let index = state.entries.iter().position(|e| e.state == QueueEntryState::Local);
            let Some(index) = index else {
                drop(state);
                if self.all_reachable_terminal() {
                    return;
                }
                thread::sleep(WORKER_IDLE_POLL);
                continue;
            };
            state.entries[index].state = QueueEntryState::Encoding;
            let entry = state.entries[index].clone();
            state.persist_logged();
            drop(state);

            let local_input = entry.local_input_path.clone().expect("Local state implies a staged input");
            let local_output = entry.local_output_path.clone().expect("staging paths were set at enqueue/download time");

            let source_info = match media_info::probe(&local_input) {
                Ok(info) => info,
                Err(e) => {
                    self.fail_and_cleanup(index, &e.to_string(), &local_input, None);
                    continue;
                }
            };

            let result = encoder::encode(&local_input, &local_output, entry.target_codec, entry.crf, &source_info, entry.flags, None);
            match result {
                EncodeResult::Completed(_) => {
                    let mut state = self.state.lock().unwrap();
                    state.entries[index].state = QueueEntryState::Encoded;
                    state.persist_logged();
                }
                EncodeResult::Failed(e) => {
                    self.fail_and_cleanup(index, &e.to_string(), &local_input, Some(&local_output));
                }
            }
        }
    }

    fn fail_and_cleanup(&self, index: usize, reason: &str, local_input: &Path, local_output: Option<&Path>) {
        let _ = std::fs::remove_file(local_input);
        if let Some(output) = local_output {
            let _ = std::fs::remove_file(output);
        }
        let mut state = self.state.lock().unwrap();
        state.entries[index].state = QueueEntryState::Failed;
        state.entries[index].error = Some(reason.to_string());
        state.persist_logged();
    }

    fn run_uploader(&self) {
        loop {
            if self.shutdown.is_stopped() {
                return;
            }
            let mut state = self.state.lock().unwrap();
            let index = state.entries.iter().position(|e| e.state == QueueEntryState::Encoded);
            let Some(index) = index else {
                drop(state);
                if self.all_reachable_terminal() {
                    return;
                }
                thread::sleep(WORKER_IDLE_POLL);
                continue;
            };
            state.entries[index].state = QueueEntryState::Uploading;
            let entry = state.entries[index].clone();
            state.persist_logged();
            drop(state);

            let local_output = entry.local_output_path.clone().expect("Encoded state implies a local output");
            let upload_result = self.store.upload(&local_output, &entry.final_remote_path);
            let mut state = self.state.lock().unwrap();
            match upload_result {
                Ok(()) => {
                    if entry.flags.replace_original {
                        if let Err(e) = self.store.delete_remote(&entry.remote_source_path) {
                            warn!(path = %entry.remote_source_path.display(), error = %e, "upload succeeded but removing remote original failed");
                        }
                    }
                    if let Some(input) = &entry.local_input_path {
                        let _ = std::fs::remove_file(input);
                    }
                    let _ = std::fs::remove_file(&local_output);
                    state.entries[index].state = QueueEntryState::Complete;
                    info!(remote = %entry.final_remote_path.display(), "upload complete");
                }
                Err(e) => {
                    error!(remote = %entry.final_remote_path.display(), error = %e, "upload failed");
                    state.entries[index].state = QueueEntryState::Failed;
                    state.entries[index].error = Some(e.to_string());
                }
            }
            state.persist_logged();
        }
    }

    fn all_reachable_terminal(&self) -> bool {
        let state = self.state.lock().unwrap();
        state
            .entries
            .iter()
            .all(|e| matches!(e.state, QueueEntryState::Complete | QueueEntryState::Failed))
    }

    /// Spawns the three workers and blocks until every entry reaches a
    /// terminal state or shutdown is requested.
    pub fn run(self: &Arc<Self>) {
        let downloader = {
            let this = Arc::clone(self);
            thread::spawn(move || this.run_downloader())
        };
        let encoder = {
            let this = Arc::clone(self);
            thread::spawn(move || this.run_encoder())
        };
        let uploader = {
            let this = Arc::clone(self);
            thread::spawn(move || this.run_uploader())
        };
        let _ = downloader.join();
        let _ = encoder.join();
        let _ = uploader.join();
    }
}

fn load_queue_entries(queue_path: &Path) -> Result<Vec<QueueEntry>> {
    if !queue_path.exists() {
        return Ok(Vec::new());
    }
    match std::fs::read(queue_path) {
        Ok(bytes) => match serde_json::from_slice::<QueueFile>(&bytes) {
            Ok(file) => Ok(file.entries),
            Err(e) => {
                warn!(path = %queue_path.display(), error = %e, "queue file unreadable, starting from an empty queue");
                Ok(Vec::new())
            }
        },
        Err(e) => Err(EngineError::QueueIo { reason: e.to_string() }),
    }
}
