//! The log manager facade.

use crate::backup::{BackupCoordinator, BackupMethod, BackupStart, BackupStop};
use crate::checkpoint::{CheckpointHooks, CheckpointManager, CheckpointOutcome, DefaultHooks, NextIds};
use crate::config::Config;
use crate::control::{Compatibility, ControlFileData, ControlFileStore, DbState};
use crate::dir::DataDir;
use crate::error::{WalError, WalResult};
use crate::records::{
    encode_next_oid, XactRecord, RM_XACT_ID, RM_XLOG_ID, XACT_ABORT, XACT_COMMIT, XLOG_NEXTOID,
    XLOG_SWITCH,
};
use crate::recovery::{RecoverySignals, ReplicationStream, Startup, StartupReport};
use crate::rmgr::{ChangeTracker, NullPageStore, PageStore, RmgrRegistry};
use crate::types::{Lsn, Oid, TimeLineId, Timestamp, TransactionId};
use crate::wal::{Inserted, Inserter, RecordRequest, SegmentDir, SharedLogState, WalWriter};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;
use xlog_storage::{FileOpener, SegmentOpener};

/// Everything outside the log that the manager calls into.
#[derive(Clone)]
pub struct Collaborators {
    /// Replay handlers.
    pub rmgrs: RmgrRegistry,
    /// Receives full-page images during replay.
    pub page_store: Arc<dyn PageStore>,
    /// Flushes state at checkpoints and supplies id counters.
    pub hooks: Arc<dyn CheckpointHooks>,
    /// Secondary change log fed with every inserted record.
    pub change_tracker: Option<Arc<dyn ChangeTracker>>,
    /// Opens segment files.
    pub opener: Arc<dyn SegmentOpener>,
    /// Replication stream for standby mode.
    pub replication: Option<Arc<dyn ReplicationStream>>,
    /// Promotion and shutdown requests for standby mode.
    pub signals: Arc<RecoverySignals>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            rmgrs: RmgrRegistry::new(),
            page_store: Arc::new(NullPageStore),
            hooks: Arc::new(DefaultHooks),
            change_tracker: None,
            opener: Arc::new(FileOpener),
            replication: None,
            signals: Arc::new(RecoverySignals::new()),
        }
    }
}

impl Collaborators {
    /// Creates collaborators that do nothing beyond the log itself.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the replay handlers.
    #[must_use]
    pub fn rmgrs(mut self, rmgrs: RmgrRegistry) -> Self {
        self.rmgrs = rmgrs;
        self
    }

    /// Sets the page store.
    #[must_use]
    pub fn page_store(mut self, store: Arc<dyn PageStore>) -> Self {
        self.page_store = store;
        self
    }

    /// Sets the checkpoint hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: Arc<dyn CheckpointHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Sets the change tracker.
    #[must_use]
    pub fn change_tracker(mut self, tracker: Arc<dyn ChangeTracker>) -> Self {
        self.change_tracker = Some(tracker);
        self
    }

    /// Sets the segment opener.
    #[must_use]
    pub fn opener(mut self, opener: Arc<dyn SegmentOpener>) -> Self {
        self.opener = opener;
        self
    }

    /// Sets the replication stream.
    #[must_use]
    pub fn replication(mut self, stream: Arc<dyn ReplicationStream>) -> Self {
        self.replication = Some(stream);
        self
    }

    /// Sets the recovery signals.
    #[must_use]
    pub fn signals(mut self, signals: Arc<RecoverySignals>) -> Self {
        self.signals = signals;
        self
    }
}

/// Insert, write and flush positions at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LogPositions {
    /// End of the last inserted record.
    pub insert: Lsn,
    /// Everything below has been handed to the OS.
    pub write: Lsn,
    /// Everything below is durable.
    pub flush: Lsn,
}

/// An open write-ahead log.
///
/// Opening runs startup: the control file is checked, recovery replays
/// whatever the last run left behind, and the log is positioned for new
/// records. All methods take `&self`; the manager may be shared between
/// threads.
///
/// ```rust,ignore
/// use xlog_core::{Config, WalManager, Collaborators, RecordRequest};
///
/// WalManager::bootstrap(path, &Config::default())?;
/// let wal = WalManager::open(path, Config::default(), Collaborators::new())?;
/// let end = wal.insert(&RecordRequest::new(16, 0).xid(100).data(b"row"))?;
/// wal.flush_through(end)?;
/// wal.shutdown()?;
/// ```
pub struct WalManager {
    dir: DataDir,
    shared: Arc<SharedLogState>,
    inserter: Inserter,
    writer: WalWriter,
    checkpointer: Arc<CheckpointManager>,
    backups: BackupCoordinator,
    report: StartupReport,
}

impl WalManager {
    /// Initializes a new data directory: control file, first segment and
    /// a shutdown checkpoint. Returns the new system identifier.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the directory already holds a control
    /// file, `Config` for bad settings, and I/O errors.
    pub fn bootstrap(path: &Path, config: &Config) -> WalResult<u64> {
        config.validate()?;
        let dir = DataDir::open(path, true)?;
        if !dir.is_new() {
            return Err(WalError::invalid_state(format!(
                "data directory {} is already initialized",
                path.display()
            )));
        }
        dir.create_layout()?;

        let system_id = generate_system_identifier();
        let data = ControlFileData::new(system_id, Compatibility::for_config(config));
        let control = Arc::new(ControlFileStore::create(&dir.control_path(), data)?);
        let segments = SegmentDir::new(dir.xlog_dir(), Arc::new(FileOpener), config);
        let shared = Arc::new(SharedLogState::new(config, system_id, 1, segments, control));
        let writer = WalWriter::new(Arc::clone(&shared));
        let inserter = Inserter::new(Arc::clone(&shared), writer.clone(), None);

        // The log starts at segment 1; segment 0 is never used.
        let start = Lsn::new(shared.geometry().segment_size);
        inserter.reset_position(start, Lsn::INVALID, Lsn::INVALID, None)?;
        shared.set_in_recovery(false);

        let checkpointer = CheckpointManager::new(
            Arc::clone(&shared),
            inserter,
            writer.clone(),
            Arc::new(DefaultHooks),
            RmgrRegistry::new(),
        );
        let outcome = checkpointer.checkpoint(true, true)?;
        writer.close_segment()?;
        info!(
            system_identifier = system_id,
            checkpoint = %outcome.lsn,
            "bootstrapped write-ahead log"
        );
        Ok(system_id)
    }

    /// Opens an initialized data directory, running recovery as needed.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseLocked`, `Incompatible`, `ControlFileCorrupt`, and
    /// any error that stops recovery.
    pub fn open(path: &Path, config: Config, collab: Collaborators) -> WalResult<Self> {
        config.validate()?;
        let dir = DataDir::open(path, false)?;
        let control = Arc::new(ControlFileStore::load(
            &dir.control_path(),
            &Compatibility::for_config(&config),
        )?);
        let ctl = control.snapshot();
        info!(
            state = %ctl.state,
            checkpoint = %ctl.checkpoint,
            "database system was last in this state"
        );
        let segments = SegmentDir::new(dir.xlog_dir(), Arc::clone(&collab.opener), &config);
        let shared = Arc::new(SharedLogState::new(
            &config,
            ctl.system_identifier,
            ctl.checkpoint_copy.this_timeline,
            segments,
            control,
        ));
        let writer = WalWriter::new(Arc::clone(&shared));
        let inserter = Inserter::new(
            Arc::clone(&shared),
            writer.clone(),
            collab.change_tracker.clone(),
        );
        let checkpointer = Arc::new(CheckpointManager::new(
            Arc::clone(&shared),
            inserter.clone(),
            writer.clone(),
            Arc::clone(&collab.hooks),
            collab.rmgrs.clone(),
        ));

        let report = Startup {
            dir: &dir,
            shared: &shared,
            inserter: &inserter,
            checkpointer: &checkpointer,
            collab: &collab,
        }
        .run()?;

        let backups = BackupCoordinator::new(
            Arc::clone(&shared),
            inserter.clone(),
            Arc::clone(&checkpointer),
            dir.backup_label_path(),
        );
        Ok(Self {
            dir,
            shared,
            inserter,
            writer,
            checkpointer,
            backups,
            report,
        })
    }

    /// What startup did.
    #[must_use]
    pub fn startup_report(&self) -> &StartupReport {
        &self.report
    }

    /// Inserts a record; returns its end position.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` for malformed requests and I/O errors.
    pub fn insert(&self, req: &RecordRequest<'_>) -> WalResult<Lsn> {
        self.inserter.insert(req)
    }

    /// Inserts a record; returns its start and end positions.
    ///
    /// # Errors
    ///
    /// As for [`insert`](Self::insert).
    pub fn insert_record(&self, req: &RecordRequest<'_>) -> WalResult<Inserted> {
        self.inserter.insert_record(req)
    }

    /// Logs a transaction commit or abort at `time`; returns its end.
    ///
    /// # Errors
    ///
    /// As for [`insert`](Self::insert).
    pub fn log_xact(&self, xid: TransactionId, commit: bool, time: Timestamp) -> WalResult<Lsn> {
        let body = XactRecord { time }.encode();
        let op = if commit { XACT_COMMIT } else { XACT_ABORT };
        self.insert(&RecordRequest::new(RM_XACT_ID, op).xid(xid).data(&body))
    }

    /// Logs a new object id watermark.
    ///
    /// # Errors
    ///
    /// As for [`insert`](Self::insert).
    pub fn log_next_oid(&self, oid: Oid) -> WalResult<Lsn> {
        let body = encode_next_oid(oid);
        let end = self.insert(&RecordRequest::new(RM_XLOG_ID, XLOG_NEXTOID).data(&body))?;
        self.checkpointer.note_next_oid(oid);
        Ok(end)
    }

    /// Ensures everything below `upto` has been written.
    ///
    /// # Errors
    ///
    /// Returns I/O errors or `FlushShortfall`.
    pub fn write_through(&self, upto: Lsn) -> WalResult<()> {
        self.writer.write_through(upto)
    }

    /// Ensures everything below `upto` is durable.
    ///
    /// # Errors
    ///
    /// Returns I/O errors or `FlushShortfall`.
    pub fn flush_through(&self, upto: Lsn) -> WalResult<()> {
        self.writer.flush_through(upto)
    }

    /// One round of background writing. Returns true if anything was done.
    ///
    /// # Errors
    ///
    /// Returns I/O errors.
    pub fn background_flush(&self) -> WalResult<bool> {
        self.writer.background_flush()
    }

    /// Takes a checkpoint.
    ///
    /// # Errors
    ///
    /// See [`CheckpointManager::checkpoint`].
    pub fn checkpoint(&self, is_shutdown: bool, force: bool) -> WalResult<CheckpointOutcome> {
        self.checkpointer.checkpoint(is_shutdown, force)
    }

    /// Returns true when enough log has been written since the last
    /// checkpoint that another one is due.
    #[must_use]
    pub fn checkpoint_requested(&self) -> bool {
        self.shared.checkpoint_requested()
    }

    /// Takes a checkpoint if one has been requested.
    ///
    /// # Errors
    ///
    /// See [`CheckpointManager::checkpoint`].
    pub fn maybe_checkpoint(&self) -> WalResult<Option<CheckpointOutcome>> {
        if !self.shared.checkpoint_requested() {
            return Ok(None);
        }
        self.checkpointer.checkpoint(false, false).map(Some)
    }

    /// Ends the current segment early. Returns the end of the switch
    /// record, or the current position if it is already at a segment start.
    ///
    /// # Errors
    ///
    /// Returns I/O errors.
    pub fn switch_segment(&self) -> WalResult<Lsn> {
        self.insert(&RecordRequest::new(RM_XLOG_ID, XLOG_SWITCH))
    }

    /// Starts an online backup.
    ///
    /// # Errors
    ///
    /// See [`BackupCoordinator::start_backup`].
    pub fn start_backup(&self, label: &str, method: BackupMethod) -> WalResult<BackupStart> {
        self.backups.start_backup(label, method)
    }

    /// Stops an online backup.
    ///
    /// # Errors
    ///
    /// See [`BackupCoordinator::stop_backup`].
    pub fn stop_backup(&self, method: BackupMethod, label_text: Option<&str>) -> WalResult<BackupStop> {
        self.backups.stop_backup(method, label_text)
    }

    /// Current insert, write and flush positions.
    #[must_use]
    pub fn positions(&self) -> LogPositions {
        LogPositions {
            insert: self.shared.insert_position(),
            write: self.shared.write_result(),
            flush: self.shared.flush_result(),
        }
    }

    /// Timeline new records are written on.
    #[must_use]
    pub fn timeline(&self) -> TimeLineId {
        self.shared.timeline()
    }

    /// Cluster identity.
    #[must_use]
    pub fn system_identifier(&self) -> u64 {
        self.shared.system_identifier()
    }

    /// Current control file contents.
    #[must_use]
    pub fn control_snapshot(&self) -> ControlFileData {
        self.shared.control().snapshot()
    }

    /// Id counters as of the last checkpoint or replay.
    #[must_use]
    pub fn next_ids(&self) -> NextIds {
        self.checkpointer.next_ids()
    }

    /// Redo pointer of the latest checkpoint.
    #[must_use]
    pub fn redo_pointer(&self) -> Lsn {
        self.shared.redo_pointer()
    }

    /// Returns true while full-page images are forced.
    #[must_use]
    pub fn forcing_page_writes(&self) -> bool {
        self.shared.forcing_page_writes()
    }

    /// The data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        self.dir.path()
    }

    /// Shared state, for components that run alongside the manager.
    #[must_use]
    pub fn shared(&self) -> &Arc<SharedLogState> {
        &self.shared
    }

    /// Shuts down cleanly with a shutdown checkpoint.
    ///
    /// # Errors
    ///
    /// Returns checkpoint or I/O errors; the data directory then needs
    /// crash recovery on next open.
    pub fn shutdown(self) -> WalResult<CheckpointOutcome> {
        info!("shutting down");
        self.shared.ensure_running()?;
        self.shared
            .control()
            .update(self.shared.flush_result(), |c| c.state = DbState::Shutdowning)?;
        let outcome = self.checkpointer.checkpoint(true, true)?;
        self.writer.close_segment()?;
        info!(checkpoint = %outcome.lsn, "database system is shut down");
        Ok(outcome)
    }
}

/// A cluster identifier unique across initializations: seconds in the
/// high half, microseconds and the process id below.
fn generate_system_identifier() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let pid = u64::from(std::process::id());
    (now.as_secs() << 32) | (u64::from(now.subsec_micros()) << 12) | (pid & 0xFFF)
}
