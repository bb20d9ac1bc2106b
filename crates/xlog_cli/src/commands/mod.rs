//! CLI command implementations.

pub mod checkpoint;
pub mod controldata;
pub mod dump_wal;
pub mod init;
pub mod timelines;
pub mod verify;

use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use xlog_core::control::ControlFileData;
use xlog_core::dir::DataDir;
use xlog_core::timeline::read_history;
use xlog_core::wal::SegmentFileSource;
use xlog_core::{Config, ControlFileStore, Geometry, TimeLineId, WalReader};
use xlog_storage::FileOpener;

/// A data directory opened read-only, without taking its lock.
pub struct Cluster {
    /// Directory layout.
    pub dir: DataDir,
    /// Control file contents.
    pub control: ControlFileData,
}

impl Cluster {
    /// Opens the data directory at `path` and reads its control file.
    pub fn open(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let dir = DataDir::open_unlocked(path)?;
        let control = ControlFileStore::read(&dir.control_path())?;
        debug!(
            state = ?control.state,
            checkpoint = %control.checkpoint,
            "read control file"
        );
        Ok(Self { dir, control })
    }

    /// Layout recorded in the control file.
    pub fn geometry(&self) -> Geometry {
        let compat = &self.control.compat;
        Geometry {
            page_size: u64::from(compat.wal_page_size),
            segment_size: u64::from(compat.segment_size),
            data_page_size: u64::from(compat.data_page_size),
        }
    }

    /// A configuration that matches the control file.
    pub fn config(&self) -> Config {
        let compat = &self.control.compat;
        let mut config = Config::new()
            .wal_page_size(compat.wal_page_size)
            .segment_size(compat.segment_size)
            .data_page_size(compat.data_page_size);
        config.relseg_size = compat.relseg_size;
        config.locale = compat.lc_collate.clone();
        config
    }

    /// A reader over `pg_xlog` following `tli`, or the timeline of the
    /// latest checkpoint.
    pub fn reader(
        &self,
        tli: Option<TimeLineId>,
    ) -> Result<WalReader<SegmentFileSource>, Box<dyn std::error::Error>> {
        let geometry = self.geometry();
        let tli = tli.unwrap_or(self.control.checkpoint_copy.this_timeline);
        let dirs = vec![self.dir.xlog_dir()];
        let history = read_history(&dirs, tli, &geometry)?;
        let source = SegmentFileSource::new(dirs, Arc::new(FileOpener), geometry, history.clone());
        Ok(WalReader::new(source, geometry)
            .with_system_id(self.control.system_identifier)
            .with_history(history))
    }
}
