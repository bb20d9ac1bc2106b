//! WAL manager configuration.

use crate::error::{WalError, WalResult};
use crate::types::{Timestamp, TimeLineId, TransactionId};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How segment files are made durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMethod {
    /// `fsync`: data and metadata.
    Fsync,
    /// `fdatasync`: data only.
    #[default]
    Fdatasync,
    /// Never sync. Flush positions are still tracked; durability is lost.
    Disabled,
}

impl SyncMethod {
    /// Parses the configuration spelling of a sync method.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown names.
    pub fn parse(name: &str) -> WalResult<Self> {
        match name {
            "fsync" => Ok(Self::Fsync),
            "fdatasync" => Ok(Self::Fdatasync),
            "off" | "disabled" => Ok(Self::Disabled),
            other => Err(WalError::config(format!("unknown sync method \"{other}\""))),
        }
    }
}

/// Sizes that fix the on-disk layout of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// WAL page size in bytes.
    pub page_size: u64,
    /// Segment file size in bytes.
    pub segment_size: u64,
    /// Data page size in bytes (size of a full-page image).
    pub data_page_size: u64,
}

impl Geometry {
    /// Pages per segment file.
    #[must_use]
    pub const fn pages_per_segment(&self) -> u64 {
        self.segment_size / self.page_size
    }

    /// Segments per logical log id (the high 32 bits of an LSN).
    #[must_use]
    pub const fn segments_per_log(&self) -> u64 {
        (1u64 << 32) / self.segment_size
    }
}

/// Configuration for a WAL manager.
#[derive(Debug, Clone)]
pub struct Config {
    /// WAL page size (power of two).
    pub wal_page_size: u32,

    /// Segment file size (power of two, multiple of the page size).
    pub segment_size: u32,

    /// Data page size; full-page images are exactly this long.
    pub data_page_size: u32,

    /// Relation segment size in blocks, recorded in the control file.
    pub relseg_size: u32,

    /// Number of pages in the in-memory ring buffer.
    pub wal_buffers: usize,

    /// How segment files are synced.
    pub sync_method: SyncMethod,

    /// Whether the first change to a page after a checkpoint logs a full image.
    pub full_page_writes: bool,

    /// Segments filled since the last redo point that trigger a checkpoint request.
    pub checkpoint_segments: u32,

    /// Minimum number of old segments kept behind the insert point.
    pub keep_segments: u32,

    /// Whether completed segments are handed to an external archiver.
    pub archive_mode: bool,

    /// Collation locale recorded in the control file.
    pub locale: String,

    /// How long standby replay waits on its latch before re-checking signals.
    pub standby_wait_timeout: Duration,

    /// Recovery settings overriding any `recovery.conf` in the data directory.
    pub recovery: Option<RecoveryConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wal_page_size: 8192,
            segment_size: 16 * 1024 * 1024, // 16 MiB
            data_page_size: 8192,
            relseg_size: 131_072,
            wal_buffers: 8,
            sync_method: SyncMethod::default(),
            full_page_writes: true,
            checkpoint_segments: 3,
            keep_segments: 0,
            archive_mode: false,
            locale: "C".to_string(),
            standby_wait_timeout: Duration::from_secs(5),
            recovery: None,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the WAL page size.
    #[must_use]
    pub fn wal_page_size(mut self, size: u32) -> Self {
        self.wal_page_size = size;
        self
    }

    /// Sets the segment size.
    #[must_use]
    pub fn segment_size(mut self, size: u32) -> Self {
        self.segment_size = size;
        self
    }

    /// Sets the data page size.
    #[must_use]
    pub fn data_page_size(mut self, size: u32) -> Self {
        self.data_page_size = size;
        self
    }

    /// Sets the number of ring buffer pages.
    #[must_use]
    pub fn wal_buffers(mut self, pages: usize) -> Self {
        self.wal_buffers = pages;
        self
    }

    /// Sets the sync method.
    #[must_use]
    pub fn sync_method(mut self, method: SyncMethod) -> Self {
        self.sync_method = method;
        self
    }

    /// Sets whether full-page images are written.
    #[must_use]
    pub fn full_page_writes(mut self, value: bool) -> Self {
        self.full_page_writes = value;
        self
    }

    /// Sets the checkpoint request threshold in segments.
    #[must_use]
    pub fn checkpoint_segments(mut self, segments: u32) -> Self {
        self.checkpoint_segments = segments;
        self
    }

    /// Sets the number of segments always kept.
    #[must_use]
    pub fn keep_segments(mut self, segments: u32) -> Self {
        self.keep_segments = segments;
        self
    }

    /// Sets whether archiving is enabled.
    #[must_use]
    pub fn archive_mode(mut self, value: bool) -> Self {
        self.archive_mode = value;
        self
    }

    /// Sets the standby latch wait timeout.
    #[must_use]
    pub fn standby_wait_timeout(mut self, timeout: Duration) -> Self {
        self.standby_wait_timeout = timeout;
        self
    }

    /// Sets explicit recovery settings.
    #[must_use]
    pub fn recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = Some(recovery);
        self
    }

    /// Returns the layout sizes.
    #[must_use]
    pub fn geometry(&self) -> Geometry {
        Geometry {
            page_size: u64::from(self.wal_page_size),
            segment_size: u64::from(self.segment_size),
            data_page_size: u64::from(self.data_page_size),
        }
    }

    /// Checks that the configured sizes describe a usable layout.
    ///
    /// # Errors
    ///
    /// Returns `WalError::Config` describing the first problem found.
    pub fn validate(&self) -> WalResult<()> {
        if !self.wal_page_size.is_power_of_two() || self.wal_page_size < 1024 {
            return Err(WalError::config(format!(
                "WAL page size {} must be a power of two of at least 1024",
                self.wal_page_size
            )));
        }
        if !self.segment_size.is_power_of_two() || self.segment_size < self.wal_page_size * 2 {
            return Err(WalError::config(format!(
                "segment size {} must be a power of two spanning at least two pages",
                self.segment_size
            )));
        }
        if !self.data_page_size.is_power_of_two()
            || self.data_page_size < 512
            || self.data_page_size > u32::from(u16::MAX)
        {
            return Err(WalError::config(format!(
                "data page size {} must be a power of two between 512 and 32768",
                self.data_page_size
            )));
        }
        if self.wal_buffers < 4 {
            return Err(WalError::config(format!(
                "wal_buffers {} is below the minimum of 4 pages",
                self.wal_buffers
            )));
        }
        if self.checkpoint_segments == 0 {
            return Err(WalError::config("checkpoint_segments must be at least 1"));
        }
        if self.locale.len() >= crate::control::LOCALE_NAME_LEN {
            return Err(WalError::config(format!(
                "locale name \"{}\" is too long",
                self.locale
            )));
        }
        Ok(())
    }
}

/// Where point-in-time recovery stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryTarget {
    /// Replay to the end of available log.
    #[default]
    None,
    /// Stop at the commit or abort of this transaction.
    Xid(TransactionId),
    /// Stop at the first commit or abort past this time.
    Time(Timestamp),
}

/// Which timeline archive recovery follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetTimeline {
    /// The timeline of the checkpoint recovery starts from.
    #[default]
    Current,
    /// The newest timeline with a history file.
    Latest,
    /// An explicit timeline.
    Id(TimeLineId),
}

/// Settings for archive recovery and standby mode.
///
/// Normally loaded from `recovery.conf` in the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryConfig {
    /// Keep replaying streamed log until promoted.
    pub standby_mode: bool,
    /// Directory holding archived segment files and history files.
    pub archive_dir: Option<PathBuf>,
    /// Point-in-time target.
    pub target: RecoveryTarget,
    /// Whether the target record itself is replayed.
    pub target_inclusive: bool,
    /// Timeline to recover along.
    pub target_timeline: TargetTimeline,
    /// File whose appearance promotes a standby.
    pub trigger_file: Option<PathBuf>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            standby_mode: false,
            archive_dir: None,
            target: RecoveryTarget::None,
            target_inclusive: true,
            target_timeline: TargetTimeline::Current,
            trigger_file: None,
        }
    }
}

impl RecoveryConfig {
    /// Creates recovery settings with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets standby mode.
    #[must_use]
    pub fn standby_mode(mut self, value: bool) -> Self {
        self.standby_mode = value;
        self
    }

    /// Sets the archive directory.
    #[must_use]
    pub fn archive_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.archive_dir = Some(dir.into());
        self
    }

    /// Sets the recovery target.
    #[must_use]
    pub fn target(mut self, target: RecoveryTarget) -> Self {
        self.target = target;
        self
    }

    /// Sets whether the target record is replayed.
    #[must_use]
    pub fn target_inclusive(mut self, value: bool) -> Self {
        self.target_inclusive = value;
        self
    }

    /// Sets the target timeline.
    #[must_use]
    pub fn target_timeline(mut self, timeline: TargetTimeline) -> Self {
        self.target_timeline = timeline;
        self
    }

    /// Sets the promotion trigger file.
    #[must_use]
    pub fn trigger_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.trigger_file = Some(path.into());
        self
    }

    /// Parses `recovery.conf` text: `key = 'value'` lines, `#` comments.
    ///
    /// `recovery_target_time` is given in microseconds since the Unix epoch.
    ///
    /// # Errors
    ///
    /// Returns an error naming the offending line for unknown keys or
    /// malformed values.
    pub fn parse(text: &str, path: &Path) -> WalResult<Self> {
        let mut config = Self::default();

        for (lineno, raw) in text.lines().enumerate() {
            let line = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            let bad = |what: &str| {
                WalError::invalid_file(path, format!("line {}: {what}", lineno + 1))
            };

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| bad("syntax error, expected key = 'value'"))?;
            let key = key.trim();
            let value = value.trim().trim_matches('\'').trim_matches('"');

            match key {
                "standby_mode" => config.standby_mode = parse_bool(value).ok_or_else(|| bad("standby_mode requires a boolean"))?,
                "archive_dir" | "restore_dir" => config.archive_dir = Some(PathBuf::from(value)),
                "recovery_target_xid" => {
                    let xid = value
                        .parse::<TransactionId>()
                        .map_err(|_| bad("recovery_target_xid is not a valid number"))?;
                    config.target = RecoveryTarget::Xid(xid);
                }
                "recovery_target_time" => {
                    let time = value
                        .parse::<Timestamp>()
                        .map_err(|_| bad("recovery_target_time is not a valid timestamp"))?;
                    config.target = RecoveryTarget::Time(time);
                }
                "recovery_target_inclusive" => {
                    config.target_inclusive = parse_bool(value)
                        .ok_or_else(|| bad("recovery_target_inclusive requires a boolean"))?;
                }
                "recovery_target_timeline" => {
                    config.target_timeline = if value == "latest" {
                        TargetTimeline::Latest
                    } else {
                        let tli = value
                            .parse::<TimeLineId>()
                            .ok()
                            .filter(|t| *t > 0)
                            .ok_or_else(|| bad("recovery_target_timeline is not a valid number"))?;
                        TargetTimeline::Id(tli)
                    };
                }
                "trigger_file" => config.trigger_file = Some(PathBuf::from(value)),
                other => return Err(bad(&format!("unrecognized recovery parameter \"{other}\""))),
            }
        }

        Ok(config)
    }

    /// Loads `recovery.conf` from `path` if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> WalResult<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text, path).map(Some)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Some(true),
        "off" | "false" | "no" | "0" => Some(false),
        _ => None,
    }
}
