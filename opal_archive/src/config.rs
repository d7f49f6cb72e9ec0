//! Archive configuration.

use std::path::PathBuf;

/// Direction an archive is opened in. An archive is read-only or
/// write-only for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveMode {
    /// Populate a new archive while the process compiles.
    Store,
    /// Revive artifacts from an existing archive.
    Load,
}

/// Configuration for the shared code archive.
///
/// With `archive_path` unset or `mode` unset, initialization is a no-op
/// and the runtime behaves as if the archive feature were absent.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Path of the archive file. Only the final path component is used;
    /// the file is opened relative to the working directory.
    pub archive_path: Option<PathBuf>,

    /// Whether to store into or load from the archive.
    pub mode: Option<ArchiveMode>,

    /// Staging buffer reservation for store mode, in bytes. A store that
    /// would grow past this fails the archive.
    ///
    /// Default: 10MB
    pub reserved_store_size: usize,

    /// Validation mode: loads decode fully and report success in the log,
    /// but the caller is told to compile fresh anyway.
    pub verify: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        ArchiveConfig {
            archive_path: None,
            mode: None,
            reserved_store_size: 10 * 1024 * 1024,
            verify: false,
        }
    }
}

impl ArchiveConfig {
    /// Config for loading `path`.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        ArchiveConfig {
            archive_path: Some(path.into()),
            mode: Some(ArchiveMode::Load),
            ..Default::default()
        }
    }

    /// Config for storing into `path`.
    pub fn store(path: impl Into<PathBuf>) -> Self {
        ArchiveConfig {
            archive_path: Some(path.into()),
            mode: Some(ArchiveMode::Store),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_inactive() {
        let cfg = ArchiveConfig::default();
        assert!(cfg.archive_path.is_none());
        assert!(cfg.mode.is_none());
        assert!(!cfg.verify);
        assert_eq!(cfg.reserved_store_size, 10 * 1024 * 1024);
    }
}
