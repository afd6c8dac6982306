// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Daemon settings: built-in defaults, optionally overridden by a TOML
//! config file, overridden again by command-line flags.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::DEFAULT_MAX_HOSTS;
use crate::timeouts::DEFAULT_IO_TIMEOUT_SECONDS;
use crate::watchdog::WatchdogSettings;

/// Everything the daemon needs to run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Runtime directory holding the control socket and lockfile.
    pub run_dir: PathBuf,
    /// Directory of per-lockspace watchdog files (under wdmd control).
    pub watchdog_dir: PathBuf,
    /// Connect lockspaces to the watchdog multiplexer.
    pub use_watchdog: bool,
    /// Default per-lockspace io_timeout in seconds.
    pub io_timeout: u32,
    /// Open lease disks with O_DIRECT.
    pub direct_io: bool,
    /// How many leading slots the opportunistic host-status pass reads.
    pub status_slots: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from("/var/run/lodestone"),
            watchdog_dir: PathBuf::from("/var/run/lodestone/watchdog"),
            use_watchdog: true,
            io_timeout: DEFAULT_IO_TIMEOUT_SECONDS,
            direct_io: true,
            status_slots: DEFAULT_MAX_HOSTS,
        }
    }
}

impl DaemonConfig {
    /// Loads the config file if given, otherwise the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, String> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .map_err(|err| format!("read {}: {err}", path.display()))?;
        toml::from_str(&text).map_err(|err| format!("parse {}: {err}", path.display()))
    }

    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        self.run_dir.join("lodestone.sock")
    }

    #[must_use]
    pub fn lockfile_path(&self) -> PathBuf {
        self.run_dir.join("lodestone.pid")
    }

    #[must_use]
    pub fn watchdog_settings(&self) -> WatchdogSettings {
        if self.use_watchdog {
            WatchdogSettings::in_dir(&self.watchdog_dir)
        } else {
            WatchdogSettings::disabled()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = DaemonConfig::default();
        assert!(config.use_watchdog);
        assert!(config.direct_io);
        assert_eq!(config.io_timeout, DEFAULT_IO_TIMEOUT_SECONDS);
        assert_eq!(
            config.socket_path(),
            PathBuf::from("/var/run/lodestone/lodestone.sock")
        );
    }

    #[test]
    fn load_partial_file() {
        let path = std::env::temp_dir().join(format!(
            "lodestone-config-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "io_timeout = 5\nuse_watchdog = false\n").unwrap();
        let config = DaemonConfig::load(Some(&path)).unwrap();
        assert_eq!(config.io_timeout, 5);
        assert!(!config.use_watchdog);
        // untouched fields keep their defaults
        assert!(config.direct_io);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn load_missing_file_errors() {
        assert!(DaemonConfig::load(Some(Path::new("/nonexistent/l.toml"))).is_err());
    }
}
