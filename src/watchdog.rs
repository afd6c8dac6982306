// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Coupling to the hardware-watchdog multiplexer daemon.
//!
//! The multiplexer pets the hardware watchdog as long as every connected
//! lockspace keeps its per-space file present and fresh. Removing the file
//! withdraws our vote: if a lockspace can no longer renew its delta lease,
//! its file goes away and the machine is reset before any peer may steal
//! the leases this host holds.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::HostId;

/// Where and whether watchdog files are kept.
#[derive(Clone, Debug)]
pub struct WatchdogSettings {
    pub enabled: bool,
    pub dir: PathBuf,
}

impl WatchdogSettings {
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::new(),
        }
    }

    #[must_use]
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            dir: dir.into(),
        }
    }
}

/// The per-lockspace liveness file consumed by the watchdog multiplexer.
#[derive(Debug)]
pub struct WatchdogFile {
    path: Option<PathBuf>,
}

impl WatchdogFile {
    /// Creates the file for a lockspace, making this host's reset depend on
    /// the lockspace's continued renewal.
    pub fn connect(
        settings: &WatchdogSettings,
        space_name: &str,
        host_id: HostId,
        renewal: u64,
    ) -> std::io::Result<Self> {
        if !settings.enabled {
            return Ok(Self { path: None });
        }
        fs::create_dir_all(&settings.dir)?;
        let path = settings.dir.join(format!("{space_name}_hostid{host_id}"));
        write_state(&path, renewal)?;
        info!("watchdog connect {}", path.display());
        Ok(Self { path: Some(path) })
    }

    /// Refreshes the file after a successful renewal.
    pub fn refresh(&self, renewal: u64) {
        let Some(path) = &self.path else { return };
        if let Err(err) = write_state(path, renewal) {
            warn!("watchdog refresh {} failed: {err}", path.display());
        }
    }

    /// Removes the file. The multiplexer stops petting the hardware
    /// watchdog for us and a reset follows within the watchdog period.
    pub fn remove(&self) {
        let Some(path) = &self.path else { return };
        match fs::remove_file(path) {
            Ok(()) => info!("watchdog remove {}", path.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("watchdog remove {} failed: {err}", path.display()),
        }
    }
}

fn write_state(path: &Path, renewal: u64) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    writeln!(file, "renewal {renewal}")?;
    writeln!(file, "pid {}", std::process::id())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_settings(tag: &str) -> WatchdogSettings {
        WatchdogSettings::in_dir(std::env::temp_dir().join(format!(
            "lodestone-wd-{tag}-{}",
            std::process::id()
        )))
    }

    #[test]
    fn connect_refresh_remove() {
        let settings = temp_settings("cycle");
        let file = WatchdogFile::connect(&settings, "spc", 1, 100).unwrap();
        let path = settings.dir.join("spc_hostid1");
        assert!(path.exists());

        file.refresh(101);
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("renewal 101"));

        file.remove();
        assert!(!path.exists());
        fs::remove_dir_all(&settings.dir).unwrap();
    }

    #[test]
    fn disabled_is_inert() {
        let file =
            WatchdogFile::connect(&WatchdogSettings::disabled(), "spc", 1, 0).unwrap();
        file.refresh(1);
        file.remove();
    }

    #[test]
    fn remove_is_idempotent() {
        let settings = temp_settings("idem");
        let file = WatchdogFile::connect(&settings, "spc", 2, 0).unwrap();
        file.remove();
        file.remove();
        fs::remove_dir_all(&settings.dir).unwrap();
    }
}
