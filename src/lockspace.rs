// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Lockspace registry and the per-lockspace renewal task.
//!
//! A lockspace is a named region of shared disk with one delta-lease sector
//! per host. Adding a lockspace acquires this host's slot (slow, bounded by
//! the previous owner's dead time), connects the watchdog, and starts a
//! task that renews the slot every `renewal` seconds. A lockspace that
//! cannot renew for `renewal_fail` seconds removes its watchdog file and is
//! drained by the orchestrator: local holders are killed, then the space is
//! torn down.
//!
//! Lock order: the registry lock comes before any space's state lock, and
//! neither is ever held across disk I/O.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::delta;
use crate::diskio::SyncDisk;
use crate::error::Error;
use crate::ondisk::DeltaRecord;
use crate::timeouts::Timeouts;
use crate::watchdog::{WatchdogFile, WatchdogSettings};
use crate::{Generation, HostId, LEASE_FREE, monotime};

/// How many renewal outcomes each space remembers.
const RENEWAL_HISTORY_LEN: usize = 32;

/// One remembered renewal attempt.
#[derive(Clone, Copy, Debug)]
pub struct RenewalOutcome {
    pub timestamp: u64,
    pub ok: bool,
}

/// What this host last observed about a peer's delta lease.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostStatus {
    pub owner_id: HostId,
    pub owner_generation: Generation,
    /// Timestamp in the peer's delta record when last read.
    pub timestamp: u64,
    /// The peer's own io_timeout, for deriving its dead bound.
    pub io_timeout: u32,
    /// Local monotime of our last read of the slot.
    pub last_check: u64,
    /// Local monotime when we last saw the slot advance.
    pub last_live: u64,
}

/// Mutable state of one lockspace, guarded by the space's own lock.
#[derive(Debug, Default)]
pub struct SpaceState {
    pub host_generation: Generation,
    /// The delta record we last wrote; renewal rewrites it.
    pub lease: Option<DeltaRecord>,
    /// Monotime of the last successful renewal.
    pub last_success: u64,
    pub renewal_history: VecDeque<RenewalOutcome>,
    /// Kill escalation counter; nonzero is terminal for the space.
    pub killing_pids: u32,
    pub external_remove: bool,
    pub thread_stop: bool,
    warned: bool,
    /// Per-slot observations of peer delta leases.
    pub host_status: HashMap<HostId, HostStatus>,
}

/// One lockspace this daemon participates in.
pub struct Space {
    pub space_name: String,
    pub host_id: HostId,
    /// Short id used in log messages instead of the full name.
    pub space_id: u64,
    pub disk: SyncDisk,
    pub sector_size: u32,
    pub timeouts: Timeouts,
    /// How many leading slots the opportunistic status pass reads.
    pub status_slots: u64,
    pub state: Mutex<SpaceState>,
    cancel: CancellationToken,
}

impl Space {
    /// `true` while the last successful renewal is younger than the
    /// self-fence bound. The orchestrator starts killing holders when this
    /// turns false.
    pub async fn host_id_renewed(&self) -> bool {
        let state = self.state.lock().await;
        if state.killing_pids != 0 || state.lease.is_none() {
            return false;
        }
        monotime().saturating_sub(state.last_success) < u64::from(self.timeouts.renewal_fail)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Renewal loop: one iteration per `renewal` seconds until cancelled or
    /// the space turns terminal.
    async fn renewal_loop(self: Arc<Self>, watchdog: WatchdogFile) {
        let period = Duration::from_secs(u64::from(self.timeouts.renewal));
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(period) => {}
            }

            let (last, killing) = {
                let state = self.state.lock().await;
                (state.lease.clone(), state.killing_pids != 0)
            };
            if killing {
                // terminal: no further renewals, removal is the only exit
                break;
            }
            let Some(last) = last else { break };

            let renewed = delta::lease_renew(
                &self.disk,
                self.sector_size,
                &self.timeouts,
                &self.space_name,
                &last,
                false,
            )
            .await;

            let now = monotime();
            match renewed {
                Ok(next) => {
                    let mut state = self.state.lock().await;
                    state.lease = Some(next);
                    state.last_success = now;
                    state.warned = false;
                    push_history(&mut state.renewal_history, now, true);
                    drop(state);
                    watchdog.refresh(now);
                    self.update_host_status().await;
                }
                Err(err) => {
                    let mut state = self.state.lock().await;
                    push_history(&mut state.renewal_history, now, false);
                    let age = now.saturating_sub(state.last_success);
                    if age >= u64::from(self.timeouts.renewal_fail) {
                        drop(state);
                        warn!(
                            "s{} renewal error {err} for {age}s, fencing",
                            self.space_id
                        );
                        // stop feeding the watchdog; the orchestrator sees
                        // host_id_renewed() false and starts killing pids
                        watchdog.remove();
                    } else if age >= u64::from(self.timeouts.renewal_warn) && !state.warned {
                        state.warned = true;
                        drop(state);
                        warn!("s{} renewal error {err} for {age}s", self.space_id);
                    } else {
                        drop(state);
                        debug!("s{} renewal error {err}", self.space_id);
                    }
                }
            }
        }
        // fencing already removed the file; on a graceful stop the space is
        // leaving the watchdog's responsibility either way
        watchdog.remove();
        debug!("s{} renewal loop stopped", self.space_id);
    }

    /// Opportunistic pass over the leading slots of the delta area, feeding
    /// the host_status table. Correctness never depends on this; the paxos
    /// engine does its own reads during an acquire.
    async fn update_host_status(&self) {
        let io_timeout = self.timeouts.io_timeout_duration();
        let Ok(buf) = crate::diskio::read_sectors(
            &self.disk,
            self.sector_size,
            0,
            self.status_slots,
            io_timeout,
        )
        .await
        else {
            return;
        };
        let now = monotime();
        let ss = self.sector_size as usize;
        let mut state = self.state.lock().await;
        for slot in 0..self.status_slots {
            let start = slot as usize * ss;
            let (rec, computed) =
                DeltaRecord::decode(&buf.as_slice()[start..start + crate::ondisk::DELTA_RECORD_SIZE]);
            if rec.checksum != computed || rec.owner_id == 0 {
                continue;
            }
            let entry = state.host_status.entry(slot + 1).or_default();
            let advanced = rec.timestamp != entry.timestamp
                || rec.owner_id != entry.owner_id
                || rec.owner_generation != entry.owner_generation;
            if advanced && rec.timestamp != LEASE_FREE {
                entry.last_live = now;
            }
            entry.owner_id = rec.owner_id;
            entry.owner_generation = rec.owner_generation;
            entry.timestamp = rec.timestamp;
            entry.io_timeout = rec.io_timeout;
            entry.last_check = now;
        }
    }
}

/// Summary of a space handed to command workers.
#[derive(Clone, Debug)]
pub struct SpaceInfo {
    pub host_id: HostId,
    pub host_generation: Generation,
    pub killing_pids: bool,
    pub sector_size: u32,
    pub timeouts: Timeouts,
}

/// The process-wide set of lockspaces.
///
/// At most one space with a given name exists at any moment; the registry
/// lock serializes add against remove for the same name.
#[derive(Default)]
pub struct SpaceRegistry {
    spaces: Mutex<Vec<Arc<Space>>>,
    space_id_counter: AtomicU64,
}

impl SpaceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            spaces: Mutex::new(Vec::new()),
            space_id_counter: AtomicU64::new(1),
        }
    }

    /// Joins a lockspace: acquires our delta-lease slot, connects the
    /// watchdog, starts the renewal task, and publishes the space.
    ///
    /// Blocks for up to the previous slot owner's dead time. Returns
    /// [`Error::Exists`] while any space of this name is present, including
    /// one still being torn down.
    pub async fn add_lockspace(
        &self,
        space_name: &str,
        host_id: HostId,
        mut disk: SyncDisk,
        sector_size: u32,
        timeouts: Timeouts,
        status_slots: u64,
        watchdog_settings: &WatchdogSettings,
    ) -> Result<(), Error> {
        if host_id == 0 {
            return Err(Error::Protocol("host_id must be nonzero".into()));
        }
        if !disk.is_open() {
            disk.open(true)?;
        }

        let space_id = self.space_id_counter.fetch_add(1, Ordering::Relaxed);
        let space = Arc::new(Space {
            space_name: space_name.to_owned(),
            host_id,
            space_id,
            disk,
            sector_size,
            timeouts,
            status_slots,
            state: Mutex::new(SpaceState::default()),
            cancel: CancellationToken::new(),
        });

        // publish before the slow acquire so a second add of the same name
        // fails instead of racing us
        {
            let mut spaces = self.spaces.lock().await;
            if spaces.iter().any(|sp| sp.space_name == space_name) {
                return Err(Error::Exists);
            }
            spaces.push(space.clone());
        }
        info!("lockspace {space_name} host_id {host_id} has space_id {space_id}");

        let acquired = delta::lease_acquire(
            &space.disk,
            sector_size,
            &timeouts,
            space_name,
            host_id,
        )
        .await;

        let lease = match acquired {
            Ok(lease) => lease,
            Err(err) => {
                self.remove_from_list(&space).await;
                return Err(err);
            }
        };

        let now = monotime();
        let watchdog =
            match WatchdogFile::connect(watchdog_settings, space_name, host_id, now) {
                Ok(watchdog) => watchdog,
                Err(err) => {
                    warn!("s{space_id} watchdog connect failed: {err}");
                    self.remove_from_list(&space).await;
                    return Err(Error::Io(format!("watchdog connect: {err}")));
                }
            };

        {
            let mut state = space.state.lock().await;
            state.host_generation = lease.owner_generation;
            state.lease = Some(lease);
            state.last_success = now;
        }

        tokio::spawn(space.clone().renewal_loop(watchdog));
        Ok(())
    }

    /// Flags a lockspace for removal. The orchestrator's tick turns the
    /// flag into `killing_pids`, kills holders, and tears the space down;
    /// callers poll [`Self::space_exists`] until it is gone.
    pub async fn rem_lockspace(&self, space_name: &str) -> Result<(), Error> {
        let spaces = self.spaces.lock().await;
        let Some(space) = spaces.iter().find(|sp| sp.space_name == space_name) else {
            return Err(Error::NotFound);
        };
        let mut state = space.state.lock().await;
        if state.lease.is_none() {
            // still acquiring; the add path owns the teardown
            return Err(Error::Busy);
        }
        state.external_remove = true;
        info!("s{} set external_remove", space.space_id);
        Ok(())
    }

    pub async fn space_exists(&self, space_name: &str) -> bool {
        self.spaces
            .lock()
            .await
            .iter()
            .any(|sp| sp.space_name == space_name)
    }

    pub async fn is_empty(&self) -> bool {
        self.spaces.lock().await.is_empty()
    }

    /// Snapshot of the current spaces, for the tick and status paths.
    pub async fn snapshot(&self) -> Vec<Arc<Space>> {
        self.spaces.lock().await.clone()
    }

    pub async fn get_space_info(&self, space_name: &str) -> Option<SpaceInfo> {
        let space = self.find(space_name).await?;
        let state = space.state.lock().await;
        Some(SpaceInfo {
            host_id: space.host_id,
            host_generation: state.host_generation,
            killing_pids: state.killing_pids != 0,
            sector_size: space.sector_size,
            timeouts: space.timeouts,
        })
    }

    /// The lockspace disk used for delta reads of peer slots.
    pub async fn lockspace_disk(&self, space_name: &str) -> Option<(SyncDisk, u32, Timeouts)> {
        let space = self.find(space_name).await?;
        Some((space.disk.clone(), space.sector_size, space.timeouts))
    }

    /// This host's bookkeeping about a peer slot, if any.
    pub async fn host_info(&self, space_name: &str, host_id: HostId) -> Option<HostStatus> {
        let space = self.find(space_name).await?;
        let state = space.state.lock().await;
        state.host_status.get(&host_id).copied()
    }

    async fn find(&self, space_name: &str) -> Option<Arc<Space>> {
        self.spaces
            .lock()
            .await
            .iter()
            .find(|sp| sp.space_name == space_name)
            .cloned()
    }

    async fn remove_from_list(&self, space: &Arc<Space>) {
        let mut spaces = self.spaces.lock().await;
        spaces.retain(|sp| !Arc::ptr_eq(sp, space));
    }

    /// Final teardown of a drained space: stop the renewal task, release
    /// the delta lease if we still can, unpublish the name.
    pub async fn finish_removal(&self, space: &Arc<Space>) {
        space.stop();
        let lease = {
            let mut state = space.state.lock().await;
            state.thread_stop = true;
            state.lease.take()
        };
        if let Some(lease) = lease {
            // best effort: on a fencing teardown the disk is unreachable
            // anyway and the slot expires by time
            if let Err(err) = delta::lease_release(
                &space.disk,
                space.sector_size,
                &space.timeouts,
                &space.space_name,
                &lease,
            )
            .await
            {
                warn!("s{} delta release failed: {err}", space.space_id);
            }
        }
        self.remove_from_list(space).await;
        info!("s{} removed", space.space_id);
    }

    /// Inserts a space that already owns its slot. Test scaffolding for the
    /// engines that consult the registry.
    #[cfg(test)]
    pub(crate) async fn insert_established(
        &self,
        space_name: &str,
        host_id: HostId,
        disk: SyncDisk,
        sector_size: u32,
        timeouts: Timeouts,
        lease: DeltaRecord,
    ) -> Arc<Space> {
        let space = Arc::new(Space {
            space_name: space_name.to_owned(),
            host_id,
            space_id: self.space_id_counter.fetch_add(1, Ordering::Relaxed),
            disk,
            sector_size,
            timeouts,
            status_slots: 4,
            state: Mutex::new(SpaceState {
                host_generation: lease.owner_generation,
                last_success: monotime(),
                lease: Some(lease),
                ..Default::default()
            }),
            cancel: CancellationToken::new(),
        });
        self.spaces.lock().await.push(space.clone());
        space
    }
}

fn push_history(history: &mut VecDeque<RenewalOutcome>, timestamp: u64, ok: bool) {
    if history.len() == RENEWAL_HISTORY_LEN {
        history.pop_front();
    }
    history.push_back(RenewalOutcome { timestamp, ok });
}
