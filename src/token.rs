// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Tokens: one local holder's stake in one resource lease.
//!
//! A token is created when a client asks to acquire a resource, carries the
//! disk set and everything the paxos engine needs, and is destroyed after
//! release or forced cleanup. Tokens are exclusively owned by their client
//! record; command workers borrow them for the duration of one operation.
//! The module also keeps the process-wide resource table that rejects
//! overlapping acquisitions of one resource, and offers the asynchronous
//! release used when a client dies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::diskio::SyncDisk;
use crate::error::Error;
use crate::lockspace::SpaceRegistry;
use crate::ondisk::{LeaderRecord, PaxosDblock};
use crate::paxos;
use crate::{Generation, HostId, majority_disks};

/// A ballot IO failed after we may already have been chosen; release must
/// explicitly clear ownership.
pub const T_RETRACT_PAXOS: u32 = 0x1;
/// Ballot dblock writes must preserve our SHARED mode block.
pub const T_WRITE_DBLOCK_MBLOCK_SH: u32 = 0x2;
/// read_resource only checks that a lease area exists.
pub const T_CHECK_EXISTS: u32 = 0x4;

/// In-memory handle for one holder of one resource lease.
#[derive(Clone, Debug, Default)]
pub struct Token {
    pub token_id: u64,
    pub space_name: String,
    pub resource_name: String,
    pub disks: Vec<SyncDisk>,
    /// Copied from the lockspace at acquire time.
    pub host_id: HostId,
    pub host_generation: Generation,
    pub sector_size: u32,
    pub align_size: u32,
    pub max_hosts: u64,
    pub io_timeout: u32,
    pub flags: u32,
    /// Shared (non-exclusive) grant.
    pub shared: bool,
    /// Pid of the local holder, for cleanup and the kill path.
    pub pid: i32,
    /// Last observed leader.
    pub leader: LeaderRecord,
    /// Last written ballot block.
    pub dblock: PaxosDblock,
}

impl Token {
    #[must_use]
    pub fn io_timeout_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.io_timeout.max(1)))
    }

    /// Opens the token's disks; a majority must open for the token to be
    /// usable.
    pub fn open_disks(&mut self, direct: bool) -> Result<(), Error> {
        let mut opened = 0;
        for disk in &mut self.disks {
            if disk.open(direct).is_ok() {
                opened += 1;
            }
        }
        if !majority_disks(self.disks.len(), opened) {
            warn!(
                "open_disks {} opened {opened} of {}",
                self.resource_name,
                self.disks.len()
            );
            return Err(Error::Io(format!(
                "cannot open a majority of disks for {}",
                self.resource_name
            )));
        }
        Ok(())
    }

    pub fn close_disks(&mut self) {
        for disk in &mut self.disks {
            disk.close();
        }
    }
}

/// Which token currently stakes a claim on a resource, so a second local
/// acquire of the same resource is rejected before any disk I/O.
#[derive(Default)]
pub struct ResourceTracker {
    held: Mutex<HashMap<(String, String), (u64, i32)>>,
}

impl ResourceTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_resource(&self, token: &Token) -> Result<(), Error> {
        let key = (token.space_name.clone(), token.resource_name.clone());
        let mut held = self.held.lock().expect("resource table poisoned");
        if held.contains_key(&key) {
            debug!(
                "add_resource {}:{} exists",
                token.space_name, token.resource_name
            );
            return Err(Error::Exists);
        }
        held.insert(key, (token.token_id, token.pid));
        Ok(())
    }

    pub fn del_resource(&self, token: &Token) {
        let key = (token.space_name.clone(), token.resource_name.clone());
        self.held.lock().expect("resource table poisoned").remove(&key);
    }

    #[must_use]
    pub fn holder_pid(&self, space_name: &str, resource_name: &str) -> Option<i32> {
        let key = (space_name.to_owned(), resource_name.to_owned());
        self.held
            .lock()
            .expect("resource table poisoned")
            .get(&key)
            .map(|&(_, pid)| pid)
    }
}

/// Acquires the resource lease the token names.
///
/// Exclusive grants hold the committed leader. Shared grants additionally
/// write the SHARED mode block and then free the leader again, leaving the
/// mode block as the durable record of the grant.
pub async fn acquire_token(
    token: &mut Token,
    registry: &SpaceRegistry,
    mut flags: u32,
    acquire_lver: u64,
    new_num_hosts: u64,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    if token.shared {
        flags |= paxos::ACQUIRE_SHARED;
    }
    let (leader, _dblock) =
        paxos::acquire(token, registry, flags, acquire_lver, new_num_hosts, cancel).await?;

    if token.shared {
        paxos::write_shared_mblock(token).await?;
        match paxos::release(token, Some(&leader)).await {
            Ok(_) => {}
            Err(err) => {
                warn!(
                    "acquire_token {} shared leader release {err}",
                    token.resource_name
                );
                // the mode block stands either way; the SHORT_HOLD leader
                // only makes peers retry a little slower
            }
        }
    }

    info!(
        "acquire_token {}:{} lver {} shared {}",
        token.space_name, token.resource_name, token.leader.lver, token.shared
    );
    Ok(())
}

/// Releases the resource lease the token holds.
pub async fn release_token(token: &mut Token) -> Result<(), Error> {
    if token.shared {
        // a shared grant is its mode block; the leader is not ours
        paxos::clear_mblock(token).await?;
        info!(
            "release_token {}:{} shared",
            token.space_name, token.resource_name
        );
        return Ok(());
    }

    if token.flags & T_RETRACT_PAXOS != 0 {
        // We may be the committed owner without knowing it. Withdraw our
        // ballot values so nobody can adopt them, then clear the leader if
        // it does name us. Not being the owner is success here.
        paxos::erase_dblock(token, token.host_id).await?;
        return match paxos::release(token, None).await {
            Ok(_) | Err(Error::ReleaseOwner | Error::ReleaseLver) => Ok(()),
            Err(err) => Err(err),
        };
    }

    paxos::write_released_dblock(token).await?;
    let last = token.leader.clone();
    paxos::release(token, Some(&last)).await?;
    info!(
        "release_token {}:{} lver {}",
        token.space_name, token.resource_name, last.lver
    );
    Ok(())
}

/// Queues a release on a background task, so pid-death cleanup never blocks
/// the orchestrator loop on disk I/O. The token is consumed.
pub fn release_token_async(mut token: Token, tracker: Arc<ResourceTracker>) {
    tokio::spawn(async move {
        if let Err(err) = release_token(&mut token).await {
            warn!(
                "async release {}:{} error {err}",
                token.space_name, token.resource_name
            );
        }
        token.close_disks();
        tracker.del_resource(&token);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named_token(space: &str, resource: &str, pid: i32) -> Token {
        Token {
            token_id: 1,
            space_name: space.into(),
            resource_name: resource.into(),
            pid,
            ..Default::default()
        }
    }

    #[test]
    fn resource_tracker_rejects_overlap() {
        let tracker = ResourceTracker::new();
        let token = named_token("spc", "r1", 100);
        tracker.add_resource(&token).unwrap();
        assert_eq!(tracker.add_resource(&token), Err(Error::Exists));
        assert_eq!(tracker.holder_pid("spc", "r1"), Some(100));

        tracker.del_resource(&token);
        assert_eq!(tracker.holder_pid("spc", "r1"), None);
        tracker.add_resource(&token).unwrap();
    }

    #[test]
    fn resource_tracker_distinguishes_spaces() {
        let tracker = ResourceTracker::new();
        tracker.add_resource(&named_token("a", "r", 1)).unwrap();
        tracker.add_resource(&named_token("b", "r", 2)).unwrap();
        assert_eq!(tracker.holder_pid("a", "r"), Some(1));
        assert_eq!(tracker.holder_pid("b", "r"), Some(2));
    }

    #[test]
    fn open_disks_requires_majority() {
        let mut token = named_token("spc", "r", 1);
        token.disks = vec![
            SyncDisk::new("/nonexistent/a", 0),
            SyncDisk::new("/nonexistent/b", 0),
            SyncDisk::new("/nonexistent/c", 0),
        ];
        assert!(token.open_disks(false).is_err());
    }
}
