// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Delta-lease engine: one sector per host proves liveness in a lockspace.
//!
//! A host owns slot `host_id` of a lockspace by writing its identity and a
//! monotonic timestamp into the sector at `offset + (host_id - 1) * sector`,
//! and keeps the slot by rewriting the timestamp on a strict schedule.
//! Peers decide the host is dead only after `host_dead_seconds` without
//! observing the timestamp advance, by which time the host's watchdog has
//! reset it.
//!
//! The engine performs single operations; scheduling renewals is the
//! lockspace task's job.

use std::time::Duration;

use log::{debug, info, warn};

use crate::diskio::{self, SyncDisk};
use crate::error::Error;
use crate::ondisk::{DELTA_DISK_MAGIC, DELTA_RECORD_SIZE, DISK_VERSION, DISK_VERSION_MAJOR_MASK, DeltaRecord};
use crate::timeouts::{Timeouts, host_dead_seconds_for};
use crate::{HostId, LEASE_FREE, monotime};

fn verify_record(rec: &DeltaRecord, computed: u32, space_name: &str) -> Result<(), Error> {
    if rec.magic != DELTA_DISK_MAGIC {
        return Err(Error::LeaderMagic);
    }
    if rec.version & DISK_VERSION_MAJOR_MASK != DISK_VERSION & DISK_VERSION_MAJOR_MASK {
        return Err(Error::LeaderVersion);
    }
    if rec.space_name != space_name {
        return Err(Error::LeaderLockspace);
    }
    if rec.resource_name != space_name {
        return Err(Error::LeaderResource);
    }
    if rec.checksum != computed {
        warn!("delta verify wrong checksum {:x} {computed:x}", rec.checksum);
        return Err(Error::LeaderChecksum);
    }
    Ok(())
}

async fn read_slot(
    disk: &SyncDisk,
    sector_size: u32,
    io_timeout: Duration,
    space_name: &str,
    host_id: HostId,
) -> Result<DeltaRecord, Error> {
    let buf = diskio::read_sectors(disk, sector_size, host_id - 1, 1, io_timeout).await?;
    let (rec, computed) = DeltaRecord::decode(&buf.as_slice()[..DELTA_RECORD_SIZE]);
    verify_record(&rec, computed, space_name)?;
    Ok(rec)
}

async fn write_slot(
    disk: &SyncDisk,
    sector_size: u32,
    io_timeout: Duration,
    rec: &mut DeltaRecord,
) -> Result<(), Error> {
    let bytes = rec.encode();
    diskio::write_sector(disk, sector_size, rec.owner_id - 1, &bytes, io_timeout).await
}

/// Reads and verifies the delta record of any slot. Used by the paxos
/// engine to probe a resource owner's liveness and by the lockspace task
/// to publish peer status.
pub async fn lease_read(
    disk: &SyncDisk,
    sector_size: u32,
    io_timeout: Duration,
    space_name: &str,
    host_id: HostId,
) -> Result<DeltaRecord, Error> {
    read_slot(disk, sector_size, io_timeout, space_name, host_id).await
}

/// Acquires slot `host_id` for this host, bumping the slot's generation.
///
/// After the initial read the engine waits out the previous owner's dead
/// bound, confirms the slot did not move, writes our identity, then waits
/// two io_timeouts and confirms the write survived. Two hosts racing for
/// one slot both write, and the confirming read disqualifies the loser.
pub async fn lease_acquire(
    disk: &SyncDisk,
    sector_size: u32,
    timeouts: &Timeouts,
    space_name: &str,
    host_id: HostId,
) -> Result<DeltaRecord, Error> {
    let io_timeout = timeouts.io_timeout_duration();
    let prev = read_slot(disk, sector_size, io_timeout, space_name, host_id).await?;

    debug!(
        "delta_acquire {space_name}:{host_id} prev owner {} {} ts {}",
        prev.owner_id, prev.owner_generation, prev.timestamp
    );

    // The previous owner's own io_timeout bounds how long it may go between
    // renewals before its watchdog fires.
    let dead_seconds = if prev.timestamp != LEASE_FREE && prev.io_timeout != 0 {
        host_dead_seconds_for(prev.io_timeout)
    } else {
        timeouts.host_dead_seconds()
    };
    tokio::time::sleep(Duration::from_secs(dead_seconds)).await;

    let check = read_slot(disk, sector_size, io_timeout, space_name, host_id).await?;
    if check.owner_id != prev.owner_id
        || check.owner_generation != prev.owner_generation
        || check.timestamp != prev.timestamp
    {
        warn!(
            "delta_acquire {space_name}:{host_id} slot moved to {} {} ts {}",
            check.owner_id, check.owner_generation, check.timestamp
        );
        return Err(Error::DeltaBusy);
    }

    let mut ours = DeltaRecord {
        magic: DELTA_DISK_MAGIC,
        version: DISK_VERSION,
        io_timeout: timeouts.io_timeout,
        owner_id: host_id,
        owner_generation: prev.owner_generation + 1,
        timestamp: monotime(),
        space_name: space_name.to_owned(),
        resource_name: space_name.to_owned(),
        checksum: 0,
    };
    write_slot(disk, sector_size, io_timeout, &mut ours).await?;

    tokio::time::sleep(Duration::from_secs(u64::from(timeouts.io_timeout) * 2)).await;

    let confirm = read_slot(disk, sector_size, io_timeout, space_name, host_id).await?;
    if confirm != ours {
        warn!(
            "delta_acquire {space_name}:{host_id} lost race to {} {}",
            confirm.owner_id, confirm.owner_generation
        );
        return Err(Error::DeltaBusy);
    }

    info!(
        "delta_acquire {space_name}:{host_id} generation {}",
        ours.owner_generation
    );
    Ok(ours)
}

/// Renews our slot: rewrites the identity we last wrote with a fresh
/// timestamp. With `confirm` the write is read back before success is
/// reported.
pub async fn lease_renew(
    disk: &SyncDisk,
    sector_size: u32,
    timeouts: &Timeouts,
    space_name: &str,
    last: &DeltaRecord,
    confirm: bool,
) -> Result<DeltaRecord, Error> {
    let io_timeout = timeouts.io_timeout_duration();
    let cur = read_slot(disk, sector_size, io_timeout, space_name, last.owner_id).await?;
    if cur.owner_id != last.owner_id
        || cur.owner_generation != last.owner_generation
        || cur.timestamp != last.timestamp
    {
        warn!(
            "delta_renew {space_name}:{} slot carries {} {} ts {}",
            last.owner_id, cur.owner_id, cur.owner_generation, cur.timestamp
        );
        return Err(Error::DeltaStolen);
    }

    let mut next = last.clone();
    next.io_timeout = timeouts.io_timeout;
    next.timestamp = monotime().max(last.timestamp + 1);
    write_slot(disk, sector_size, io_timeout, &mut next).await?;

    if confirm {
        let back = read_slot(disk, sector_size, io_timeout, space_name, last.owner_id).await?;
        if back != next {
            return Err(Error::DeltaStolen);
        }
    }
    Ok(next)
}

/// Releases our slot: writes `timestamp = FREE` retaining our identity, so
/// the next acquirer continues our generation sequence.
pub async fn lease_release(
    disk: &SyncDisk,
    sector_size: u32,
    timeouts: &Timeouts,
    space_name: &str,
    last: &DeltaRecord,
) -> Result<DeltaRecord, Error> {
    let mut freed = last.clone();
    freed.timestamp = LEASE_FREE;
    write_slot(disk, sector_size, timeouts.io_timeout_duration(), &mut freed).await?;
    info!("delta_release {space_name}:{}", last.owner_id);
    Ok(freed)
}

/// Formats the delta-lease area of a lockspace: one free slot per host,
/// 1..=max_hosts.
pub async fn lease_init(
    disk: &SyncDisk,
    sector_size: u32,
    io_timeout: Duration,
    space_name: &str,
    max_hosts: u64,
) -> Result<(), Error> {
    let mut buf = diskio::AlignedBuf::zeroed((max_hosts * u64::from(sector_size)) as usize);
    for slot in 0..max_hosts {
        let mut rec = DeltaRecord {
            magic: DELTA_DISK_MAGIC,
            version: DISK_VERSION,
            io_timeout: 0,
            owner_id: 0,
            owner_generation: 0,
            timestamp: LEASE_FREE,
            space_name: space_name.to_owned(),
            resource_name: space_name.to_owned(),
            checksum: 0,
        };
        let bytes = rec.encode();
        let start = (slot * u64::from(sector_size)) as usize;
        buf.as_mut_slice()[start..start + DELTA_RECORD_SIZE].copy_from_slice(&bytes);
    }
    diskio::write_iobuf(disk, disk.offset, buf, io_timeout).await?;
    info!("delta_init {space_name} max_hosts {max_hosts}");
    Ok(())
}
