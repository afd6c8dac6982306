// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Disk Paxos resource-lease engine.
//!
//! A resource lease lives in `num_hosts + 2` sectors on each of its disks:
//! sector 0 is the leader record, sector 1 the request record, and sector
//! `2 + host_id - 1` each host's ballot block (dblock). Acquiring runs the
//! two-phase Disk Paxos ballot (Gafni & Lamport) over those sectors, with a
//! majority of disks required for every phase. The committed leader binds
//! the lease to `(owner_id, owner_generation)` at a lease version `lver`
//! that never regresses.
//!
//! Liveness of a competing owner is judged through the delta lease of its
//! lockspace slot, never through messages.

use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::delta;
use crate::diskio::{self, AlignedBuf, SyncDisk};
use crate::error::Error;
use crate::lockspace::SpaceRegistry;
use crate::ondisk::{
    self, DISK_VERSION, DISK_VERSION_MAJOR_MASK, LEADER_RECORD_SIZE, LFL_SHORT_HOLD,
    LeaderRecord, MBLOCK_FL_SHARED, MBLOCK_OFFSET, MODE_BLOCK_SIZE, ModeBlock,
    PAXOS_DBLOCK_SIZE, PAXOS_DISK_CLEAR, PAXOS_DISK_MAGIC, PaxosDblock, REQ_DISK_MAGIC,
    REQUEST_RECORD_SIZE, RequestRecord,
};
use crate::timeouts::host_dead_seconds_for;
use crate::token::{T_CHECK_EXISTS, T_RETRACT_PAXOS, T_WRITE_DBLOCK_MBLOCK_SH, Token};
use crate::{HostId, LEASE_FREE, majority_disks, monotime};

/// Skip the ownership gate entirely.
pub const ACQUIRE_FORCE: u32 = 0x1;
/// Acquire for a shared (non-exclusive) holder.
pub const ACQUIRE_SHARED: u32 = 0x2;
/// Do not wait out an owner whose liveness is still unknown.
pub const ACQUIRE_OWNER_NOWAIT: u32 = 0x4;

/// Caller-visible identity of a resource read off disk.
#[derive(Clone, Debug, Default)]
pub struct ResourceInfo {
    pub lockspace_name: String,
    pub resource_name: String,
    pub lver: u64,
    pub sector_size: u32,
    pub align_size: u32,
}

fn sector_count(num_hosts: u64) -> u64 {
    (num_hosts + 2).next_power_of_two()
}

fn verify_leader(token: &Token, lr: &LeaderRecord, computed: u32) -> Result<(), Error> {
    if lr.magic == PAXOS_DISK_CLEAR {
        return Err(Error::LeaderMagic);
    }
    if lr.magic != PAXOS_DISK_MAGIC {
        warn!("verify_leader wrong magic {:x} {}", lr.magic, token.resource_name);
        return Err(Error::LeaderMagic);
    }
    if lr.version & DISK_VERSION_MAJOR_MASK != DISK_VERSION & DISK_VERSION_MAJOR_MASK {
        warn!("verify_leader wrong version {:x} {}", lr.version, token.resource_name);
        return Err(Error::LeaderVersion);
    }
    if lr.space_name != token.space_name {
        warn!(
            "verify_leader wrong space name {} {} {}",
            lr.space_name, token.space_name, token.resource_name
        );
        return Err(Error::LeaderLockspace);
    }
    if lr.resource_name != token.resource_name {
        warn!(
            "verify_leader wrong resource name {} {}",
            lr.resource_name, token.resource_name
        );
        return Err(Error::LeaderResource);
    }
    if lr.num_hosts < token.host_id {
        warn!(
            "verify_leader num_hosts too small {} {}",
            lr.num_hosts, token.host_id
        );
        return Err(Error::LeaderNumHosts);
    }
    if lr.checksum != computed {
        warn!(
            "verify_leader wrong checksum {:x} {computed:x} {}",
            lr.checksum, token.resource_name
        );
        return Err(Error::LeaderChecksum);
    }
    Ok(())
}

fn verify_dblock(token: &Token, pd: &PaxosDblock, computed: u32) -> Result<(), Error> {
    // a host that never participated leaves its block zeroed
    if pd.is_zero() {
        return Ok(());
    }
    if pd.checksum != computed {
        warn!(
            "verify_dblock wrong checksum {:x} {:x} {}",
            pd.checksum, computed, token.resource_name
        );
        return Err(Error::DblockChecksum);
    }
    Ok(())
}

async fn read_leader_disk(
    token: &Token,
    disk: &SyncDisk,
) -> Result<(LeaderRecord, u32), Error> {
    let buf =
        diskio::read_sectors(disk, token.sector_size, 0, 1, token.io_timeout_duration()).await?;
    Ok(LeaderRecord::decode(&buf.as_slice()[..LEADER_RECORD_SIZE]))
}

async fn write_leader_disk(
    token: &Token,
    disk: &SyncDisk,
    lr: &mut LeaderRecord,
) -> Result<(), Error> {
    let bytes = lr.encode();
    diskio::write_sector(disk, token.sector_size, 0, &bytes, token.io_timeout_duration()).await
}

async fn read_dblock_disk(
    token: &Token,
    disk: &SyncDisk,
    host_id: HostId,
) -> Result<(PaxosDblock, u32), Error> {
    let buf = diskio::read_sectors(
        disk,
        token.sector_size,
        2 + host_id - 1,
        1,
        token.io_timeout_duration(),
    )
    .await?;
    Ok(PaxosDblock::decode(&buf.as_slice()[..PAXOS_DBLOCK_SIZE]))
}

/// Writes a combined dblock and mode block in one sector.
///
/// Used while converting a shared holder to exclusive: the ballot must
/// stamp our dblock without clobbering the SHARED mode block that protects
/// our existing grant should the conversion fail.
async fn write_dblock_mblock_sh(
    token: &Token,
    disk: &SyncDisk,
    host_id: HostId,
    pd: &mut PaxosDblock,
) -> Result<(), Error> {
    let mut mb = ModeBlock {
        flags: MBLOCK_FL_SHARED,
        generation: token.host_generation,
        checksum: 0,
    };
    let mut buf = AlignedBuf::zeroed(token.sector_size as usize);
    let pd_bytes = pd.encode();
    let mb_bytes = mb.encode();
    buf.as_mut_slice()[..PAXOS_DBLOCK_SIZE].copy_from_slice(&pd_bytes);
    buf.as_mut_slice()[MBLOCK_OFFSET..MBLOCK_OFFSET + MODE_BLOCK_SIZE].copy_from_slice(&mb_bytes);
    let offset = disk.offset + (2 + host_id - 1) * u64::from(token.sector_size);
    diskio::write_iobuf(disk, offset, buf, token.io_timeout_duration()).await
}

async fn write_dblock_disk(
    token: &Token,
    disk: &SyncDisk,
    host_id: HostId,
    pd: &mut PaxosDblock,
) -> Result<(), Error> {
    if token.flags & T_WRITE_DBLOCK_MBLOCK_SH != 0 {
        return write_dblock_mblock_sh(token, disk, host_id, pd).await;
    }
    let bytes = pd.encode();
    diskio::write_sector(
        disk,
        token.sector_size,
        2 + host_id - 1,
        &bytes,
        token.io_timeout_duration(),
    )
    .await
}

/// Writes `pd` as our dblock on a majority of the token's disks.
async fn write_dblock_all(token: &Token, pd: &mut PaxosDblock) -> Result<(), Error> {
    let mut num_writes = 0;
    let mut last_err = Error::DblockWrite;
    for disk in &token.disks {
        match write_dblock_disk(token, disk, token.host_id, pd).await {
            Ok(()) => num_writes += 1,
            Err(err) => last_err = err,
        }
    }
    if !majority_disks(token.disks.len(), num_writes) {
        warn!("dblock write error {last_err} {}", token.resource_name);
        return Err(Error::DblockWrite);
    }
    Ok(())
}

/// Zeroes our dblock sector (mode block included) on a majority of disks,
/// withdrawing any pending ballot participation so no peer can adopt our
/// values.
pub async fn erase_dblock(token: &Token, host_id: HostId) -> Result<(), Error> {
    let mut num_writes = 0;
    for disk in &token.disks {
        let buf = AlignedBuf::zeroed(token.sector_size as usize);
        let offset = disk.offset + (2 + host_id - 1) * u64::from(token.sector_size);
        if diskio::write_iobuf(disk, offset, buf, token.io_timeout_duration())
            .await
            .is_ok()
        {
            num_writes += 1;
        }
    }
    if !majority_disks(token.disks.len(), num_writes) {
        return Err(Error::DblockWrite);
    }
    Ok(())
}

/// Writes the SHARED mode block next to our current dblock.
pub async fn write_shared_mblock(token: &mut Token) -> Result<(), Error> {
    let saved = token.flags;
    token.flags |= T_WRITE_DBLOCK_MBLOCK_SH;
    let mut pd = token.dblock;
    let res = write_dblock_all(token, &mut pd).await;
    token.flags = saved;
    token.dblock = pd;
    res
}

/// Clears our mode block (and rewrites our dblock unchanged).
pub async fn clear_mblock(token: &mut Token) -> Result<(), Error> {
    let saved = token.flags;
    token.flags &= !T_WRITE_DBLOCK_MBLOCK_SH;
    let mut pd = token.dblock;
    let res = write_dblock_all(token, &mut pd).await;
    token.flags = saved;
    token.dblock = pd;
    res
}

/// Sets the RELEASED flag in our dblock and writes it to a majority.
/// Done before releasing the leader so peers that cannot trust our leader
/// record can still see we are gone.
pub async fn write_released_dblock(token: &mut Token) -> Result<(), Error> {
    let mut pd = token.dblock;
    pd.flags |= ondisk::DBLOCK_FL_RELEASED;
    write_dblock_all(token, &mut pd).await?;
    token.dblock = pd;
    Ok(())
}

struct LeaseView {
    leader: LeaderRecord,
    max_mbal: u64,
    max_q: Option<u64>,
}

/// Reads the entire lease area of one disk in one I/O: the leader, our own
/// dblock, and the maximum mbal over all ballot blocks.
async fn lease_read_one(
    token: &Token,
    disk: &SyncDisk,
    log_bk_vals: bool,
) -> Result<LeaseView, Error> {
    let iobuf_len = token.align_size as usize;
    let buf = AlignedBuf::zeroed(iobuf_len);
    let buf = diskio::read_iobuf(disk, disk.offset, buf, token.io_timeout_duration()).await?;
    let data = buf.as_slice();

    let (leader, computed) = LeaderRecord::decode(&data[..LEADER_RECORD_SIZE]);
    verify_leader(token, &leader, computed)?;

    let ss = token.sector_size as usize;
    let mut max_mbal = 0u64;
    let mut max_q = None;
    for q in 0..leader.num_hosts {
        let start = (2 + q as usize) * ss;
        if start + PAXOS_DBLOCK_SIZE > data.len() {
            break;
        }
        let (bk, bk_computed) = PaxosDblock::decode(&data[start..start + PAXOS_DBLOCK_SIZE]);
        verify_dblock(token, &bk, bk_computed)?;
        if log_bk_vals && bk.mbal != 0 && bk.lver >= leader.lver {
            debug!(
                "lease_read {} dblock[{q}] {}:{}:{}:{}:{}:{}:{:x}",
                token.resource_name, bk.mbal, bk.bal, bk.inp, bk.inp2, bk.inp3, bk.lver, bk.flags
            );
        }
        if max_q.is_none() || bk.mbal > max_mbal {
            max_mbal = bk.mbal;
            max_q = Some(q + 1);
        }
    }
    Ok(LeaseView {
        leader,
        max_mbal,
        max_q,
    })
}

/// Reads the lease area from all disks, returning a leader that matches on
/// a majority and the maximum mbal seen anywhere.
async fn lease_read(token: &Token, log_bk_vals: bool) -> Result<(LeaderRecord, u64), Error> {
    if token.disks.len() == 1 {
        let view = lease_read_one(token, &token.disks[0], log_bk_vals).await?;
        debug!(
            "lease_read {} leader {} owner {} {} {} max mbal[{:?}] {}",
            token.resource_name,
            view.leader.lver,
            view.leader.owner_id,
            view.leader.owner_generation,
            view.leader.timestamp,
            view.max_q,
            view.max_mbal
        );
        return Ok((view.leader, view.max_mbal));
    }

    let mut views = Vec::new();
    for disk in &token.disks {
        match lease_read_one(token, disk, false).await {
            Ok(view) => views.push(view),
            Err(err) => debug!("lease_read {} disk error {err}", token.resource_name),
        }
    }
    if views.is_empty() {
        return Err(Error::DblockRead);
    }
    let max_mbal = views.iter().map(|v| v.max_mbal).max().unwrap_or(0);

    // a leader copy counts only if the same bytes repeat on a majority
    for view in &views {
        let reps = views.iter().filter(|v| v.leader == view.leader).count();
        if majority_disks(token.disks.len(), reps) {
            return Ok((view.leader.clone(), max_mbal));
        }
    }
    warn!("lease_read {} leader inconsistent", token.resource_name);
    Err(Error::LeaderDiff)
}

/// Reads and verifies the leader from a majority of disks.
pub async fn leader_read(token: &Token) -> Result<LeaderRecord, Error> {
    if token.disks.len() == 1 {
        let (leader, computed) = read_leader_disk(token, &token.disks[0]).await?;
        verify_leader(token, &leader, computed)?;
        return Ok(leader);
    }

    let mut leaders = Vec::new();
    for disk in &token.disks {
        let Ok((leader, computed)) = read_leader_disk(token, disk).await else {
            continue;
        };
        if verify_leader(token, &leader, computed).is_ok() {
            leaders.push(leader);
        }
    }
    if !majority_disks(token.disks.len(), leaders.len()) {
        return Err(Error::LeaderRead);
    }
    for leader in &leaders {
        let reps = leaders.iter().filter(|l| *l == leader).count();
        if majority_disks(token.disks.len(), reps) {
            return Ok(leader.clone());
        }
    }
    warn!("leader_read {} leader inconsistent", token.resource_name);
    Err(Error::LeaderDiff)
}

/// Reads the lockspace and resource names, lver and sizes off disk[0],
/// without requiring the caller to know them in advance.
pub async fn read_resource(token: &mut Token) -> Result<ResourceInfo, Error> {
    // Sector size is unknown before the first read; reading 4k of a 512
    // disk is harmless, the leader record is all we need.
    if token.sector_size == 0 {
        token.sector_size = 4096;
        token.align_size = ondisk::sector_size_to_align_size(4096);
    }

    let (leader, computed) = read_leader_disk(token, &token.disks[0]).await?;

    if token.space_name.is_empty() {
        token.space_name = leader.space_name.clone();
    }
    if token.resource_name.is_empty() {
        token.resource_name = leader.resource_name.clone();
    }

    if token.flags & T_CHECK_EXISTS != 0 {
        if leader.magic != PAXOS_DISK_MAGIC {
            return Err(Error::LeaderMagic);
        }
    } else {
        verify_leader(token, &leader, computed)?;
    }

    if leader.sector_size == 512 || leader.sector_size == 4096 {
        let mut align = ondisk::align_size_from_flags(leader.flags);
        if align == 0 {
            align = ondisk::sector_size_to_align_size(leader.sector_size);
        }
        token.sector_size = leader.sector_size;
        token.align_size = align;
    }

    Ok(ResourceInfo {
        lockspace_name: leader.space_name.clone(),
        resource_name: leader.resource_name.clone(),
        lver: leader.lver,
        sector_size: token.sector_size,
        align_size: token.align_size,
    })
}

/// Reads the request record (sector 1) of disk[0].
pub async fn request_read(token: &Token) -> Result<RequestRecord, Error> {
    let buf = diskio::read_sectors(
        &token.disks[0],
        token.sector_size,
        1,
        1,
        token.io_timeout_duration(),
    )
    .await?;
    let (rec, _computed) = RequestRecord::decode(&buf.as_slice()[..REQUEST_RECORD_SIZE]);
    Ok(rec)
}

/// Writes the request record (sector 1) of disk[0].
pub async fn request_write(token: &Token, rr: &mut RequestRecord) -> Result<(), Error> {
    let bytes = rr.encode();
    diskio::write_sector(
        &token.disks[0],
        token.sector_size,
        1,
        &bytes,
        token.io_timeout_duration(),
    )
    .await
}

/// Manually overwrites the leader of disk[0]. Repair and test tooling only;
/// never part of the acquire or release paths.
pub async fn leader_clobber(token: &Token, leader: &mut LeaderRecord) -> Result<(), Error> {
    let bytes = leader.encode();
    diskio::write_sector(
        &token.disks[0],
        token.sector_size,
        0,
        &bytes,
        token.io_timeout_duration(),
    )
    .await
}

async fn write_new_leader(token: &Token, nl: &mut LeaderRecord) -> Result<(), Error> {
    let mut num_writes = 0;
    let mut timeout = false;
    let mut last_err = None;
    for disk in &token.disks {
        match write_leader_disk(token, disk, nl).await {
            Ok(()) => num_writes += 1,
            Err(Error::AioTimeout) => timeout = true,
            Err(err) => last_err = Some(err),
        }
    }
    if !majority_disks(token.disks.len(), num_writes) {
        warn!(
            "write_new_leader error {last_err:?} timeout {timeout} owner {} {} {}",
            nl.owner_id, nl.owner_generation, nl.timestamp
        );
        if timeout {
            return Err(Error::AioTimeout);
        }
        return Err(last_err.unwrap_or(Error::LeaderWrite));
    }
    Ok(())
}

/// One two-phase ballot at `next_lver` with proposal number `our_mbal`.
///
/// Phase 1 writes our dblock `{mbal, lver}` then reads every block back
/// from a majority, aborting on any larger mbal or lver. Phase 2 does the
/// same with `bal = mbal` and the value to commit: the pending value with
/// the largest `bal` seen in phase 1, or our own identity if none.
///
/// After phase 2 has reached a majority we may be committed by a peer even
/// if we fail here; such failures set `T_RETRACT_PAXOS` on the token so the
/// release path explicitly clears ownership.
pub(crate) async fn run_ballot(
    token: &mut Token,
    num_hosts: u64,
    next_lver: u64,
    our_mbal: u64,
) -> Result<PaxosDblock, Error> {
    let num_disks = token.disks.len();
    let ss = token.sector_size as usize;
    let iobuf_len = (sector_count(num_hosts) * token.sector_size as u64) as usize;

    debug!(
        "ballot {next_lver} phase1 write mbal {our_mbal} {}",
        token.resource_name
    );

    let mut dblock = PaxosDblock {
        mbal: our_mbal,
        lver: next_lver,
        ..Default::default()
    };
    let mut bk_max = PaxosDblock::default();
    let mut phase2 = false;

    let result: Result<(), Error> = async {
        write_dblock_all(token, &mut dblock).await?;

        for phase in [1, 2] {
            if phase == 2 {
                // choose the value to commit: the pending value with the
                // largest accepted ballot, otherwise our own identity
                if bk_max.inp != 0 {
                    dblock.inp = bk_max.inp;
                    dblock.inp2 = bk_max.inp2;
                    dblock.inp3 = bk_max.inp3;
                    debug!(
                        "ballot {next_lver} choose bk_max lver {} mbal {} bal {} inp {} {} {}",
                        bk_max.lver, bk_max.mbal, bk_max.bal, bk_max.inp, bk_max.inp2, bk_max.inp3
                    );
                } else {
                    dblock.inp = token.host_id;
                    dblock.inp2 = token.host_generation;
                    dblock.inp3 = monotime();
                }
                dblock.bal = dblock.mbal;
                phase2 = true;

                debug!(
                    "ballot {next_lver} phase2 write bal {} inp {} {} {}",
                    dblock.bal, dblock.inp, dblock.inp2, dblock.inp3
                );
                write_dblock_all(token, &mut dblock).await?;
            }

            let mut num_reads = 0;
            for disk in &token.disks {
                let buf = AlignedBuf::zeroed(iobuf_len);
                let Ok(buf) =
                    diskio::read_iobuf(disk, disk.offset, buf, token.io_timeout_duration()).await
                else {
                    continue;
                };
                num_reads += 1;
                let data = buf.as_slice();

                for q in 0..num_hosts {
                    let start = (2 + q as usize) * ss;
                    if start + PAXOS_DBLOCK_SIZE > data.len() {
                        break;
                    }
                    let (bk, computed) =
                        PaxosDblock::decode(&data[start..start + PAXOS_DBLOCK_SIZE]);
                    if verify_dblock(token, &bk, computed).is_err() {
                        continue;
                    }
                    if bk.lver < dblock.lver {
                        continue;
                    }
                    if bk.lver > dblock.lver {
                        warn!(
                            "ballot {next_lver} abort{phase} larger lver in bk[{q}] \
                             {}:{}:{}:{}:{}:{} our dblock {}:{}:{}:{}:{}:{}",
                            bk.mbal, bk.bal, bk.inp, bk.inp2, bk.inp3, bk.lver,
                            dblock.mbal, dblock.bal, dblock.inp, dblock.inp2, dblock.inp3,
                            dblock.lver
                        );
                        return Err(Error::DblockLver);
                    }
                    if bk.mbal > dblock.mbal {
                        warn!(
                            "ballot {next_lver} abort{phase} larger mbal in bk[{q}] \
                             {}:{}:{}:{}:{}:{} our dblock {}:{}:{}:{}:{}:{}",
                            bk.mbal, bk.bal, bk.inp, bk.inp2, bk.inp3, bk.lver,
                            dblock.mbal, dblock.bal, dblock.inp, dblock.inp2, dblock.inp3,
                            dblock.lver
                        );
                        return Err(Error::DblockMbal);
                    }
                    if phase == 1 {
                        if bk.inp == 0 {
                            continue;
                        }
                        if bk.bal == 0 {
                            warn!("ballot {next_lver} zero bal inp[{q}] {}", bk.inp);
                            continue;
                        }
                        if bk.bal > bk_max.bal {
                            bk_max = bk;
                        }
                    }
                }
            }
            if !majority_disks(num_disks, num_reads) {
                warn!("ballot {next_lver} dblock read error phase{phase}");
                return Err(Error::DblockRead);
            }
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => Ok(dblock),
        Err(err) => {
            if matches!(err, Error::DblockRead | Error::DblockWrite) {
                // A peer could pick up and commit our ballot values even
                // though we abort here, which would leave us owning the
                // lease on disk without knowing it. The release path must
                // retract explicitly instead of trusting our last view.
                token.flags |= T_RETRACT_PAXOS;
                warn!("ballot {next_lver} retract error {err} phase2 {phase2}");
            }
            Err(err)
        }
    }
}

enum OwnerWait {
    Dead,
    Restart,
}

/// Waits until the current leader's owner can be declared dead, per its
/// delta lease (§owner-liveness): free slot, identity mismatch, or no
/// timestamp advance for the owner's dead bound.
async fn wait_owner_dead(
    token: &Token,
    registry: &SpaceRegistry,
    cur_leader: &LeaderRecord,
    flags: u32,
    cancel: &CancellationToken,
) -> Result<OwnerWait, Error> {
    let Some(ls) = registry.lockspace_disk(&cur_leader.space_name).await else {
        warn!(
            "paxos_acquire no lockspace info {} {}",
            cur_leader.space_name, token.resource_name
        );
        return Err(Error::AcquireLockspace);
    };
    let (mut ls_disk, ls_sector_size, ls_timeouts) = ls;
    if !ls_disk.is_open() && ls_disk.open(true).is_err() {
        return Err(Error::AcquireIdDisk);
    }

    let hs = registry
        .host_info(&cur_leader.space_name, cur_leader.owner_id)
        .await;

    let (wait_start, mut last_timestamp) = match &hs {
        Some(hs)
            if hs.last_check != 0
                && hs.last_live != 0
                && hs.owner_id == cur_leader.owner_id
                && hs.owner_generation == cur_leader.owner_generation =>
        {
            (hs.last_live, hs.timestamp)
        }
        _ => (monotime(), 0),
    };

    debug!(
        "paxos_acquire owner {} {} {} wait_start {wait_start}",
        cur_leader.owner_id, cur_leader.owner_generation, cur_leader.timestamp
    );

    loop {
        let host_rec = delta::lease_read(
            &ls_disk,
            ls_sector_size,
            ls_timeouts.io_timeout_duration(),
            &cur_leader.space_name,
            cur_leader.owner_id,
        )
        .await?;

        // A slot cannot become free, or be re-acquired by anyone, in less
        // than host_dead_seconds after the owner's final renewal.
        if host_rec.timestamp == LEASE_FREE {
            debug!("paxos_acquire owner {} delta free", cur_leader.owner_id);
            return Ok(OwnerWait::Dead);
        }
        if host_rec.owner_id != cur_leader.owner_id
            || host_rec.owner_generation > cur_leader.owner_generation
        {
            debug!(
                "paxos_acquire owner {} {} delta {} {} mismatch",
                cur_leader.owner_id,
                cur_leader.owner_generation,
                host_rec.owner_id,
                host_rec.owner_generation
            );
            return Ok(OwnerWait::Dead);
        }

        if last_timestamp == 0 {
            // first observation; judge aliveness on the next pass
            last_timestamp = host_rec.timestamp;
        } else {
            let locally_live = hs
                .as_ref()
                .is_some_and(|hs| hs.last_live != 0 && hs.last_check == hs.last_live);
            if host_rec.timestamp != last_timestamp || locally_live {
                debug!(
                    "paxos_acquire owner {} delta ts {} alive",
                    cur_leader.owner_id, host_rec.timestamp
                );

                // A live owner may have released the lease while a peer was
                // mid-ballot and rewrote the leader naming it. If the leader
                // writer is not the owner, a RELEASED owner dblock tells us
                // the lease is actually free for the taking.
                if cur_leader.write_id != cur_leader.owner_id {
                    if let Ok((od, _)) =
                        read_dblock_disk(token, &token.disks[0], cur_leader.owner_id).await
                    {
                        if od.flags & ondisk::DBLOCK_FL_RELEASED != 0 {
                            warn!(
                                "paxos_acquire owner {} {} writer {} owner dblock released",
                                cur_leader.owner_id, cur_leader.owner_generation,
                                cur_leader.write_id
                            );
                            return Ok(OwnerWait::Dead);
                        }
                    }
                }

                if flags & ACQUIRE_OWNER_NOWAIT != 0 {
                    return Err(Error::AcquireOwnedRetry);
                }
                return Err(Error::AcquireIdLive);
            }

            let dead_seconds = match &hs {
                Some(hs) if hs.io_timeout != 0 => host_dead_seconds_for(hs.io_timeout),
                _ => host_dead_seconds_for(host_rec.io_timeout),
            };
            let now = monotime();
            if now.saturating_sub(wait_start) > dead_seconds {
                debug!(
                    "paxos_acquire owner {} dead {now}-{wait_start}>{dead_seconds}",
                    cur_leader.owner_id
                );
                return Ok(OwnerWait::Dead);
            }
            if flags & ACQUIRE_OWNER_NOWAIT != 0 {
                debug!("paxos_acquire owner {} no wait", cur_leader.owner_id);
                return Err(Error::AcquireOwnedRetry);
            }
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        if cancel.is_cancelled() {
            return Err(Error::SpaceKilling);
        }

        // if the leader changes while we wait, restart the whole acquire
        let tmp_leader = leader_read(token).await?;
        if tmp_leader != *cur_leader {
            debug!(
                "paxos_acquire restart leader changed from {} {} {} to {} {} {}",
                cur_leader.owner_id,
                cur_leader.owner_generation,
                cur_leader.timestamp,
                tmp_leader.owner_id,
                tmp_leader.owner_generation,
                tmp_leader.timestamp
            );
            return Ok(OwnerWait::Restart);
        }
    }
}

/// Attempts to become (or confirm ourselves as) owner of the resource.
///
/// On success the committed leader and our dblock are stored back into the
/// token. `acquire_lver != 0` pins the expected current lease version;
/// `new_num_hosts != 0` rewrites the leader's num_hosts on commit.
pub async fn acquire(
    token: &mut Token,
    registry: &SpaceRegistry,
    flags: u32,
    acquire_lver: u64,
    new_num_hosts: u64,
    cancel: &CancellationToken,
) -> Result<(LeaderRecord, PaxosDblock), Error> {
    debug!(
        "paxos_acquire begin {} offset {} flags {flags:x} {} {}",
        token.resource_name, token.disks[0].offset, token.sector_size, token.align_size
    );
    if token.sector_size == 0 {
        return Err(Error::Io("paxos_acquire with zero sector_size".into()));
    }

    'restart: loop {
        let (cur_leader, max_mbal) = lease_read(token, true).await?;

        let mut align_size = ondisk::align_size_from_flags(cur_leader.flags);
        if align_size == 0 {
            align_size = ondisk::sector_size_to_align_size(cur_leader.sector_size);
        }
        // The token sizes start out as the lockspace's; the resource may
        // have been initialized with different ones.
        if cur_leader.sector_size != token.sector_size || align_size != token.align_size {
            debug!(
                "paxos_acquire restart with sizes {} {} now {} {align_size}",
                token.sector_size, token.align_size, cur_leader.sector_size
            );
            token.sector_size = cur_leader.sector_size;
            token.align_size = align_size;
            continue 'restart;
        }

        // ownership gate
        let mut gate_open = false;
        if flags & ACQUIRE_FORCE != 0 {
            gate_open = true;
        } else {
            if acquire_lver != 0 && cur_leader.lver != acquire_lver {
                warn!(
                    "paxos_acquire acquire_lver {acquire_lver} cur_leader {}",
                    cur_leader.lver
                );
                return Err(Error::AcquireLver);
            }
            if cur_leader.timestamp == LEASE_FREE {
                debug!("paxos_acquire leader {} free", cur_leader.lver);
                gate_open = true;
            } else if cur_leader.owner_id == token.host_id
                && cur_leader.owner_generation == token.host_generation
            {
                // Already committed as owner at our current generation,
                // e.g. by a peer that finished our ballot after we crashed
                // between phase 2 and the leader write. The grant stands;
                // re-running the ballot would only burn an lver.
                info!(
                    "paxos_acquire owner {} {} {} is already local",
                    cur_leader.owner_id, cur_leader.owner_generation, cur_leader.timestamp
                );
                token.leader = cur_leader.clone();
                return Ok((cur_leader, token.dblock));
            } else if cur_leader.owner_id == token.host_id
                && cur_leader.owner_generation < token.host_generation
            {
                // we held it in a previous lockspace generation and never
                // cleanly released it
                debug!(
                    "paxos_acquire owner {} {} was old local new is {}",
                    cur_leader.owner_id, cur_leader.owner_generation, token.host_generation
                );
                gate_open = true;
            }
        }

        // Shared acquires are short-hold by construction; a foreign owner
        // without the hint is a real exclusive holder we must not disturb,
        // and one with it will be gone shortly.
        if !gate_open && flags & ACQUIRE_SHARED != 0 {
            if cur_leader.flags & LFL_SHORT_HOLD != 0 {
                return Err(Error::AcquireOwnedRetry);
            }
            return Err(Error::AcquireIdLive);
        }

        if !gate_open {
            match wait_owner_dead(token, registry, &cur_leader, flags, cancel).await? {
                OwnerWait::Dead => {}
                OwnerWait::Restart => continue 'restart,
            }
        }

        // The next_lver must come from the leader we gated on, not from a
        // re-read: another host may have already committed us as the owner
        // of next_lver as it stands now.
        let next_lver = cur_leader.lver + 1;
        let mut our_mbal = if max_mbal == 0 {
            token.host_id
        } else {
            max_mbal - (max_mbal % cur_leader.max_hosts) + cur_leader.max_hosts + token.host_id
        };
        let mut first_ballot = true;

        loop {
            let tmp_leader = if first_ballot {
                // reusing the initial read removes an iop in the common case
                cur_leader.clone()
            } else {
                leader_read(token).await?
            };
            first_ballot = false;

            if tmp_leader.lver == next_lver {
                // somebody committed a leader at next_lver, maybe with us
                // as the owner
                return if tmp_leader.owner_id == token.host_id
                    && tmp_leader.owner_generation == token.host_generation
                {
                    warn!(
                        "paxos_acquire {next_lver} owner is our inp committed by {}",
                        tmp_leader.write_id
                    );
                    token.leader = tmp_leader.clone();
                    Ok((tmp_leader, token.dblock))
                } else {
                    warn!(
                        "paxos_acquire {next_lver} owner is {} {} {}",
                        tmp_leader.owner_id, tmp_leader.owner_generation, tmp_leader.timestamp
                    );
                    token.leader = tmp_leader;
                    Err(Error::AcquireOwned)
                };
            }
            if tmp_leader.lver > next_lver {
                // released and reacquired behind our back while we delayed
                debug!(
                    "paxos_acquire {next_lver} restart new lver {}",
                    tmp_leader.lver
                );
                continue 'restart;
            }
            if tmp_leader != cur_leader {
                debug!("paxos_acquire {next_lver} restart leader changed");
                continue 'restart;
            }

            match run_ballot(token, cur_leader.num_hosts, next_lver, our_mbal).await {
                Ok(dblock) => {
                    // ballot success, commit next_lver with the dblock values
                    let mut new_leader = cur_leader.clone();
                    new_leader.lver = dblock.lver;
                    new_leader.owner_id = dblock.inp;
                    new_leader.owner_generation = dblock.inp2;
                    new_leader.timestamp = dblock.inp3;
                    new_leader.write_id = token.host_id;
                    new_leader.write_generation = token.host_generation;
                    new_leader.write_timestamp = monotime();
                    if new_num_hosts != 0 {
                        new_leader.num_hosts = new_num_hosts;
                    }
                    if new_leader.owner_id == token.host_id {
                        // SHORT_HOLD is only a hint for shared acquirers
                        // retrying against transient exclusive holders; we
                        // can only speak for our own intent.
                        if flags & ACQUIRE_SHARED != 0 {
                            new_leader.flags |= LFL_SHORT_HOLD;
                        } else {
                            new_leader.flags &= !LFL_SHORT_HOLD;
                        }
                    }

                    if let Err(err) = write_new_leader(token, &mut new_leader).await {
                        token.flags |= T_RETRACT_PAXOS;
                        token.leader = new_leader;
                        return Err(err);
                    }

                    if new_leader.owner_id != token.host_id {
                        // we propagated a crashed peer's pending value, as
                        // the protocol demands
                        warn!(
                            "ballot {next_lver} commit other owner {} {} {}",
                            new_leader.owner_id, new_leader.owner_generation, new_leader.timestamp
                        );
                        token.leader = new_leader;
                        return Err(Error::AcquireOther);
                    }

                    info!(
                        "ballot {next_lver} commit self owner {} {} {}",
                        new_leader.owner_id, new_leader.owner_generation, new_leader.timestamp
                    );
                    token.leader = new_leader.clone();
                    token.dblock = dblock;
                    return Ok((new_leader, dblock));
                }
                Err(err @ (Error::DblockMbal | Error::DblockLver)) => {
                    let us = rand::rng().random_range(0..=1_000_000u64);
                    debug!("paxos_acquire {next_lver} retry {err} delay {us} us");
                    tokio::time::sleep(Duration::from_micros(us)).await;
                    our_mbal += cur_leader.max_hosts;
                }
                Err(err) => {
                    warn!("paxos_acquire {next_lver} ballot error {err}");
                    return Err(err);
                }
            }
        }
    }
}

/// Marks the lease free.
///
/// `last` is the leader the caller last observed while owning the lease;
/// `None` (the retract path) makes the on-disk leader its own reference so
/// the release proceeds whenever we are in fact the owner.
pub async fn release(
    token: &mut Token,
    last: Option<&LeaderRecord>,
) -> Result<LeaderRecord, Error> {
    let leader = leader_read(token).await?;
    let last = last.unwrap_or(&leader);

    // If another host was the writer of the current leader (it finished the
    // same ballot and committed us), peers ignore that leader once our
    // dblock is released; rewriting it here could clobber a newer leader a
    // peer is writing right now. Our RELEASED dblock, already written by
    // the caller, is the whole release.
    if leader.write_id != token.host_id {
        warn!(
            "paxos_release skip write last lver {} owner {} {} {} disk writer {}",
            last.lver, last.owner_id, last.owner_generation, last.timestamp, leader.write_id
        );
        return Ok(leader);
    }

    if leader.lver != last.lver {
        warn!(
            "paxos_release other lver last {} disk {}",
            last.lver, leader.lver
        );
        return Err(Error::ReleaseLver);
    }
    if leader.timestamp == LEASE_FREE {
        warn!("paxos_release already free lver {}", leader.lver);
        return Err(Error::ReleaseOwner);
    }
    if leader.owner_id != token.host_id || leader.owner_generation != token.host_generation {
        warn!(
            "paxos_release other owner {} {} {}",
            leader.owner_id, leader.owner_generation, leader.timestamp
        );
        return Err(Error::ReleaseOwner);
    }
    if leader != *last {
        warn!("paxos_release different vals");
        return Err(Error::ReleaseOwner);
    }

    let mut freed = leader;
    freed.timestamp = LEASE_FREE;
    freed.write_id = token.host_id;
    freed.write_generation = token.host_generation;
    freed.write_timestamp = monotime();
    freed.flags &= !LFL_SHORT_HOLD;

    write_new_leader(token, &mut freed).await?;
    token.leader = freed.clone();
    Ok(freed)
}

/// Formats the lease area: a free leader, a zeroed request record, zeroed
/// dblocks, written in one aligned buffer per disk. With `write_clear` the
/// leader gets the CLEAR magic, reserving the area without making it usable.
pub async fn init(token: &mut Token, num_hosts: u64, write_clear: bool) -> Result<(), Error> {
    let mut sector_size = token.sector_size;
    let mut align_size = token.align_size;
    let mut max_hosts = token.max_hosts;
    if sector_size == 0 {
        sector_size = 512;
        align_size = ondisk::sector_size_to_align_size(512);
    }
    if max_hosts == 0 {
        max_hosts = crate::DEFAULT_MAX_HOSTS;
    }
    let num_hosts = if num_hosts == 0 || num_hosts > max_hosts {
        max_hosts
    } else {
        num_hosts
    };
    token.sector_size = sector_size;
    token.align_size = align_size;

    let mut leader = LeaderRecord {
        magic: if write_clear {
            PAXOS_DISK_CLEAR
        } else {
            PAXOS_DISK_MAGIC
        },
        version: DISK_VERSION,
        flags: ondisk::align_flag_from_size(align_size),
        sector_size,
        num_hosts,
        max_hosts,
        timestamp: LEASE_FREE,
        write_timestamp: if write_clear { monotime() } else { 0 },
        space_name: token.space_name.clone(),
        resource_name: token.resource_name.clone(),
        ..Default::default()
    };
    let mut rr = RequestRecord {
        magic: REQ_DISK_MAGIC,
        version: DISK_VERSION,
        ..Default::default()
    };

    let leader_bytes = leader.encode();
    let rr_bytes = rr.encode();

    for disk in &token.disks {
        let mut buf = AlignedBuf::zeroed(align_size as usize);
        buf.as_mut_slice()[..LEADER_RECORD_SIZE].copy_from_slice(&leader_bytes);
        let s1 = sector_size as usize;
        buf.as_mut_slice()[s1..s1 + REQUEST_RECORD_SIZE].copy_from_slice(&rr_bytes);
        diskio::write_iobuf(disk, disk.offset, buf, token.io_timeout_duration()).await?;
    }
    info!(
        "paxos_init {}:{} num_hosts {num_hosts} max_hosts {max_hosts} clear {write_clear}",
        token.space_name, token.resource_name
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diskio::test_util::temp_disk;
    use crate::lockspace::HostStatus;
    use crate::ondisk::{DELTA_DISK_MAGIC, DeltaRecord};
    use crate::timeouts::Timeouts;
    use crate::token::{self, Token};

    const FAST: Timeouts = Timeouts {
        io_timeout: 1,
        renewal: 1,
        renewal_warn: 2,
        renewal_fail: 3,
        host_id_timeout: 0,
    };
    const ALIGN: u64 = 1024 * 1024;

    fn test_token(disk: &SyncDisk, host_id: HostId, generation: u64) -> Token {
        Token {
            token_id: host_id,
            space_name: "spc".into(),
            resource_name: "res".into(),
            disks: vec![disk.clone()],
            host_id,
            host_generation: generation,
            sector_size: 512,
            align_size: ALIGN as u32,
            max_hosts: 2000,
            io_timeout: 1,
            ..Default::default()
        }
    }

    async fn init_resource(tag: &str, num_hosts: u64) -> SyncDisk {
        let disk = temp_disk(tag, ALIGN);
        let mut token = test_token(&disk, 1, 1);
        init(&mut token, num_hosts, false).await.unwrap();
        disk
    }

    fn live_delta(host_id: HostId, generation: u64) -> DeltaRecord {
        DeltaRecord {
            magic: DELTA_DISK_MAGIC,
            version: DISK_VERSION,
            io_timeout: FAST.io_timeout,
            owner_id: host_id,
            owner_generation: generation,
            timestamp: monotime(),
            space_name: "spc".into(),
            resource_name: "spc".into(),
            checksum: 0,
        }
    }

    /// Lockspace disk with live delta slots for the given peers, plus a
    /// registry whose host_status marks them locally live.
    async fn registry_with_peers(
        tag: &str,
        peers: &[(HostId, u64)],
    ) -> (SpaceRegistry, SyncDisk) {
        let ls_disk = temp_disk(tag, 8 * 512);
        delta::lease_init(&ls_disk, 512, FAST.io_timeout_duration(), "spc", 8)
            .await
            .unwrap();
        let registry = SpaceRegistry::new();
        let space = registry
            .insert_established("spc", 7, ls_disk.clone(), 512, FAST, live_delta(7, 1))
            .await;
        let now = monotime();
        for &(host_id, generation) in peers {
            let mut rec = live_delta(host_id, generation);
            let bytes = rec.encode();
            diskio::write_sector(&ls_disk, 512, host_id - 1, &bytes, FAST.io_timeout_duration())
                .await
                .unwrap();
            space.state.lock().await.host_status.insert(
                host_id,
                HostStatus {
                    owner_id: host_id,
                    owner_generation: generation,
                    timestamp: rec.timestamp,
                    io_timeout: FAST.io_timeout,
                    last_check: now,
                    last_live: now,
                },
            );
        }
        (registry, ls_disk)
    }

    #[tokio::test]
    async fn init_acquire_release_cycle() {
        let disk = init_resource("px-cycle", 2).await;
        let registry = SpaceRegistry::new();
        let cancel = CancellationToken::new();
        let mut token = test_token(&disk, 1, 1);

        let (leader, dblock) = acquire(&mut token, &registry, 0, 0, 0, &cancel)
            .await
            .unwrap();
        assert_eq!(leader.owner_id, 1);
        assert_eq!(leader.owner_generation, 1);
        assert_eq!(leader.lver, 1);
        assert_ne!(leader.timestamp, LEASE_FREE);
        assert_eq!(dblock.inp, 1);

        // majority durability: the committed leader is readable back
        let on_disk = leader_read(&token).await.unwrap();
        assert_eq!(on_disk, leader);

        token::release_token(&mut token).await.unwrap();
        let freed = leader_read(&token).await.unwrap();
        assert_eq!(freed.timestamp, LEASE_FREE);
        assert_eq!(freed.lver, 1);
        std::fs::remove_file(&disk.path).unwrap();
    }

    #[tokio::test]
    async fn lver_strictly_increases() {
        let disk = init_resource("px-lver", 2).await;
        let registry = SpaceRegistry::new();
        let cancel = CancellationToken::new();

        let mut last_lver = 0;
        for round in 0..3 {
            let mut token = test_token(&disk, 1, 1);
            let (leader, _) = acquire(&mut token, &registry, 0, 0, 0, &cancel)
                .await
                .unwrap();
            assert_eq!(leader.lver, last_lver + 1, "round {round}");
            last_lver = leader.lver;
            token::release_token(&mut token).await.unwrap();
        }
        std::fs::remove_file(&disk.path).unwrap();
    }

    #[tokio::test]
    async fn acquire_lver_pins_version() {
        let disk = init_resource("px-pin", 2).await;
        let registry = SpaceRegistry::new();
        let cancel = CancellationToken::new();
        let mut token = test_token(&disk, 1, 1);

        // current lver is 0, pinning 5 must fail
        let res = acquire(&mut token, &registry, 0, 5, 0, &cancel).await;
        assert_eq!(res.unwrap_err(), Error::AcquireLver);
        std::fs::remove_file(&disk.path).unwrap();
    }

    #[tokio::test]
    async fn contention_one_winner() {
        let disk = init_resource("px-race", 2).await;
        let (registry, ls_disk) = registry_with_peers("px-race-ls", &[(1, 1), (2, 1)]).await;
        let cancel = CancellationToken::new();

        let mut t1 = test_token(&disk, 1, 1);
        let mut t2 = test_token(&disk, 2, 1);
        let (r1, r2) = tokio::join!(
            acquire(&mut t1, &registry, 0, 0, 0, &cancel),
            acquire(&mut t2, &registry, 0, 0, 0, &cancel),
        );

        let winners = [r1.is_ok(), r2.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(winners, 1, "r1 {r1:?} r2 {r2:?}");
        for loser in [&r1, &r2] {
            if let Err(err) = loser {
                assert!(err.is_expected_outcome(), "loser error {err}");
            }
        }

        // the on-disk leader names the winner at lver 1
        let t = test_token(&disk, 1, 1);
        let leader = leader_read(&t).await.unwrap();
        assert_eq!(leader.lver, 1);
        let winner_id = if r1.is_ok() { 1 } else { 2 };
        assert_eq!(leader.owner_id, winner_id);
        std::fs::remove_file(&disk.path).unwrap();
        std::fs::remove_file(&ls_disk.path).unwrap();
    }

    #[tokio::test]
    async fn live_owner_blocks_acquire() {
        let disk = init_resource("px-live", 2).await;
        let (registry, ls_disk) = registry_with_peers("px-live-ls", &[(1, 1)]).await;
        let cancel = CancellationToken::new();

        let mut t1 = test_token(&disk, 1, 1);
        acquire(&mut t1, &registry, 0, 0, 0, &cancel).await.unwrap();

        let mut t2 = test_token(&disk, 2, 1);
        let res = acquire(&mut t2, &registry, 0, 0, 0, &cancel).await;
        assert_eq!(res.unwrap_err(), Error::AcquireIdLive);

        // with OWNER_NOWAIT the caller is told to retry instead
        let res = acquire(&mut t2, &registry, ACQUIRE_OWNER_NOWAIT, 0, 0, &cancel).await;
        assert_eq!(res.unwrap_err(), Error::AcquireOwnedRetry);
        std::fs::remove_file(&disk.path).unwrap();
        std::fs::remove_file(&ls_disk.path).unwrap();
    }

    #[tokio::test]
    async fn dead_owner_lease_stolen() {
        let disk = init_resource("px-dead", 2).await;
        let (registry, ls_disk) = registry_with_peers("px-dead-ls", &[(1, 1)]).await;
        let cancel = CancellationToken::new();

        let mut t1 = test_token(&disk, 1, 1);
        let (leader1, _) = acquire(&mut t1, &registry, 0, 0, 0, &cancel).await.unwrap();
        assert_eq!(leader1.lver, 1);

        // host 1 dies: its delta slot is freed and our local bookkeeping
        // about it is gone
        let mut freed = live_delta(1, 1);
        freed.timestamp = LEASE_FREE;
        let bytes = freed.encode();
        diskio::write_sector(&ls_disk, 512, 0, &bytes, FAST.io_timeout_duration())
            .await
            .unwrap();
        {
            let space = registry.lockspace_disk("spc").await;
            assert!(space.is_some());
        }
        let spaces = registry.snapshot().await;
        spaces[0].state.lock().await.host_status.remove(&1);

        let mut t2 = test_token(&disk, 2, 1);
        let (leader2, _) = acquire(&mut t2, &registry, 0, 0, 0, &cancel).await.unwrap();
        assert_eq!(leader2.owner_id, 2);
        assert_eq!(leader2.lver, 2);
        std::fs::remove_file(&disk.path).unwrap();
        std::fs::remove_file(&ls_disk.path).unwrap();
    }

    #[tokio::test]
    async fn split_commit_propagates_crashed_value() {
        let disk = init_resource("px-split", 2).await;
        let registry = SpaceRegistry::new();
        let cancel = CancellationToken::new();

        // host 1 finished phase 2 for lver 1 proposing itself, then crashed
        // before writing the leader
        let crash_time = monotime();
        let mut pd = PaxosDblock {
            mbal: 1,
            bal: 1,
            inp: 1,
            inp2: 1,
            inp3: crash_time,
            lver: 1,
            ..Default::default()
        };
        let bytes = pd.encode();
        diskio::write_sector(&disk, 512, 2, &bytes, FAST.io_timeout_duration())
            .await
            .unwrap();

        // host 2 must re-propose host 1's value, not its own
        let mut t2 = test_token(&disk, 2, 1);
        let res = acquire(&mut t2, &registry, 0, 0, 0, &cancel).await;
        assert_eq!(res.unwrap_err(), Error::AcquireOther);

        let leader = leader_read(&t2).await.unwrap();
        assert_eq!(leader.owner_id, 1);
        assert_eq!(leader.owner_generation, 1);
        assert_eq!(leader.lver, 1);
        assert_eq!(leader.timestamp, crash_time);
        assert_eq!(leader.write_id, 2);

        // host 1 on recovery sees itself as owner of lver 1 and does not
        // run another ballot
        let mut t1 = test_token(&disk, 1, 1);
        let (leader1, _) = acquire(&mut t1, &registry, 0, 0, 0, &cancel).await.unwrap();
        assert_eq!(leader1.lver, 1);
        assert_eq!(leader1.owner_id, 1);
        let after = leader_read(&t1).await.unwrap();
        assert_eq!(after, leader, "recovery must not rewrite the leader");
        std::fs::remove_file(&disk.path).unwrap();
    }

    #[tokio::test]
    async fn majority_loss_sets_retract() {
        let disk = init_resource("px-majority", 2).await;
        let mut token = test_token(&disk, 1, 1);
        token.disks.push(SyncDisk::new("/nonexistent/lodestone-b", 0));
        token.disks.push(SyncDisk::new("/nonexistent/lodestone-c", 0));

        let res = run_ballot(&mut token, 2, 1, 1).await;
        assert_eq!(res.unwrap_err(), Error::DblockWrite);
        assert_ne!(token.flags & T_RETRACT_PAXOS, 0);
        std::fs::remove_file(&disk.path).unwrap();
    }

    #[tokio::test]
    async fn retract_release_clears_ownership() {
        let disk = init_resource("px-retract", 2).await;
        let registry = SpaceRegistry::new();
        let cancel = CancellationToken::new();

        let mut token = test_token(&disk, 1, 1);
        acquire(&mut token, &registry, 0, 0, 0, &cancel).await.unwrap();

        // pretend the acquire ended in a failed ballot instead
        token.flags |= T_RETRACT_PAXOS;
        token::release_token(&mut token).await.unwrap();

        let leader = leader_read(&token).await.unwrap();
        assert_eq!(leader.timestamp, LEASE_FREE);
        let (od, _) = read_dblock_disk(&token, &token.disks[0], 1).await.unwrap();
        assert!(od.is_zero(), "retract must withdraw our ballot values");

        // retract when we are not the owner is also success
        let mut token2 = test_token(&disk, 2, 1);
        token2.flags |= T_RETRACT_PAXOS;
        token::release_token(&mut token2).await.unwrap();
        std::fs::remove_file(&disk.path).unwrap();
    }

    #[tokio::test]
    async fn ballot_numbers_are_disjoint_per_host() {
        let disk = init_resource("px-mbal", 4).await;
        let registry = SpaceRegistry::new();
        let cancel = CancellationToken::new();

        // a stale ballot block with a high mbal forces the next proposer
        // into the next max_hosts stride above it
        let mut stale = PaxosDblock {
            mbal: 2003,
            lver: 0,
            ..Default::default()
        };
        let bytes = stale.encode();
        diskio::write_sector(&disk, 512, 4, &bytes, FAST.io_timeout_duration())
            .await
            .unwrap();

        let mut token = test_token(&disk, 1, 1);
        acquire(&mut token, &registry, 0, 0, 0, &cancel).await.unwrap();
        // 2003 rounded down to the stride (2000), plus max_hosts, plus us
        assert_eq!(token.dblock.mbal, 2000 + 2000 + 1);
        assert_eq!(token.dblock.bal, token.dblock.mbal);
        std::fs::remove_file(&disk.path).unwrap();
    }

    #[tokio::test]
    async fn shared_grant_leaves_mode_block() {
        let disk = init_resource("px-shared", 2).await;
        let (registry, ls_disk) = registry_with_peers("px-shared-ls", &[(1, 1)]).await;
        let cancel = CancellationToken::new();

        let mut token = test_token(&disk, 1, 3);
        token.shared = true;
        token::acquire_token(&mut token, &registry, 0, 0, 0, &cancel)
            .await
            .unwrap();

        // the leader is free again, the mode block is the grant
        let leader = leader_read(&token).await.unwrap();
        assert_eq!(leader.timestamp, LEASE_FREE);
        let buf = diskio::read_sectors(&disk, 512, 2, 1, FAST.io_timeout_duration())
            .await
            .unwrap();
        let (mb, _) = ModeBlock::decode(
            &buf.as_slice()[MBLOCK_OFFSET..MBLOCK_OFFSET + MODE_BLOCK_SIZE],
        );
        assert_ne!(mb.flags & MBLOCK_FL_SHARED, 0);
        assert_eq!(mb.generation, 3);

        token::release_token(&mut token).await.unwrap();
        let buf = diskio::read_sectors(&disk, 512, 2, 1, FAST.io_timeout_duration())
            .await
            .unwrap();
        let (mb, _) = ModeBlock::decode(
            &buf.as_slice()[MBLOCK_OFFSET..MBLOCK_OFFSET + MODE_BLOCK_SIZE],
        );
        assert!(mb.is_zero());
        std::fs::remove_file(&disk.path).unwrap();
        std::fs::remove_file(&ls_disk.path).unwrap();
    }

    #[tokio::test]
    async fn read_resource_discovers_identity() {
        let disk = init_resource("px-ident", 2).await;
        let mut token = Token {
            disks: vec![disk.clone()],
            host_id: 1,
            io_timeout: 1,
            ..Default::default()
        };
        let info = read_resource(&mut token).await.unwrap();
        assert_eq!(info.lockspace_name, "spc");
        assert_eq!(info.resource_name, "res");
        assert_eq!(info.lver, 0);
        assert_eq!(info.sector_size, 512);
        assert_eq!(token.space_name, "spc");
        std::fs::remove_file(&disk.path).unwrap();
    }

    #[tokio::test]
    async fn init_write_clear_reserves_area() {
        let disk = temp_disk("px-clear", ALIGN);
        let mut token = test_token(&disk, 1, 1);
        init(&mut token, 2, true).await.unwrap();

        let registry = SpaceRegistry::new();
        let cancel = CancellationToken::new();
        let res = acquire(&mut token, &registry, 0, 0, 0, &cancel).await;
        assert_eq!(res.unwrap_err(), Error::LeaderMagic);
        std::fs::remove_file(&disk.path).unwrap();
    }

    #[tokio::test]
    async fn request_record_round_trip() {
        let disk = init_resource("px-req", 2).await;
        let token = test_token(&disk, 1, 1);

        let initial = request_read(&token).await.unwrap();
        assert_eq!(initial.magic, REQ_DISK_MAGIC);
        assert_eq!(initial.lver, 0);

        let mut rr = initial;
        rr.lver = 9;
        rr.force_mode = 1;
        request_write(&token, &mut rr).await.unwrap();
        let back = request_read(&token).await.unwrap();
        assert_eq!(back.lver, 9);
        assert_eq!(back.force_mode, 1);
        std::fs::remove_file(&disk.path).unwrap();
    }

    #[tokio::test]
    async fn checksum_corruption_is_detected() {
        let disk = init_resource("px-corrupt", 2).await;
        let token = test_token(&disk, 1, 1);

        // flip a byte inside the leader's owner_id field
        let mut buf = diskio::read_sectors(&disk, 512, 0, 1, FAST.io_timeout_duration())
            .await
            .unwrap();
        buf.as_mut_slice()[33] ^= 0xFF;
        let corrupted = buf.as_slice()[..512].to_vec();
        diskio::write_sector(&disk, 512, 0, &corrupted, FAST.io_timeout_duration())
            .await
            .unwrap();

        let res = leader_read(&token).await;
        assert_eq!(res.unwrap_err(), Error::LeaderChecksum);
        std::fs::remove_file(&disk.path).unwrap();
    }
}
