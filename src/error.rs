// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Closed error taxonomy shared by all lease engines.
//!
//! Engine functions never log-and-swallow; they return one of these codes
//! and the caller decides. Policy outcomes (e.g. [`Error::AcquireIdLive`])
//! are expected results of a correct protocol run, not faults.

use thiserror::Error;

/// Errors and protocol outcomes of the lease engines and the daemon.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// A disk operation did not complete within its io_timeout.
    /// The underlying request may still be in flight; its buffer is retained.
    #[error("disk i/o timed out")]
    AioTimeout,
    /// A disk read or write failed outright.
    #[error("disk i/o error: {0}")]
    Io(String),

    /// Leader record carries the wrong (or the cleared) magic number.
    #[error("leader record has wrong magic")]
    LeaderMagic,
    /// Leader record major version is not ours.
    #[error("leader record has wrong version")]
    LeaderVersion,
    /// Leader record names a different lockspace.
    #[error("leader record has wrong lockspace name")]
    LeaderLockspace,
    /// Leader record names a different resource.
    #[error("leader record has wrong resource name")]
    LeaderResource,
    /// Leader record num_hosts does not cover our host_id.
    #[error("leader record num_hosts too small")]
    LeaderNumHosts,
    /// Leader record checksum mismatch.
    #[error("leader record checksum mismatch")]
    LeaderChecksum,
    /// No leader copy matched on a majority of disks.
    #[error("leader records differ across disks")]
    LeaderDiff,
    /// Leader could not be read from a majority of disks.
    #[error("leader read failed on a majority of disks")]
    LeaderRead,
    /// Leader could not be written to a majority of disks.
    #[error("leader write failed on a majority of disks")]
    LeaderWrite,

    /// Ballot block checksum mismatch.
    #[error("dblock checksum mismatch")]
    DblockChecksum,
    /// Ballot blocks could not be read from a majority of disks.
    #[error("dblock read failed on a majority of disks")]
    DblockRead,
    /// Ballot blocks could not be written to a majority of disks.
    #[error("dblock write failed on a majority of disks")]
    DblockWrite,
    /// A peer ballot block carries a larger lease version; ballot aborted.
    #[error("ballot aborted: larger lver seen")]
    DblockLver,
    /// A peer ballot block carries a larger mbal; ballot aborted.
    #[error("ballot aborted: larger mbal seen")]
    DblockMbal,

    /// The caller pinned a lease version that is no longer current.
    #[error("acquire: lease version is not current")]
    AcquireLver,
    /// The current owner is alive; the lease cannot be taken.
    #[error("acquire: owner is alive")]
    AcquireIdLive,
    /// Another host committed a different owner at our lease version.
    #[error("acquire: lease owned by another host")]
    AcquireOwned,
    /// We propagated and committed another host's pending value.
    #[error("acquire: committed another host as owner")]
    AcquireOther,
    /// Owner liveness unknown and the caller asked not to wait.
    #[error("acquire: owner may be alive, retry later")]
    AcquireOwnedRetry,
    /// The owner's lockspace is not known to this daemon.
    #[error("acquire: lockspace not found for owner check")]
    AcquireLockspace,
    /// The owner's lockspace disk could not be opened.
    #[error("acquire: cannot open lockspace disk")]
    AcquireIdDisk,

    /// Release found a different lease version than the caller last held.
    #[error("release: lease version changed")]
    ReleaseLver,
    /// Release found the lease free or owned by someone else.
    #[error("release: not the owner")]
    ReleaseOwner,

    /// The delta-lease slot was taken while we were acquiring it.
    #[error("delta acquire: slot owned by another host")]
    DeltaBusy,
    /// A delta renewal read back someone else's record.
    #[error("delta renew: slot no longer ours")]
    DeltaStolen,

    /// One long-running command per client.
    #[error("client busy with another command")]
    Busy,
    /// The client's token table is full.
    #[error("no space in client token table")]
    NoSpace,
    /// Request exceeds a fixed limit.
    #[error("request too large")]
    TooBig,
    /// No such pid, lockspace, or resource.
    #[error("not found")]
    NotFound,
    /// A lockspace with this name already exists.
    #[error("lockspace already exists")]
    Exists,
    /// The target pid is not registered with the daemon.
    #[error("target pid not registered")]
    NotRegistered,
    /// The lockspace is being torn down; no new leases in it.
    #[error("lockspace is failing, pids being killed")]
    SpaceKilling,
    /// Malformed or truncated wire message.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Outcomes that a correct run of the protocol is expected to produce.
    ///
    /// These are reported to the caller as results rather than logged as
    /// engine failures.
    #[must_use]
    pub const fn is_expected_outcome(&self) -> bool {
        matches!(
            self,
            Self::AcquireLver
                | Self::AcquireIdLive
                | Self::AcquireOwned
                | Self::AcquireOther
                | Self::AcquireOwnedRetry
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Numeric code reported on the wire and as the process exit status.
///
/// Zero is success; everything else is a stable small positive number so
/// the admin CLI can print it without depending on internal enum layout.
#[must_use]
pub fn wire_code(result: &Result<(), Error>) -> u32 {
    let err = match result {
        Ok(()) => return 0,
        Err(err) => err,
    };
    match err {
        Error::AioTimeout => 1,
        Error::Io(_) => 2,
        Error::LeaderMagic => 10,
        Error::LeaderVersion => 11,
        Error::LeaderLockspace => 12,
        Error::LeaderResource => 13,
        Error::LeaderNumHosts => 14,
        Error::LeaderChecksum => 15,
        Error::LeaderDiff => 16,
        Error::LeaderRead => 17,
        Error::LeaderWrite => 18,
        Error::DblockChecksum => 20,
        Error::DblockRead => 21,
        Error::DblockWrite => 22,
        Error::DblockLver => 23,
        Error::DblockMbal => 24,
        Error::AcquireLver => 30,
        Error::AcquireIdLive => 31,
        Error::AcquireOwned => 32,
        Error::AcquireOther => 33,
        Error::AcquireOwnedRetry => 34,
        Error::AcquireLockspace => 35,
        Error::AcquireIdDisk => 36,
        Error::ReleaseLver => 40,
        Error::ReleaseOwner => 41,
        Error::DeltaBusy => 50,
        Error::DeltaStolen => 51,
        Error::Busy => 60,
        Error::NoSpace => 61,
        Error::TooBig => 62,
        Error::NotFound => 63,
        Error::Exists => 64,
        Error::NotRegistered => 65,
        Error::SpaceKilling => 66,
        Error::Protocol(_) => 67,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_outcomes() {
        assert!(Error::AcquireIdLive.is_expected_outcome());
        assert!(Error::AcquireOwned.is_expected_outcome());
        assert!(!Error::DblockWrite.is_expected_outcome());
        assert!(!Error::AioTimeout.is_expected_outcome());
    }

    #[test]
    fn wire_codes_stable() {
        assert_eq!(wire_code(&Ok(())), 0);
        assert_eq!(wire_code(&Err(Error::AioTimeout)), 1);
        assert_eq!(wire_code(&Err(Error::AcquireIdLive)), 31);
        assert_eq!(wire_code(&Err(Error::Busy)), 60);
    }
}
