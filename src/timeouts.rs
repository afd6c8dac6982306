// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Timing table derived from a per-lockspace io_timeout.
//!
//! Every bound in the fencing argument is a fixed multiple of the one
//! tunable, the io_timeout `T` of the lockspace disk. A host that cannot
//! renew for `renewal_fail` seconds stops feeding its watchdog; peers wait
//! `host_dead` seconds from the last observed renewal before stealing, by
//! which time the watchdog has reset the host.

use std::time::Duration;

/// Default io_timeout in seconds when none is configured.
pub const DEFAULT_IO_TIMEOUT_SECONDS: u32 = 10;

/// Target period between delta renewals, as a multiple of io_timeout.
const RENEWAL_MULT: u32 = 1;
/// Seconds without successful renewal before the lockspace goes WARN.
const RENEWAL_WARN_MULT: u32 = 8;
/// Seconds without successful renewal before the lockspace self-fences.
const RENEWAL_FAIL_MULT: u32 = 40;
/// Seconds after which peers may assume a silent host is dead.
const HOST_ID_TIMEOUT_MULT: u32 = 80;
/// Extra margin on top of the host timeout before a slot may be stolen.
const SAFETY_MARGIN_MULT: u32 = 2;

/// All timing constants of one lockspace, in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// Per-operation disk I/O timeout.
    pub io_timeout: u32,
    /// Target period between delta renewals.
    pub renewal: u32,
    /// Renewal-failure age at which the lockspace is flagged WARN.
    pub renewal_warn: u32,
    /// Renewal-failure age at which the host self-fences.
    pub renewal_fail: u32,
    /// Age at which peers may consider this host dead.
    pub host_id_timeout: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::from_io_timeout(DEFAULT_IO_TIMEOUT_SECONDS)
    }
}

impl Timeouts {
    /// Derives the full table from one io_timeout.
    ///
    /// An io_timeout of zero falls back to the default; a zero table would
    /// make every renewal instantly fatal.
    #[must_use]
    pub const fn from_io_timeout(io_timeout: u32) -> Self {
        let t = if io_timeout == 0 {
            DEFAULT_IO_TIMEOUT_SECONDS
        } else {
            io_timeout
        };
        Self {
            io_timeout: t,
            renewal: t * RENEWAL_MULT,
            renewal_warn: t * RENEWAL_WARN_MULT,
            renewal_fail: t * RENEWAL_FAIL_MULT,
            host_id_timeout: t * HOST_ID_TIMEOUT_MULT,
        }
    }

    /// Seconds after which a peer that stopped renewing may be declared
    /// dead and its leases stolen. Strictly larger than the host timeout.
    #[must_use]
    pub const fn host_dead_seconds(&self) -> u64 {
        (self.host_id_timeout + self.io_timeout * SAFETY_MARGIN_MULT) as u64
    }

    /// io_timeout as a [`Duration`] for disk ops.
    #[must_use]
    pub const fn io_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.io_timeout as u64)
    }
}

/// Computes the dead bound for an arbitrary peer io_timeout, as read from
/// that peer's delta record.
#[must_use]
pub const fn host_dead_seconds_for(io_timeout: u32) -> u64 {
    Timeouts::from_io_timeout(io_timeout).host_dead_seconds()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_from_io_timeout() {
        let t = Timeouts::from_io_timeout(10);
        assert_eq!(t.renewal, 10);
        assert_eq!(t.renewal_warn, 80);
        assert_eq!(t.renewal_fail, 400);
        assert_eq!(t.host_id_timeout, 800);
        assert_eq!(t.host_dead_seconds(), 820);
    }

    #[test]
    fn zero_falls_back_to_default() {
        let t = Timeouts::from_io_timeout(0);
        assert_eq!(t.io_timeout, DEFAULT_IO_TIMEOUT_SECONDS);
    }

    #[test]
    fn fencing_order() {
        // self-fence must come well before peers may steal
        for io in [1, 2, 10, 20] {
            let t = Timeouts::from_io_timeout(io);
            assert!(t.renewal < t.renewal_warn);
            assert!(t.renewal_warn < t.renewal_fail);
            assert!((t.renewal_fail as u64) * 2 <= t.host_dead_seconds());
        }
    }
}
