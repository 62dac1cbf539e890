// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker version compatibility policy.
//!
//! The exact comparison is scheduling-relevant fleet-wide, so it is kept as
//! a fixed policy rather than re-derived: a worker release-equal to the
//! required version is compatible; an older worker never is; a newer worker
//! is compatible only while its leading release component still matches.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Dotted numeric release version, e.g. `2.3.1`. Missing components compare
/// as zero, so `2.3` equals `2.3.0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    components: Vec<u64>,
}

impl Version {
    pub fn leading(&self) -> u64 {
        self.components.first().copied().unwrap_or(0)
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let components = raw
            .split('.')
            .map(|part| {
                part.parse::<u64>()
                    .map_err(|_| format!("invalid version component '{part}' in '{raw}'"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if components.is_empty() {
            return Err(format!("empty version string '{raw}'"));
        }
        Ok(Self { components })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .components
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(".");
        f.write_str(&rendered)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        for i in 0..len {
            let mine = self.components.get(i).copied().unwrap_or(0);
            let theirs = other.components.get(i).copied().unwrap_or(0);
            match mine.cmp(&theirs) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

/// Whether a worker reporting `worker_version` may serve a pool requiring
/// `required`. Workers reporting no version at all are incompatible.
pub fn is_compatible(worker_version: Option<&str>, required: &Version) -> bool {
    let Some(raw) = worker_version else {
        return false;
    };
    let Ok(version) = raw.parse::<Version>() else {
        return false;
    };
    match version.cmp(required) {
        Ordering::Equal => true,
        Ordering::Less => false,
        Ordering::Greater => version.leading() == required.leading(),
    }
}
