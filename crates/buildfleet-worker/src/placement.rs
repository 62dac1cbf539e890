// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Placement strategies: tie-breaking among compatible workers.

use buildfleet_registry::WorkerRecord;
use rand::seq::SliceRandom;

/// Orders and filters the pool's compatible-worker set. `order` ranks the
/// candidates; `approve` vetoes individual choices (for limit policies).
pub trait PlacementStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn order(&self, candidates: &mut Vec<WorkerRecord>);

    fn approve(&self, _candidate: &WorkerRecord) -> bool {
        true
    }
}

/// Uniform random choice.
pub struct Random;

impl PlacementStrategy for Random {
    fn name(&self) -> &'static str {
        "random"
    }

    fn order(&self, candidates: &mut Vec<WorkerRecord>) {
        candidates.shuffle(&mut rand::thread_rng());
    }
}

/// Prefers the least loaded worker by active container count.
pub struct FewestActiveContainers;

impl PlacementStrategy for FewestActiveContainers {
    fn name(&self) -> &'static str {
        "fewest-active-containers"
    }

    fn order(&self, candidates: &mut Vec<WorkerRecord>) {
        candidates.sort_by_key(|worker| worker.active_containers);
    }
}

/// Vetoes workers at or above a container count ceiling.
pub struct LimitActiveContainers {
    pub max: i64,
}

impl PlacementStrategy for LimitActiveContainers {
    fn name(&self) -> &'static str {
        "limit-active-containers"
    }

    fn order(&self, _candidates: &mut Vec<WorkerRecord>) {}

    fn approve(&self, candidate: &WorkerRecord) -> bool {
        candidate.active_containers < self.max
    }
}

/// Vetoes workers at or above a volume count ceiling.
pub struct LimitActiveVolumes {
    pub max: i64,
}

impl PlacementStrategy for LimitActiveVolumes {
    fn name(&self) -> &'static str {
        "limit-active-volumes"
    }

    fn order(&self, _candidates: &mut Vec<WorkerRecord>) {}

    fn approve(&self, candidate: &WorkerRecord) -> bool {
        candidate.active_volumes < self.max
    }
}

/// Applies strategies in sequence: later entries order within the ranking of
/// earlier ones (sorts are stable), and any entry may veto a candidate.
pub struct Chained(pub Vec<Box<dyn PlacementStrategy>>);

impl PlacementStrategy for Chained {
    fn name(&self) -> &'static str {
        "chained"
    }

    fn order(&self, candidates: &mut Vec<WorkerRecord>) {
        for strategy in self.0.iter().rev() {
            strategy.order(candidates);
        }
    }

    fn approve(&self, candidate: &WorkerRecord) -> bool {
        self.0.iter().all(|strategy| strategy.approve(candidate))
    }
}
