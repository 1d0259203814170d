// Copyright (c) 2024 Botho Foundation

//! Picks built circuits for traffic.
//!
//! Candidates are shuffled uniformly before being handed out. Always
//! returning the same circuits would concentrate traffic and make reuse
//! patterns observable, so the order must stay random.

use rand::seq::SliceRandom;
use tracing::{debug, trace};

use crate::{
    pool::TunnelPool,
    record::TunnelRecord,
    types::{TunnelId, TunnelKind},
};

/// What the caller needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionCriteria {
    /// Number of circuits wanted.
    pub minimum_required: usize,
    /// Circuits that must not be returned.
    pub exclude: Vec<TunnelId>,
    /// Only return circuits with at least this many remote hops.
    pub min_remote_hops: usize,
}

impl SelectionCriteria {
    pub fn new(minimum_required: usize) -> Self {
        Self {
            minimum_required,
            ..Default::default()
        }
    }

    pub fn excluding(mut self, ids: impl IntoIterator<Item = TunnelId>) -> Self {
        self.exclude.extend(ids);
        self
    }

    pub fn with_min_remote_hops(mut self, hops: usize) -> Self {
        self.min_remote_hops = hops;
        self
    }
}

/// Read-side circuit selection over a [`TunnelPool`].
#[derive(Debug, Clone, Copy)]
pub struct TunnelSelector {
    safety_margin_ms: u64,
}

impl TunnelSelector {
    pub fn new(safety_margin_ms: u64) -> Self {
        Self { safety_margin_ms }
    }

    pub fn safety_margin_ms(&self) -> u64 {
        self.safety_margin_ms
    }

    /// Up to `criteria.minimum_required` ready circuits of `kind` with more
    /// than the safety margin left, in random order.
    ///
    /// If too few qualify, the pool is topped up with fallback circuits once
    /// and the filter runs a second and final time.
    pub fn select(
        &self,
        pool: &TunnelPool,
        kind: TunnelKind,
        criteria: &SelectionCriteria,
        now_ms: u64,
    ) -> Vec<TunnelId> {
        if criteria.minimum_required == 0 {
            return Vec::new();
        }

        let mut candidates = self.filter(pool, kind, criteria, now_ms);
        if candidates.len() < criteria.minimum_required {
            debug!(
                kind = %kind,
                found = candidates.len(),
                wanted = criteria.minimum_required,
                "Too few usable circuits, topping up"
            );
            pool.ensure_minimum_fallback_circuits(now_ms);
            candidates = self.filter(pool, kind, criteria, now_ms);
        }

        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(criteria.minimum_required);
        trace!(kind = %kind, selected = candidates.len(), "Selected circuits");
        candidates
    }

    fn filter(
        &self,
        pool: &TunnelPool,
        kind: TunnelKind,
        criteria: &SelectionCriteria,
        now_ms: u64,
    ) -> Vec<TunnelId> {
        pool.candidates(kind)
            .iter()
            .filter(|r| self.is_selectable(r, now_ms))
            .filter(|r| r.remote_hops() >= criteria.min_remote_hops)
            .map(TunnelRecord::id)
            .filter(|id| !criteria.exclude.contains(id))
            .collect()
    }

    fn is_selectable(&self, record: &TunnelRecord, now_ms: u64) -> bool {
        record.is_ready() && record.remaining_ms(now_ms) > self.safety_margin_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pool::test_utils::{insert_built, make_pool},
        record::test_utils::make_record,
    };
    use std::collections::HashSet;

    const HOUR: u64 = 3_600_000;

    #[test]
    fn test_select_skips_almost_expired_and_not_ready() {
        let (_, pool) = make_pool(3);
        let selector = TunnelSelector::new(60_000);
        let good = insert_built(&pool, make_record(TunnelKind::Outbound, 2, HOUR));
        insert_built(&pool, make_record(TunnelKind::Outbound, 2, 30_000));
        let failed = insert_built(&pool, make_record(TunnelKind::Outbound, 2, HOUR));
        pool.mark_failed(&failed, 0);

        let selected = selector.select(&pool, TunnelKind::Outbound, &SelectionCriteria::new(10), 0);
        assert!(selected.contains(&good));
        assert!(!selected.contains(&failed));
        for id in &selected {
            assert!(pool.get(id).unwrap().remaining_ms(0) > 60_000);
        }
    }

    #[test]
    fn test_select_tops_up_when_short() {
        let (_, pool) = make_pool(0);
        let selector = TunnelSelector::new(60_000);

        let selected = selector.select(&pool, TunnelKind::Inbound, &SelectionCriteria::new(2), 0);
        assert_eq!(selected.len(), 2);
        assert_eq!(pool.free_inbound_count(), 3);
    }

    #[test]
    fn test_select_returns_min_of_wanted_and_available() {
        let (_, pool) = make_pool(0);
        let selector = TunnelSelector::new(60_000);
        pool.ensure_minimum_fallback_circuits(0);

        let selected = selector.select(&pool, TunnelKind::Outbound, &SelectionCriteria::new(5), 0);
        assert_eq!(selected.len(), 3);
        assert_eq!(selected.iter().collect::<HashSet<_>>().len(), 3);
    }

    #[test]
    fn test_select_respects_exclude_and_depth() {
        let (_, pool) = make_pool(0);
        let selector = TunnelSelector::new(60_000);
        let deep = insert_built(&pool, make_record(TunnelKind::Inbound, 2, HOUR));
        let other = insert_built(&pool, make_record(TunnelKind::Inbound, 2, HOUR));

        let criteria = SelectionCriteria::new(5)
            .excluding([other])
            .with_min_remote_hops(1);
        let selected = selector.select(&pool, TunnelKind::Inbound, &criteria, 0);
        assert_eq!(selected, vec![deep]);
    }

    #[test]
    fn test_select_order_is_random() {
        let (_, pool) = make_pool(0);
        let selector = TunnelSelector::new(60_000);
        for _ in 0..8 {
            insert_built(&pool, make_record(TunnelKind::Outbound, 1, HOUR));
        }

        let firsts: HashSet<TunnelId> = (0..50)
            .map(|_| selector.select(&pool, TunnelKind::Outbound, &SelectionCriteria::new(8), 0)[0])
            .collect();
        assert!(firsts.len() > 1);
    }
}
