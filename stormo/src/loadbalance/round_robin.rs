//! Strict weighted round-robin.
//!
//! Per `(service, method)` key the balancer keeps one node per endpoint
//! identity. A selection round adds every endpoint's effective weight to its
//! node, picks the node with the greatest running weight and subtracts the
//! round total from it, which yields the smooth `n·wᵢ/W ± 1` distribution.
//! Nodes that stop appearing in the candidate list are recycled once they go
//! untouched for a minute.

use std::sync::{
    atomic::{AtomicI64, AtomicU64, Ordering},
    Arc,
};

use dashmap::DashMap;
use faststr::FastStr;

use super::{effective_weight, method_key, monotonic_ms, LoadBalance};
use crate::{endpoint::Endpoint, invocation::Invocation, url::Url};

const RECYCLE_PERIOD_MS: u64 = 60_000;

#[derive(Default)]
struct WeightedNode {
    current: AtomicI64,
    last_update: AtomicU64,
}

#[derive(Default)]
struct MethodNodes {
    nodes: DashMap<FastStr, Arc<WeightedNode>>,
}

pub struct WeightedRoundRobinBalance {
    methods: DashMap<FastStr, Arc<MethodNodes>>,
    recycle_period_ms: u64,
}

impl Default for WeightedRoundRobinBalance {
    fn default() -> Self {
        Self {
            methods: DashMap::new(),
            recycle_period_ms: RECYCLE_PERIOD_MS,
        }
    }
}

impl WeightedRoundRobinBalance {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn with_recycle_period(recycle_period_ms: u64) -> Self {
        Self {
            methods: DashMap::new(),
            recycle_period_ms,
        }
    }

    #[cfg(test)]
    fn node_count(&self, key: &str) -> usize {
        self.methods.get(key).map(|m| m.nodes.len()).unwrap_or(0)
    }
}

impl LoadBalance for WeightedRoundRobinBalance {
    fn do_select(
        &self,
        endpoints: &[Arc<dyn Endpoint>],
        url: &Url,
        invocation: &Invocation,
    ) -> Option<Arc<dyn Endpoint>> {
        let key = method_key(url, invocation);
        let group = self.methods.entry(key).or_default().clone();
        let now = monotonic_ms();

        let mut total: i64 = 0;
        let mut best: Option<(i64, usize, Arc<WeightedNode>)> = None;
        for (index, endpoint) in endpoints.iter().enumerate() {
            let weight = effective_weight(endpoint.url(), invocation) as i64;
            let node = group
                .nodes
                .entry(endpoint.url().identity())
                .or_default()
                .clone();
            node.last_update.store(now, Ordering::Relaxed);
            let current = node.current.fetch_add(weight, Ordering::Relaxed) + weight;
            if best.as_ref().map_or(true, |(max, ..)| current > *max) {
                best = Some((current, index, node));
            }
            total += weight;
        }

        if endpoints.len() != group.nodes.len() {
            group.nodes.retain(|_, node| {
                now.saturating_sub(node.last_update.load(Ordering::Relaxed))
                    < self.recycle_period_ms
            });
        }

        let (_, index, node) = best?;
        node.current.fetch_sub(total, Ordering::Relaxed);
        endpoints.get(index).cloned()
    }
}
