//! Least-active selection: prefer the endpoint with the fewest in-flight
//! calls, weighted-random among ties.
//!
//! Selection counts as the start of a call; the cluster strategies report
//! the end through the [`LoadBalance::finish`] hook once the call resolves.
//! Missed completions only bias the counter upward, they never wedge
//! selection.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use dashmap::DashMap;
use faststr::FastStr;
use rand::Rng;

use super::{effective_weight, LoadBalance};
use crate::{endpoint::Endpoint, invocation::Invocation, url::Url};

pub struct LeastActiveBalance {
    active: DashMap<FastStr, Arc<AtomicU64>>,
}

impl Default for LeastActiveBalance {
    fn default() -> Self {
        Self {
            active: DashMap::new(),
        }
    }
}

impl LeastActiveBalance {
    pub fn new() -> Self {
        Self::default()
    }

    fn in_flight(&self, endpoint: &Url) -> u64 {
        self.active
            .get(endpoint.identity().as_str())
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl LoadBalance for LeastActiveBalance {
    fn do_select(
        &self,
        endpoints: &[Arc<dyn Endpoint>],
        _url: &Url,
        invocation: &Invocation,
    ) -> Option<Arc<dyn Endpoint>> {
        let mut least = u64::MAX;
        let mut least_indexes: Vec<usize> = Vec::new();
        let mut weights = vec![0u64; endpoints.len()];
        let mut least_total = 0u64;
        for (index, endpoint) in endpoints.iter().enumerate() {
            let active = self.in_flight(endpoint.url());
            let weight = effective_weight(endpoint.url(), invocation);
            weights[index] = weight;
            if active < least {
                least = active;
                least_indexes.clear();
                least_indexes.push(index);
                least_total = weight;
            } else if active == least {
                least_indexes.push(index);
                least_total += weight;
            }
        }

        let chosen = if least_indexes.len() == 1 {
            least_indexes[0]
        } else {
            let mut rng = rand::rng();
            let uniform = least_indexes
                .iter()
                .all(|&i| weights[i] == weights[least_indexes[0]]);
            if least_total > 0 && !uniform {
                let mut offset = rng.random_range(0..least_total);
                let mut pick = least_indexes[least_indexes.len() - 1];
                for &index in &least_indexes {
                    if offset < weights[index] {
                        pick = index;
                        break;
                    }
                    offset -= weights[index];
                }
                pick
            } else {
                least_indexes[rng.random_range(0..least_indexes.len())]
            }
        };

        let endpoint = endpoints.get(chosen)?.clone();
        self.active
            .entry(endpoint.url().identity())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
        Some(endpoint)
    }

    fn finish(&self, endpoint: &Url) {
        if let Some(counter) = self.active.get(endpoint.identity().as_str()) {
            let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                v.checked_sub(1)
            });
        }
    }
}
