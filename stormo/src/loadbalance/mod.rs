//! Choosing one endpoint out of many.
//!
//! Every balancer implements the same `select` contract; the stateful ones
//! (round-robin, least-active, consistent-hash) own their state per
//! `(service, method)` key. Which balancer runs is decided per call by the
//! adaptive dispatcher from the `loadbalance` url parameter.

use std::{
    sync::Arc,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use dashmap::DashMap;
use faststr::FastStr;
use once_cell::sync::Lazy;

use crate::{
    endpoint::Endpoint,
    extension::{resolve_adaptive_name, ExtensionRegistry, ManifestProviders, ManifestTier},
    invocation::Invocation,
    url::Url,
};

pub mod consistent_hash;
pub mod least_active;
pub mod random;
pub mod round_robin;

pub use consistent_hash::ConsistentHashBalance;
pub use least_active::LeastActiveBalance;
pub use random::WeightedRandomBalance;
pub use round_robin::WeightedRoundRobinBalance;

pub const DEFAULT_LOADBALANCE: &str = "random";

const DEFAULT_WEIGHT: u64 = 100;
const DEFAULT_WARMUP_MS: u64 = 600_000;

pub trait LoadBalance: Send + Sync {
    /// Chooses one endpoint. `None` only when the list is empty or every
    /// candidate weighs nothing the balancer can work with.
    fn select(
        &self,
        endpoints: &[Arc<dyn Endpoint>],
        url: &Url,
        invocation: &Invocation,
    ) -> Option<Arc<dyn Endpoint>> {
        match endpoints {
            [] => None,
            [only] => Some(only.clone()),
            _ => self.do_select(endpoints, url, invocation),
        }
    }

    /// The algorithm proper; called with at least two candidates.
    fn do_select(
        &self,
        endpoints: &[Arc<dyn Endpoint>],
        url: &Url,
        invocation: &Invocation,
    ) -> Option<Arc<dyn Endpoint>>;

    /// Reports that a call on `endpoint`, picked by an earlier `select`, has
    /// finished (successfully or not). Balancers tracking in-flight state
    /// override this; the default does nothing.
    fn finish(&self, _endpoint: &Url) {}
}

/// The configured weight of an endpoint for this call, scaled down linearly
/// while the endpoint is still inside its warm-up window.
pub(crate) fn effective_weight(endpoint: &Url, invocation: &Invocation) -> u64 {
    let weight = endpoint.method_param_u64(invocation.method(), "weight", DEFAULT_WEIGHT);
    if weight == 0 {
        return 0;
    }
    let Some(started) = endpoint.param("timestamp").and_then(|v| v.parse::<u64>().ok()) else {
        return weight;
    };
    let uptime = unix_now_ms().saturating_sub(started);
    let warmup = endpoint.param_u64("warmup", DEFAULT_WARMUP_MS);
    if uptime > 0 && uptime < warmup {
        warmup_weight(uptime, warmup, weight)
    } else {
        weight
    }
}

fn warmup_weight(uptime: u64, warmup: u64, weight: u64) -> u64 {
    let scaled = (uptime as u128 * weight as u128 / warmup as u128) as u64;
    scaled.clamp(1, weight)
}

pub(crate) fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

static MONOTONIC_START: Lazy<Instant> = Lazy::new(Instant::now);

pub(crate) fn monotonic_ms() -> u64 {
    MONOTONIC_START.elapsed().as_millis() as u64
}

/// The `(service, method)` key the stateful balancers scope their state by.
pub(crate) fn method_key(url: &Url, invocation: &Invocation) -> FastStr {
    FastStr::from(format!("{}.{}", url.path(), invocation.method()))
}

/// The dispatching balancer: reads the `loadbalance` parameter per call and
/// forwards to the named implementation, falling back to the default with a
/// one-shot warning when the name does not resolve.
pub struct AdaptiveLoadBalance {
    registry: ExtensionRegistry,
    warned: DashMap<FastStr, ()>,
}

impl AdaptiveLoadBalance {
    pub fn new(registry: ExtensionRegistry) -> Self {
        Self {
            registry,
            warned: DashMap::new(),
        }
    }
}

impl LoadBalance for AdaptiveLoadBalance {
    fn do_select(
        &self,
        endpoints: &[Arc<dyn Endpoint>],
        url: &Url,
        invocation: &Invocation,
    ) -> Option<Arc<dyn Endpoint>> {
        let name = resolve_adaptive_name(
            url,
            Some(invocation),
            &["loadbalance"],
            DEFAULT_LOADBALANCE,
            false,
        );
        let loader = self.registry.load::<dyn LoadBalance>();
        let balancer = match loader.get(&name) {
            Ok(balancer) => balancer,
            Err(err) => {
                if self.warned.insert(name.clone(), ()).is_none() {
                    tracing::warn!(
                        "[STORMO] load balancer {name:?} unavailable, using {DEFAULT_LOADBALANCE:?} instead: {err}"
                    );
                }
                loader.get(DEFAULT_LOADBALANCE).ok()?
            }
        };
        balancer.select(endpoints, url, invocation)
    }

    fn finish(&self, endpoint: &Url) {
        // completions carry no invocation, so only the endpoint's own
        // parameters can name the balancer that picked it
        let name = endpoint.param_or("loadbalance", DEFAULT_LOADBALANCE);
        if let Ok(balancer) = self.registry.load::<dyn LoadBalance>().get(name) {
            balancer.finish(endpoint);
        }
    }
}

const MANIFEST: &str = "\
# builtin load balancers
random=loadbalance::WeightedRandomBalance
roundrobin=loadbalance::WeightedRoundRobinBalance
leastactive=loadbalance::LeastActiveBalance
consistenthash=loadbalance::ConsistentHashBalance
adaptive=loadbalance::AdaptiveLoadBalance
";

pub(crate) fn install(registry: &ExtensionRegistry) {
    let loader = registry.load::<dyn LoadBalance>();
    let providers = ManifestProviders::new()
        .plain("loadbalance::WeightedRandomBalance", |_| {
            Arc::new(WeightedRandomBalance::new()) as Arc<dyn LoadBalance>
        })
        .plain("loadbalance::WeightedRoundRobinBalance", |_| {
            Arc::new(WeightedRoundRobinBalance::new()) as Arc<dyn LoadBalance>
        })
        .plain("loadbalance::LeastActiveBalance", |_| {
            Arc::new(LeastActiveBalance::new()) as Arc<dyn LoadBalance>
        })
        .plain("loadbalance::ConsistentHashBalance", |_| {
            Arc::new(ConsistentHashBalance::new()) as Arc<dyn LoadBalance>
        })
        .adaptive("loadbalance::AdaptiveLoadBalance", |registry| {
            Arc::new(AdaptiveLoadBalance::new(registry.clone())) as Arc<dyn LoadBalance>
        });
    if let Err(err) = loader.load_manifest(ManifestTier::Internal, MANIFEST, &providers) {
        tracing::error!("[STORMO] builtin load balancer manifest rejected: {err}");
    }
    loader.set_default(DEFAULT_LOADBALANCE);
}
