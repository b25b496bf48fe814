//! Fault-tolerance strategies over a directory of endpoints.
//!
//! A [`Cluster`] joins a [`Directory`] into one virtual [`Endpoint`]; which
//! strategy runs is picked by the `cluster` url parameter. All strategies
//! share the sticky-aware selection logic of [`ClusterBase`] and differ only
//! in how they compose retries, parallelism and error handling around it.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use faststr::FastStr;

use crate::{
    discovery::Directory,
    endpoint::Endpoint,
    error::RpcError,
    extension::{resolve_adaptive_name, ExtensionRegistry, ManifestProviders, ManifestTier},
    invocation::{Invocation, Reply},
    loadbalance::{LoadBalance, DEFAULT_LOADBALANCE},
};

pub mod broadcast;
pub mod failback;
pub mod failfast;
pub mod failover;
pub mod failsafe;
pub mod forking;

pub use broadcast::BroadcastCluster;
pub use failback::FailbackCluster;
pub use failfast::FailfastCluster;
pub use failover::FailoverCluster;
pub use failsafe::FailsafeCluster;
pub use forking::ForkingCluster;

pub const DEFAULT_CLUSTER: &str = "failover";

/// Builds the virtual endpoint of one strategy over a directory.
pub trait Cluster: Send + Sync {
    fn join(&self, directory: Arc<dyn Directory>) -> Result<Arc<dyn Endpoint>, RpcError>;
}

struct StickyPick(Arc<dyn Endpoint>);

/// State and selection logic shared by every strategy.
pub(crate) struct ClusterBase {
    registry: ExtensionRegistry,
    directory: Arc<dyn Directory>,
    availablecheck: bool,
    sticky: ArcSwapOption<StickyPick>,
    destroyed: AtomicBool,
}

fn contains(list: &[Arc<dyn Endpoint>], endpoint: &Arc<dyn Endpoint>) -> bool {
    list.iter().any(|e| Arc::ptr_eq(e, endpoint))
}

impl ClusterBase {
    pub(crate) fn new(registry: ExtensionRegistry, directory: Arc<dyn Directory>) -> Self {
        let availablecheck = directory
            .consumer_url()
            .param_bool("cluster.availablecheck", true);
        Self {
            registry,
            directory,
            availablecheck,
            sticky: ArcSwapOption::empty(),
            destroyed: AtomicBool::new(false),
        }
    }

    pub(crate) fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub(crate) fn check_destroyed(&self) -> Result<(), RpcError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(RpcError::unknown(format!(
                "cluster endpoint for {} is already destroyed, dispatch rejected",
                self.directory.consumer_url().path()
            )));
        }
        Ok(())
    }

    pub(crate) fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            self.sticky.store(None);
            self.directory.destroy();
        }
    }

    fn no_provider_error(&self, invocation: &Invocation) -> RpcError {
        let consumer = self.directory.consumer_url();
        RpcError::no_provider(format!(
            "no provider available for service {} (version {}) method {}, registry {}, consumer {}",
            consumer.path(),
            consumer.param_or("version", "0.0.0"),
            invocation.method(),
            consumer.param_or("registry", "-"),
            consumer.address(),
        ))
    }

    /// The routed candidate list for `invocation`; empty lists are promoted
    /// to a `NoProvider` error before any endpoint is contacted.
    pub(crate) fn list(&self, invocation: &Invocation) -> Result<Vec<Arc<dyn Endpoint>>, RpcError> {
        let endpoints = self.directory.list(invocation)?;
        if endpoints.is_empty() {
            return Err(self.no_provider_error(invocation));
        }
        Ok(endpoints)
    }

    /// The balancer named by the candidates' `loadbalance` parameter.
    pub(crate) fn balancer(
        &self,
        candidates: &[Arc<dyn Endpoint>],
        invocation: &Invocation,
    ) -> Result<Arc<dyn LoadBalance>, RpcError> {
        let name = match candidates.first() {
            Some(endpoint) => endpoint
                .url()
                .method_param_or(invocation.method(), "loadbalance", DEFAULT_LOADBALANCE)
                .to_string(),
            None => DEFAULT_LOADBALANCE.to_string(),
        };
        Ok(self.registry.load::<dyn LoadBalance>().get(name)?)
    }

    /// The shared `invoke` preamble: reject destroyed clusters, bind ambient
    /// attachments, list and pick the balancer.
    pub(crate) fn prepare(
        &self,
        invocation: &Invocation,
    ) -> Result<(Invocation, Vec<Arc<dyn Endpoint>>, Arc<dyn LoadBalance>), RpcError> {
        self.check_destroyed()?;
        let mut invocation = invocation.clone();
        invocation.bind_ambient();
        let candidates = self.list(&invocation)?;
        let balancer = self.balancer(&candidates, &invocation)?;
        Ok((invocation, candidates, balancer))
    }

    /// Sticky-aware selection of one endpoint out of `candidates`, avoiding
    /// the `tried` set.
    pub(crate) fn select(
        &self,
        balancer: &Arc<dyn LoadBalance>,
        invocation: &Invocation,
        candidates: &[Arc<dyn Endpoint>],
        tried: &[Arc<dyn Endpoint>],
    ) -> Result<Arc<dyn Endpoint>, RpcError> {
        let Some(first) = candidates.first() else {
            return Err(self.no_provider_error(invocation));
        };
        let sticky_on = first
            .url()
            .method_param_bool(invocation.method(), "sticky", false);

        // a cached pick that fell out of the directory is dropped eagerly
        if let Some(cached) = self.sticky.load_full() {
            if !contains(candidates, &cached.0) {
                self.sticky.store(None);
            }
        }
        if sticky_on {
            if let Some(cached) = self.sticky.load_full() {
                if contains(candidates, &cached.0)
                    && !contains(tried, &cached.0)
                    && (!self.availablecheck || cached.0.is_available())
                {
                    return Ok(cached.0.clone());
                }
            }
        }

        let picked = self.do_select(balancer, invocation, candidates, tried)?;
        if sticky_on {
            self.sticky.store(Some(Arc::new(StickyPick(picked.clone()))));
        }
        Ok(picked)
    }

    /// Selection without the sticky cache: no reads, no writes. This is what
    /// the forking fan-out uses, where a single-endpoint affinity makes no
    /// sense and must not be clobbered per child.
    pub(crate) fn do_select(
        &self,
        balancer: &Arc<dyn LoadBalance>,
        invocation: &Invocation,
        candidates: &[Arc<dyn Endpoint>],
        tried: &[Arc<dyn Endpoint>],
    ) -> Result<Arc<dyn Endpoint>, RpcError> {
        if candidates.len() == 1 {
            return Ok(candidates[0].clone());
        }
        let consumer = self.directory.consumer_url();
        let mut picked = balancer
            .select(candidates, consumer, invocation)
            .ok_or_else(|| self.no_provider_error(invocation))?;

        if contains(tried, &picked) || (self.availablecheck && !picked.is_available()) {
            match self.reselect(balancer, invocation, candidates, tried) {
                Some(better) => picked = better,
                None => {
                    // walk one step past the rejected pick
                    let index = candidates
                        .iter()
                        .position(|c| Arc::ptr_eq(c, &picked))
                        .unwrap_or(0);
                    picked = candidates[(index + 1) % candidates.len()].clone();
                }
            }
        }
        Ok(picked)
    }

    /// A second pass over candidates not yet tried and passing the
    /// availability check; when that pool is dry, over tried endpoints that
    /// have come back.
    fn reselect(
        &self,
        balancer: &Arc<dyn LoadBalance>,
        invocation: &Invocation,
        candidates: &[Arc<dyn Endpoint>],
        tried: &[Arc<dyn Endpoint>],
    ) -> Option<Arc<dyn Endpoint>> {
        let consumer = self.directory.consumer_url();
        let fresh: Vec<Arc<dyn Endpoint>> = candidates
            .iter()
            .filter(|c| !contains(tried, c) && (!self.availablecheck || c.is_available()))
            .cloned()
            .collect();
        if !fresh.is_empty() {
            return balancer.select(&fresh, consumer, invocation);
        }
        let recovered: Vec<Arc<dyn Endpoint>> = tried
            .iter()
            .filter(|t| t.is_available() && contains(candidates, t))
            .cloned()
            .collect();
        if recovered.is_empty() {
            return None;
        }
        balancer.select(&recovered, consumer, invocation)
    }

    /// Runs the call on a selected endpoint and reports its completion back
    /// to the balancer, so in-flight accounting drains whether the call
    /// succeeded or not.
    pub(crate) async fn invoke_selected(
        &self,
        balancer: &Arc<dyn LoadBalance>,
        endpoint: &Arc<dyn Endpoint>,
        invocation: &Invocation,
    ) -> Result<Reply, RpcError> {
        let result = endpoint.invoke(invocation).await;
        balancer.finish(endpoint.url());
        result
    }

    #[cfg(test)]
    pub(crate) fn cached_sticky(&self) -> Option<Arc<dyn Endpoint>> {
        self.sticky.load_full().map(|pick| pick.0.clone())
    }

    /// The aggregated failure thrown once a strategy gives up, naming every
    /// tried endpoint and keeping the last error as the cause.
    pub(crate) fn exhausted_error(
        &self,
        invocation: &Invocation,
        tried: &[Arc<dyn Endpoint>],
        attempts: usize,
        last: RpcError,
    ) -> RpcError {
        let consumer = self.directory.consumer_url();
        let addresses: Vec<String> = tried.iter().map(|e| e.url().address()).collect();
        RpcError::new(
            last.kind(),
            format!(
                "failed to invoke method {} on service {} (version {}) after {} attempt(s), \
                 tried [{}], registry {}, consumer {}, last error: {}",
                invocation.method(),
                consumer.path(),
                consumer.param_or("version", "0.0.0"),
                attempts,
                addresses.join(", "),
                consumer.param_or("registry", "-"),
                consumer.address(),
                last,
            ),
        )
        .with_source(last)
    }
}

/// The dispatching cluster: resolves the strategy named by the consumer's
/// `cluster` parameter and joins through it.
pub struct AdaptiveCluster {
    registry: ExtensionRegistry,
    warned: DashMap<FastStr, ()>,
}

impl AdaptiveCluster {
    pub fn new(registry: ExtensionRegistry) -> Self {
        Self {
            registry,
            warned: DashMap::new(),
        }
    }
}

impl Cluster for AdaptiveCluster {
    fn join(&self, directory: Arc<dyn Directory>) -> Result<Arc<dyn Endpoint>, RpcError> {
        let name = resolve_adaptive_name(
            directory.consumer_url(),
            None,
            &["cluster"],
            DEFAULT_CLUSTER,
            false,
        );
        let loader = self.registry.load::<dyn Cluster>();
        match loader.get(&name) {
            Ok(cluster) => cluster.join(directory),
            Err(err) => {
                if self.warned.insert(name.clone(), ()).is_none() {
                    tracing::warn!(
                        "[STORMO] cluster strategy {name:?} unavailable, using {DEFAULT_CLUSTER:?} instead: {err}"
                    );
                }
                self.registry
                    .load::<dyn Cluster>()
                    .get(DEFAULT_CLUSTER)?
                    .join(directory)
            }
        }
    }
}

const MANIFEST: &str = "\
# builtin cluster strategies
failover=cluster::FailoverCluster
failfast=cluster::FailfastCluster
failsafe=cluster::FailsafeCluster
failback=cluster::FailbackCluster
forking=cluster::ForkingCluster
broadcast=cluster::BroadcastCluster
adaptive=cluster::AdaptiveCluster
";

pub(crate) fn install(registry: &ExtensionRegistry) {
    let loader = registry.load::<dyn Cluster>();
    let providers = ManifestProviders::new()
        .plain("cluster::FailoverCluster", |registry| {
            Arc::new(FailoverCluster::new(registry.clone())) as Arc<dyn Cluster>
        })
        .plain("cluster::FailfastCluster", |registry| {
            Arc::new(FailfastCluster::new(registry.clone())) as Arc<dyn Cluster>
        })
        .plain("cluster::FailsafeCluster", |registry| {
            Arc::new(FailsafeCluster::new(registry.clone())) as Arc<dyn Cluster>
        })
        .plain("cluster::FailbackCluster", |registry| {
            Arc::new(FailbackCluster::new(registry.clone())) as Arc<dyn Cluster>
        })
        .plain("cluster::ForkingCluster", |registry| {
            Arc::new(ForkingCluster::new(registry.clone())) as Arc<dyn Cluster>
        })
        .plain("cluster::BroadcastCluster", |registry| {
            Arc::new(BroadcastCluster::new(registry.clone())) as Arc<dyn Cluster>
        })
        .adaptive("cluster::AdaptiveCluster", |registry| {
            Arc::new(AdaptiveCluster::new(registry.clone())) as Arc<dyn Cluster>
        });
    if let Err(err) = loader.load_manifest(ManifestTier::Internal, MANIFEST, &providers) {
        tracing::error!("[STORMO] builtin cluster manifest rejected: {err}");
    }
    loader.set_default(DEFAULT_CLUSTER);
}
