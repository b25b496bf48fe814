#![cfg_attr(not(doctest), doc = include_str!("../README.md"))]

use std::sync::Arc;

pub mod cluster;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod extension;
pub mod invocation;
pub mod loadbalance;
pub mod route;
pub mod url;

#[cfg(test)]
pub(crate) mod testing;

pub use faststr::FastStr;
pub use metainfo::METAINFO;
use once_cell::sync::Lazy;

use crate::{
    cluster::Cluster, discovery::Directory, endpoint::Endpoint, error::RpcError,
    extension::ExtensionRegistry,
};

/// A fresh registry with every builtin strategy, balancer and router factory
/// installed.
pub fn new_registry() -> ExtensionRegistry {
    let registry = ExtensionRegistry::new();
    loadbalance::install(&registry);
    route::install(&registry);
    cluster::install(&registry);
    registry
}

/// The process-wide registry most callers share.
pub fn registry() -> &'static ExtensionRegistry {
    static GLOBAL: Lazy<ExtensionRegistry> = Lazy::new(new_registry);
    &GLOBAL
}

/// Joins `directory` into one virtual endpoint, using the strategy named by
/// the consumer url's `cluster` parameter.
pub fn join_cluster(
    registry: &ExtensionRegistry,
    directory: Arc<dyn Directory>,
) -> Result<Arc<dyn Endpoint>, RpcError> {
    registry.load::<dyn Cluster>().get_adaptive()?.join(directory)
}

/// stormo::spawn will spawn a task and derive the metainfo
pub fn spawn<T>(future: T) -> tokio::task::JoinHandle<T::Output>
where
    T: futures::Future + Send + 'static,
    T::Output: Send + 'static,
{
    let mi = METAINFO
        .try_with(|m| {
            let prev_mi = m.take();
            let (m1, m2) = prev_mi.derive();
            m.replace(m1);
            m2
        })
        .unwrap_or_else(|_| metainfo::MetaInfo::new());

    tokio::spawn(METAINFO.scope(std::cell::RefCell::new(mi), future))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        cluster::Cluster,
        discovery::SnapshotDirectory,
        endpoint::Endpoint,
        invocation::Invocation,
        testing::{self, MockEndpoint},
        url::Url,
    };

    #[tokio::test]
    async fn test_join_cluster_by_url_parameter() {
        let registry = crate::new_registry();
        let consumer = Url::new("stormo", "10.0.0.200", 0)
            .with_path("com.foo.BarService")
            .with_param("cluster", "failfast");
        let endpoints: Vec<Arc<dyn Endpoint>> = vec![MockEndpoint::ok("10.0.0.1", 1) as _];
        let directory =
            SnapshotDirectory::new(&registry, consumer, endpoints, Vec::new()).unwrap();

        let cluster = crate::join_cluster(&registry, directory).unwrap();
        let reply = cluster.invoke(&Invocation::new("find")).await.unwrap();
        assert_eq!(testing::replied_by(&reply), "10.0.0.1:1");
    }

    #[tokio::test]
    async fn test_unknown_cluster_falls_back_to_default() {
        let registry = crate::new_registry();
        let consumer = Url::new("stormo", "10.0.0.200", 0)
            .with_path("com.foo.BarService")
            .with_param("cluster", "no-such-strategy");
        let endpoints: Vec<Arc<dyn Endpoint>> = vec![MockEndpoint::ok("10.0.0.1", 1) as _];
        let directory =
            SnapshotDirectory::new(&registry, consumer, endpoints, Vec::new()).unwrap();
        assert!(crate::join_cluster(&registry, directory).is_ok());
    }

    #[tokio::test]
    async fn test_global_registry_resolves_builtins() {
        let registry = crate::registry();
        assert!(registry
            .load::<dyn Cluster>()
            .get("broadcast")
            .is_ok());
    }
}
