//! Fail-safe: one attempt; failures are logged and swallowed, the caller
//! always sees a successful (possibly empty) reply.

use std::sync::Arc;

use futures::future::BoxFuture;

use super::{Cluster, ClusterBase};
use crate::{
    discovery::Directory,
    endpoint::Endpoint,
    error::RpcError,
    extension::ExtensionRegistry,
    invocation::{Invocation, Reply},
    url::Url,
};

pub struct FailsafeCluster {
    registry: ExtensionRegistry,
}

impl FailsafeCluster {
    pub fn new(registry: ExtensionRegistry) -> Self {
        Self { registry }
    }
}

impl Cluster for FailsafeCluster {
    fn join(&self, directory: Arc<dyn Directory>) -> Result<Arc<dyn Endpoint>, RpcError> {
        Ok(Arc::new(FailsafeEndpoint {
            base: ClusterBase::new(self.registry.clone(), directory),
        }))
    }
}

pub struct FailsafeEndpoint {
    base: ClusterBase,
}

impl FailsafeEndpoint {
    async fn dispatch(&self, invocation: &Invocation) -> Result<Reply, RpcError> {
        let (invocation, candidates, balancer) = self.base.prepare(invocation)?;
        let endpoint = self.base.select(&balancer, &invocation, &candidates, &[])?;
        self.base
            .invoke_selected(&balancer, &endpoint, &invocation)
            .await
    }
}

impl Endpoint for FailsafeEndpoint {
    fn url(&self) -> &Url {
        self.base.directory().consumer_url()
    }

    fn is_available(&self) -> bool {
        self.base.directory().is_available()
    }

    fn invoke<'s>(
        &'s self,
        invocation: &'s Invocation,
    ) -> BoxFuture<'s, Result<Reply, RpcError>> {
        Box::pin(async move {
            match self.dispatch(invocation).await {
                Ok(reply) => Ok(reply),
                Err(err) => {
                    tracing::warn!(
                        "[STORMO] fail-safe dispatch of method {} on {} swallowed: {err}",
                        invocation.method(),
                        self.url().path(),
                    );
                    Ok(Reply::empty())
                }
            }
        })
    }

    fn destroy(&self) {
        self.base.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{consumer_url, directory_of};
    use super::FailsafeCluster;
    use crate::{
        cluster::Cluster, error::ErrorKind, invocation::Invocation, testing::MockEndpoint,
    };

    #[tokio::test]
    async fn test_error_becomes_empty_reply() {
        let sick = MockEndpoint::failing("10.0.0.1", 1, ErrorKind::Network);
        let registry = crate::new_registry();
        let directory = directory_of(&registry, consumer_url(), vec![sick.clone() as _]);
        let cluster = FailsafeCluster::new(registry).join(directory).unwrap();

        let reply = cluster.invoke(&Invocation::new("find")).await.unwrap();
        assert!(reply.payload().is_none());
        assert_eq!(sick.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_directory_is_swallowed_too() {
        let registry = crate::new_registry();
        let directory = directory_of(&registry, consumer_url(), Vec::new());
        let cluster = FailsafeCluster::new(registry).join(directory).unwrap();
        assert!(cluster.invoke(&Invocation::new("find")).await.is_ok());
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let healthy = MockEndpoint::ok("10.0.0.1", 1);
        let registry = crate::new_registry();
        let directory = directory_of(&registry, consumer_url(), vec![healthy as _]);
        let cluster = FailsafeCluster::new(registry).join(directory).unwrap();

        let reply = cluster.invoke(&Invocation::new("find")).await.unwrap();
        assert!(reply.payload().is_some());
    }
}
