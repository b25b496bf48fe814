//! Fail-fast: one attempt, errors propagate untouched except for context.

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

pub struct FailfastCluster {
    registry: ExtensionRegistry,
}

impl FailfastCluster {
    pub fn new(registry: ExtensionRegistry) -> Self {
        Self { registry }
    }
}

impl Cluster for FailfastCluster {
    fn join(&self, directory: Arc<dyn Directory>) -> Result<Arc<dyn Endpoint>, RpcError> {
        Ok(Arc::new(FailfastEndpoint {
            base: ClusterBase::new(self.registry.clone(), directory),
        }))
    }
}

pub struct FailfastEndpoint {
    base: ClusterBase,
}

impl Endpoint for FailfastEndpoint {
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
            let (invocation, candidates, balancer) = self.base.prepare(invocation)?;
            let endpoint = self.base.select(&balancer, &invocation, &candidates, &[])?;
            let result = self
                .base
                .invoke_selected(&balancer, &endpoint, &invocation)
                .await;
            result.map_err(|err| {
                if err.is_biz() {
                    return err;
                }
                let kind = err.kind();
                RpcError::new(
                    kind,
                    format!(
                        "fail-fast dispatch of method {} to endpoint {} failed: {err}",
                        invocation.method(),
                        endpoint.url().address(),
                    ),
                )
                .with_source(err)
            })
        })
    }

    fn destroy(&self) {
        self.base.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{consumer_url, directory_of};
    use super::FailfastCluster;
    use crate::{
        cluster::Cluster, error::ErrorKind, invocation::Invocation, testing::MockEndpoint,
    };

    #[tokio::test]
    async fn test_single_attempt_no_retry() {
        let sick = MockEndpoint::failing("10.0.0.1", 1, ErrorKind::Network);
        let healthy = MockEndpoint::ok("10.0.0.2", 1);
        let registry = crate::new_registry();
        let directory = directory_of(
            &registry,
            consumer_url(),
            vec![sick.clone() as _, healthy.clone() as _],
        );
        let cluster = FailfastCluster::new(registry).join(directory).unwrap();

        let mut failures = 0;
        for _ in 0..40 {
            if let Err(err) = cluster.invoke(&Invocation::new("find")).await {
                assert_eq!(err.kind(), ErrorKind::Network);
                failures += 1;
            }
        }
        assert!(failures > 0, "random selection never reached the sick endpoint");
        // every failure was surfaced, never papered over by a second attempt
        assert_eq!(sick.calls(), failures);
        assert_eq!(healthy.calls(), 40 - failures);
    }

    #[tokio::test]
    async fn test_error_keeps_kind_and_address() {
        let sick = MockEndpoint::failing("10.0.0.1", 1, ErrorKind::Timeout);
        let registry = crate::new_registry();
        let directory = directory_of(&registry, consumer_url(), vec![sick as _]);
        let cluster = FailfastCluster::new(registry).join(directory).unwrap();

        let err = cluster.invoke(&Invocation::new("find")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.message().contains("10.0.0.1:1"));
    }
}
