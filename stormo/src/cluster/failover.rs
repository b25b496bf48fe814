//! Fail-over: retry transparently on another endpoint until the budget is
//! spent. Business errors are a valid outcome of the call and return
//! immediately.

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

const DEFAULT_RETRIES: u64 = 2;

pub struct FailoverCluster {
    registry: ExtensionRegistry,
}

impl FailoverCluster {
    pub fn new(registry: ExtensionRegistry) -> Self {
        Self { registry }
    }
}

impl Cluster for FailoverCluster {
    fn join(&self, directory: Arc<dyn Directory>) -> Result<Arc<dyn Endpoint>, RpcError> {
        Ok(Arc::new(FailoverEndpoint {
            base: ClusterBase::new(self.registry.clone(), directory),
        }))
    }
}

pub struct FailoverEndpoint {
    base: ClusterBase,
}

impl Endpoint for FailoverEndpoint {
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
            let (invocation, mut candidates, balancer) = self.base.prepare(invocation)?;
            let attempts = self
                .url()
                .method_param_u64(invocation.method(), "retries", DEFAULT_RETRIES)
                .saturating_add(1)
                .max(1) as usize;

            let mut tried: Vec<Arc<dyn Endpoint>> = Vec::with_capacity(attempts);
            let mut last_error: Option<RpcError> = None;
            for attempt in 0..attempts {
                if attempt > 0 {
                    self.base.check_destroyed()?;
                    // membership may have churned between attempts; the
                    // tried set stays advisory across the fresh list
                    candidates = self.base.list(&invocation)?;
                }
                let endpoint = self
                    .base
                    .select(&balancer, &invocation, &candidates, &tried)?;
                tried.push(endpoint.clone());
                match self
                    .base
                    .invoke_selected(&balancer, &endpoint, &invocation)
                    .await
                {
                    Ok(reply) => {
                        if attempt > 0 {
                            tracing::warn!(
                                "[STORMO] method {} on {} succeeded on attempt {} after failing endpoints [{}]",
                                invocation.method(),
                                self.url().path(),
                                attempt + 1,
                                tried[..tried.len() - 1]
                                    .iter()
                                    .map(|e| e.url().address())
                                    .collect::<Vec<_>>()
                                    .join(", "),
                            );
                        }
                        return Ok(reply);
                    }
                    Err(err) if err.is_biz() => return Err(err),
                    Err(err) => {
                        tracing::warn!(
                            "[STORMO] attempt {} of method {} on endpoint {} failed: {err}",
                            attempt + 1,
                            invocation.method(),
                            endpoint.url().address(),
                        );
                        last_error = Some(err);
                    }
                }
            }
            let last = last_error
                .unwrap_or_else(|| RpcError::unknown("fail-over spent its budget without a cause"));
            Err(self
                .base
                .exhausted_error(&invocation, &tried, attempts, last))
        })
    }

    fn destroy(&self) {
        self.base.destroy();
    }
}
