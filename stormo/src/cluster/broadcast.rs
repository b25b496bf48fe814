//! Broadcast: every endpoint gets the call, sequentially. Used for intents
//! that must reach every instance, e.g. cache invalidation.

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

pub struct BroadcastCluster {
    registry: ExtensionRegistry,
}

impl BroadcastCluster {
    pub fn new(registry: ExtensionRegistry) -> Self {
        Self { registry }
    }
}

impl Cluster for BroadcastCluster {
    fn join(&self, directory: Arc<dyn Directory>) -> Result<Arc<dyn Endpoint>, RpcError> {
        Ok(Arc::new(BroadcastEndpoint {
            base: ClusterBase::new(self.registry.clone(), directory),
        }))
    }
}

pub struct BroadcastEndpoint {
    base: ClusterBase,
}

impl Endpoint for BroadcastEndpoint {
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
            let (invocation, candidates, _balancer) = self.base.prepare(invocation)?;
            let mut last_reply = None;
            let mut first_error: Option<RpcError> = None;
            let mut failed: Vec<Arc<dyn Endpoint>> = Vec::new();
            for endpoint in &candidates {
                match endpoint.invoke(&invocation).await {
                    Ok(reply) => last_reply = Some(reply),
                    Err(err) => {
                        tracing::warn!(
                            "[STORMO] broadcast of method {} to endpoint {} failed: {err}",
                            invocation.method(),
                            endpoint.url().address(),
                        );
                        failed.push(endpoint.clone());
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                    }
                }
            }
            match first_error {
                Some(err) => Err(self.base.exhausted_error(
                    &invocation,
                    &failed,
                    candidates.len(),
                    err,
                )),
                None => Ok(last_reply.unwrap_or_else(Reply::empty)),
            }
        })
    }

    fn destroy(&self) {
        self.base.destroy();
    }
}
