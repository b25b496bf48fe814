//! Forking: dispatch to several endpoints at once, first success wins.
//!
//! Children deliver into a channel whose capacity equals the fork count, so
//! a child finishing after the caller has left can never block. Failures are
//! counted and only the last failing child forwards its error, which
//! guarantees that any success reaches the caller first.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use futures::future::BoxFuture;
use tokio::{sync::mpsc, time::Duration};

use super::{Cluster, ClusterBase};
use crate::{
    discovery::Directory,
    endpoint::Endpoint,
    error::RpcError,
    extension::ExtensionRegistry,
    invocation::{Invocation, Reply},
    url::Url,
};

const DEFAULT_FORKS: i64 = 2;
const DEFAULT_TIMEOUT_MS: u64 = 1_000;

pub struct ForkingCluster {
    registry: ExtensionRegistry,
}

impl ForkingCluster {
    pub fn new(registry: ExtensionRegistry) -> Self {
        Self { registry }
    }
}

impl Cluster for ForkingCluster {
    fn join(&self, directory: Arc<dyn Directory>) -> Result<Arc<dyn Endpoint>, RpcError> {
        Ok(Arc::new(ForkingEndpoint {
            base: ClusterBase::new(self.registry.clone(), directory),
        }))
    }
}

pub struct ForkingEndpoint {
    base: ClusterBase,
}

impl Endpoint for ForkingEndpoint {
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
            let forks = self
                .url()
                .method_param_i64(invocation.method(), "forks", DEFAULT_FORKS);
            let timeout_ms = self
                .url()
                .method_param_u64(invocation.method(), "timeout", DEFAULT_TIMEOUT_MS);

            let selected: Vec<Arc<dyn Endpoint>> =
                if forks <= 0 || forks as usize >= candidates.len() {
                    candidates.clone()
                } else {
                    let mut selected = Vec::with_capacity(forks as usize);
                    for _ in 0..forks {
                        // fan-out picks stay off the sticky cache: affinity to
                        // one endpoint means nothing to a parallel dispatch
                        let pick = self
                            .base
                            .do_select(&balancer, &invocation, &candidates, &selected)?;
                        selected.push(pick);
                    }
                    selected
                };

            let total = selected.len();
            let (sender, mut receiver) = mpsc::channel::<Result<Reply, RpcError>>(total);
            let failures = Arc::new(AtomicUsize::new(0));
            for endpoint in &selected {
                let endpoint = endpoint.clone();
                let invocation = invocation.clone();
                let sender = sender.clone();
                let failures = failures.clone();
                let balancer = balancer.clone();
                crate::spawn(async move {
                    let result = endpoint.invoke(&invocation).await;
                    balancer.finish(endpoint.url());
                    match result {
                        Ok(reply) => {
                            let _ = sender.try_send(Ok(reply));
                        }
                        Err(err) => {
                            if failures.fetch_add(1, Ordering::SeqCst) + 1 >= total {
                                let _ = sender.try_send(Err(err));
                            }
                        }
                    }
                });
            }
            drop(sender);

            match tokio::time::timeout(Duration::from_millis(timeout_ms), receiver.recv()).await {
                Ok(Some(Ok(reply))) => Ok(reply),
                Ok(Some(Err(err))) => {
                    Err(self.base.exhausted_error(&invocation, &selected, total, err))
                }
                Ok(None) => Err(RpcError::unknown(
                    "every forked dispatch exited without reporting",
                )),
                Err(_) => Err(RpcError::timeout(format!(
                    "forked dispatch of method {} on {} got no reply within {}ms from [{}]",
                    invocation.method(),
                    self.url().path(),
                    timeout_ms,
                    selected
                        .iter()
                        .map(|e| e.url().address())
                        .collect::<Vec<_>>()
                        .join(", "),
                ))),
            }
        })
    }

    fn destroy(&self) {
        self.base.destroy();
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration, time::Instant};

    use super::super::tests::{consumer_url, directory_of};
    use super::{ForkingCluster, ForkingEndpoint};
    use crate::{
        cluster::{Cluster, ClusterBase},
        endpoint::Endpoint,
        error::ErrorKind,
        invocation::Invocation,
        testing::{self, Behavior, MockEndpoint},
        url::Url,
    };

    fn join(consumer: Url, endpoints: Vec<Arc<dyn Endpoint>>) -> Arc<dyn Endpoint> {
        let registry = crate::new_registry();
        let directory = directory_of(&registry, consumer, endpoints);
        ForkingCluster::new(registry)
            .join(directory)
            .unwrap_or_else(|e| panic!("join failed: {e}"))
    }

    #[tokio::test]
    async fn test_timeout_unblocks_caller() {
        let slow = |host: &str| {
            MockEndpoint::with_behavior(
                testing::test_url(host, 1),
                Behavior::OkAfter(Duration::from_millis(500)),
            )
        };
        let cluster = join(
            consumer_url()
                .with_param("forks", "3")
                .with_param("timeout", "100"),
            vec![
                slow("10.0.0.1") as _,
                slow("10.0.0.2") as _,
                slow("10.0.0.3") as _,
            ],
        );

        let started = Instant::now();
        let err = cluster.invoke(&Invocation::new("find")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        let elapsed = started.elapsed();
        assert!(
            elapsed >= Duration::from_millis(90) && elapsed < Duration::from_millis(400),
            "caller unblocked after {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn test_first_success_wins() {
        let fast = MockEndpoint::with_behavior(
            testing::test_url("10.0.0.1", 1),
            Behavior::OkAfter(Duration::from_millis(10)),
        );
        let failing = MockEndpoint::with_behavior(
            testing::test_url("10.0.0.2", 1),
            Behavior::FailAfter(ErrorKind::Network, Duration::from_millis(20)),
        );
        let sleepy = MockEndpoint::with_behavior(
            testing::test_url("10.0.0.3", 1),
            Behavior::OkAfter(Duration::from_secs(1)),
        );
        let cluster = join(
            consumer_url().with_param("forks", "3"),
            vec![fast as _, failing as _, sleepy as _],
        );

        let reply = cluster.invoke(&Invocation::new("find")).await.unwrap();
        assert_eq!(testing::replied_by(&reply), "10.0.0.1:1");
    }

    #[tokio::test]
    async fn test_all_failures_surface_last_error() {
        let fail = |host: &str| MockEndpoint::failing(host, 1, ErrorKind::Network);
        let a = fail("10.0.0.1");
        let b = fail("10.0.0.2");
        let cluster = join(
            consumer_url().with_param("forks", "2"),
            vec![a.clone() as _, b.clone() as _],
        );

        let err = cluster.invoke(&Invocation::new("find")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(err.message().contains("10.0.0.1:1"));
        assert!(err.message().contains("10.0.0.2:1"));
        assert_eq!(a.calls() + b.calls(), 2);
    }

    #[tokio::test]
    async fn test_forks_bound_parallelism() {
        let eps: Vec<Arc<MockEndpoint>> = (1..=4)
            .map(|i| {
                MockEndpoint::with_behavior(
                    testing::test_url(&format!("10.0.0.{i}"), 1),
                    Behavior::OkAfter(Duration::from_millis(20)),
                )
            })
            .collect();
        let cluster = join(
            consumer_url().with_param("forks", "2"),
            eps.iter().map(|e| e.clone() as Arc<dyn Endpoint>).collect(),
        );

        cluster.invoke(&Invocation::new("find")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let total: usize = eps.iter().map(|e| e.calls()).sum();
        assert_eq!(total, 2, "exactly `forks` children must be dispatched");
    }

    #[tokio::test]
    async fn test_zero_forks_means_everyone() {
        let eps: Vec<Arc<MockEndpoint>> =
            (1..=3).map(|i| MockEndpoint::ok(&format!("10.0.0.{i}"), 1)).collect();
        let cluster = join(
            consumer_url().with_param("forks", "0"),
            eps.iter().map(|e| e.clone() as Arc<dyn Endpoint>).collect(),
        );

        cluster.invoke(&Invocation::new("find")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let total: usize = eps.iter().map(|e| e.calls()).sum();
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn test_fan_out_leaves_sticky_cache_alone() {
        let sticky_endpoint = |host: &str| {
            MockEndpoint::with_url(testing::test_url(host, 1).with_param("sticky", "true"))
        };
        let eps: Vec<Arc<dyn Endpoint>> = vec![
            sticky_endpoint("10.0.0.1") as _,
            sticky_endpoint("10.0.0.2") as _,
            sticky_endpoint("10.0.0.3") as _,
        ];
        let registry = crate::new_registry();
        let directory = directory_of(&registry, consumer_url().with_param("forks", "2"), eps);
        let forking = ForkingEndpoint {
            base: ClusterBase::new(registry, directory),
        };

        forking.invoke(&Invocation::new("find")).await.unwrap();
        // the fan-out picked two of three endpoints, but a later sticky call
        // must not inherit whichever fork happened to be selected last
        assert!(forking.base.cached_sticky().is_none());
    }
}
