//! Fail-back: acknowledge immediately, recover in the background.
//!
//! A failed dispatch is answered with an empty reply and parked in a bounded
//! retry queue served by one background task, which re-dispatches everything
//! it holds every five seconds. When the queue overflows, the oldest intent
//! wins and the newcomer is dropped with a warning.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::MissedTickBehavior,
};

use super::{Cluster, ClusterBase};
use crate::{
    discovery::Directory,
    endpoint::Endpoint,
    error::RpcError,
    extension::ExtensionRegistry,
    invocation::{Invocation, Reply},
    url::Url,
};

const RETRY_PERIOD: Duration = Duration::from_secs(5);
const QUEUE_CAPACITY: usize = 100;
const MAX_REDISPATCHES: u32 = 3;

pub struct FailbackCluster {
    registry: ExtensionRegistry,
}

impl FailbackCluster {
    pub fn new(registry: ExtensionRegistry) -> Self {
        Self { registry }
    }
}

impl Cluster for FailbackCluster {
    fn join(&self, directory: Arc<dyn Directory>) -> Result<Arc<dyn Endpoint>, RpcError> {
        Ok(Arc::new(FailbackEndpoint {
            base: Arc::new(ClusterBase::new(self.registry.clone(), directory)),
            queue: Mutex::new(None),
            worker: Mutex::new(None),
        }))
    }
}

struct RetryTask {
    invocation: Invocation,
    attempts: u32,
}

pub struct FailbackEndpoint {
    base: Arc<ClusterBase>,
    queue: Mutex<Option<mpsc::Sender<RetryTask>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FailbackEndpoint {
    fn enqueue(&self, invocation: Invocation) {
        let sender = {
            let mut queue = self.queue.lock();
            queue
                .get_or_insert_with(|| {
                    let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
                    let worker = tokio::spawn(retry_worker(self.base.clone(), receiver));
                    *self.worker.lock() = Some(worker);
                    sender
                })
                .clone()
        };
        match sender.try_send(RetryTask {
            invocation,
            attempts: 0,
        }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(task)) => {
                tracing::warn!(
                    "[STORMO] fail-back queue is full, dropping retry of method {}",
                    task.invocation.method(),
                );
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                tracing::warn!(
                    "[STORMO] fail-back worker is gone, dropping retry of method {}",
                    task.invocation.method(),
                );
            }
        }
    }
}

async fn redispatch(base: &ClusterBase, invocation: &Invocation) -> Result<Reply, RpcError> {
    base.check_destroyed()?;
    let candidates = base.list(invocation)?;
    let balancer = base.balancer(&candidates, invocation)?;
    let endpoint = base.select(&balancer, invocation, &candidates, &[])?;
    base.invoke_selected(&balancer, &endpoint, invocation).await
}

async fn retry_worker(base: Arc<ClusterBase>, mut receiver: mpsc::Receiver<RetryTask>) {
    let mut pending: VecDeque<RetryTask> = VecDeque::new();
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + RETRY_PERIOD, RETRY_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let mut closed = false;
        loop {
            match receiver.try_recv() {
                Ok(task) => pending.push_back(task),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    closed = true;
                    break;
                }
            }
        }
        let mut kept = VecDeque::new();
        while let Some(mut task) = pending.pop_front() {
            match redispatch(&base, &task.invocation).await {
                Ok(_) => {
                    tracing::info!(
                        "[STORMO] fail-back recovered method {} on {}",
                        task.invocation.method(),
                        base.directory().consumer_url().path(),
                    );
                }
                Err(err) => {
                    task.attempts += 1;
                    if task.attempts < MAX_REDISPATCHES {
                        kept.push_back(task);
                    } else {
                        tracing::warn!(
                            "[STORMO] fail-back gave up on method {} after {} redispatches: {err}",
                            task.invocation.method(),
                            task.attempts,
                        );
                    }
                }
            }
        }
        pending = kept;
        if closed && pending.is_empty() {
            break;
        }
    }
}

impl Endpoint for FailbackEndpoint {
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
            self.base.check_destroyed()?;
            let mut invocation = invocation.clone();
            invocation.bind_ambient();
            let attempt = async {
                let candidates = self.base.list(&invocation)?;
                let balancer = self.base.balancer(&candidates, &invocation)?;
                let endpoint = self
                    .base
                    .select(&balancer, &invocation, &candidates, &[])?;
                self.base
                    .invoke_selected(&balancer, &endpoint, &invocation)
                    .await
            };
            match attempt.await {
                Ok(reply) => Ok(reply),
                Err(err) => {
                    tracing::warn!(
                        "[STORMO] fail-back parking method {} on {} for background retry: {err}",
                        invocation.method(),
                        self.url().path(),
                    );
                    self.enqueue(invocation);
                    Ok(Reply::empty())
                }
            }
        })
    }

    fn destroy(&self) {
        // dropping the sender lets the worker drain and exit on its own
        self.queue.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
        self.base.destroy();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::tests::{consumer_url, directory_of};
    use super::FailbackCluster;
    use crate::{
        cluster::Cluster,
        error::ErrorKind,
        invocation::Invocation,
        testing::{self, Behavior, MockEndpoint},
    };

    #[tokio::test(start_paused = true)]
    async fn test_caller_is_acknowledged_and_call_retried() {
        let flaky = MockEndpoint::with_behavior(
            testing::test_url("10.0.0.1", 1),
            Behavior::FailFirst(ErrorKind::Network, 1),
        );
        let registry = crate::new_registry();
        let directory = directory_of(&registry, consumer_url(), vec![flaky.clone() as _]);
        let cluster = FailbackCluster::new(registry).join(directory).unwrap();

        let reply = cluster.invoke(&Invocation::new("find")).await.unwrap();
        assert!(reply.payload().is_none());
        assert_eq!(flaky.calls(), 1);

        // the background worker fires within the retry period
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(flaky.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_redispatch_budget() {
        let dead = MockEndpoint::failing("10.0.0.1", 1, ErrorKind::Network);
        let registry = crate::new_registry();
        let directory = directory_of(&registry, consumer_url(), vec![dead.clone() as _]);
        let cluster = FailbackCluster::new(registry).join(directory).unwrap();

        cluster.invoke(&Invocation::new("find")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        // one foreground call plus three background redispatches
        assert_eq!(dead.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_stops_retrying() {
        let dead = MockEndpoint::failing("10.0.0.1", 1, ErrorKind::Network);
        let registry = crate::new_registry();
        let directory = directory_of(&registry, consumer_url(), vec![dead.clone() as _]);
        let cluster = FailbackCluster::new(registry).join(directory).unwrap();

        cluster.invoke(&Invocation::new("find")).await.unwrap();
        cluster.destroy();
        let before = dead.calls();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(dead.calls(), before);
    }
}
