//! The live membership view one cluster dispatches against.
//!
//! A [`Directory`] owns the endpoint set of one service interface and the
//! router pipeline that filters it. `list` hands out a snapshot: membership
//! changes arriving later are never observed by a call already in flight.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::{
    endpoint::Endpoint,
    error::RpcError,
    extension::ExtensionRegistry,
    invocation::Invocation,
    route::{sort_pipeline, MockSelector, Router, RouterFactory},
    url::Url,
};

pub trait Directory: Send + Sync {
    /// The consumer-side url this directory serves (service path plus the
    /// caller's configuration).
    fn consumer_url(&self) -> &Url;

    /// The endpoints currently eligible for `invocation`, routed. The result
    /// is a snapshot; later membership mutations do not leak into it.
    fn list(&self, invocation: &Invocation) -> Result<Vec<Arc<dyn Endpoint>>, RpcError>;

    fn is_available(&self) -> bool;

    fn destroy(&self);
}

/// A directory over an explicitly managed endpoint list.
///
/// Membership comes in through [`update`](SnapshotDirectory::update) or a
/// watched channel. Routers flagged `runtime` run on every `list` call; the
/// rest run once per membership change and their output is cached.
pub struct SnapshotDirectory {
    consumer: Url,
    routers: Vec<Arc<dyn Router>>,
    /// Members as delivered by the last update.
    members: ArcSwap<Vec<Arc<dyn Endpoint>>>,
    /// Members after the non-runtime routers.
    routed: ArcSwap<Vec<Arc<dyn Endpoint>>>,
    destroyed: AtomicBool,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl SnapshotDirectory {
    /// Builds the directory and runs the non-runtime routers once.
    ///
    /// The pipeline is `routers` plus the router named by the consumer's
    /// `router` parameter (if any) plus the terminal mock selector, ordered
    /// by `(priority, url)`.
    pub fn new(
        registry: &ExtensionRegistry,
        consumer: Url,
        endpoints: Vec<Arc<dyn Endpoint>>,
        mut routers: Vec<Arc<dyn Router>>,
    ) -> Result<Arc<Self>, RpcError> {
        if let Some(name) = consumer.param("router") {
            let factory = registry.load::<dyn RouterFactory>().get(name)?;
            routers.push(factory.create(&consumer)?);
        }
        routers.push(Arc::new(MockSelector::new()));
        sort_pipeline(&mut routers);

        let directory = Arc::new(Self {
            consumer,
            routers,
            members: ArcSwap::from_pointee(Vec::new()),
            routed: ArcSwap::from_pointee(Vec::new()),
            destroyed: AtomicBool::new(false),
            watch_task: Mutex::new(None),
        });
        directory.update(endpoints)?;
        Ok(directory)
    }

    /// Replaces the member list, re-running the non-runtime routers.
    pub fn update(&self, endpoints: Vec<Arc<dyn Endpoint>>) -> Result<(), RpcError> {
        let mut routed = endpoints.clone();
        for router in &self.routers {
            if !router.runtime() {
                routed = router.route(routed, &self.consumer, None)?;
            }
        }
        self.members.store(Arc::new(endpoints));
        self.routed.store(Arc::new(routed));
        Ok(())
    }

    /// Feeds membership updates from `receiver` into this directory until
    /// the channel closes or the directory is destroyed.
    pub fn watch(
        self: &Arc<Self>,
        mut receiver: async_broadcast::Receiver<Vec<Arc<dyn Endpoint>>>,
    ) {
        let directory = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(endpoints) => {
                        if let Err(err) = directory.update(endpoints) {
                            tracing::warn!("[STORMO] membership update rejected: {err}");
                        }
                    }
                    Err(async_broadcast::RecvError::Overflowed(missed)) => {
                        tracing::warn!(
                            "[STORMO] discovery subscription lagged, skipped {missed} updates"
                        );
                    }
                    Err(async_broadcast::RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self.watch_task.lock().replace(task) {
            previous.abort();
        }
    }
}

impl Directory for SnapshotDirectory {
    fn consumer_url(&self) -> &Url {
        &self.consumer
    }

    fn list(&self, invocation: &Invocation) -> Result<Vec<Arc<dyn Endpoint>>, RpcError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(RpcError::unknown(format!(
                "directory of {} is destroyed",
                self.consumer.path()
            )));
        }
        let mut endpoints = self.routed.load().as_ref().clone();
        for router in &self.routers {
            if router.runtime() {
                endpoints = router.route(endpoints, &self.consumer, Some(invocation))?;
            }
        }
        Ok(endpoints)
    }

    fn is_available(&self) -> bool {
        !self.destroyed.load(Ordering::Acquire)
            && self.routed.load().iter().any(|ep| ep.is_available())
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.watch_task.lock().take() {
            task.abort();
        }
        for endpoint in self.members.load().iter() {
            endpoint.destroy();
        }
        self.members.store(Arc::new(Vec::new()));
        self.routed.store(Arc::new(Vec::new()));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::{Directory, SnapshotDirectory};
    use crate::{
        endpoint::Endpoint,
        error::RpcError,
        invocation::Invocation,
        route::Router,
        testing::MockEndpoint,
        url::Url,
    };

    struct CountingRouter {
        url: Url,
        runtime: bool,
        runs: AtomicUsize,
    }

    impl CountingRouter {
        fn new(runtime: bool) -> Arc<Self> {
            Arc::new(Self {
                url: Url::new("counting", "0.0.0.0", 0),
                runtime,
                runs: AtomicUsize::new(0),
            })
        }
    }

    impl Router for CountingRouter {
        fn url(&self) -> &Url {
            &self.url
        }

        fn runtime(&self) -> bool {
            self.runtime
        }

        fn route(
            &self,
            endpoints: Vec<Arc<dyn Endpoint>>,
            _consumer: &Url,
            _invocation: Option<&Invocation>,
        ) -> Result<Vec<Arc<dyn Endpoint>>, RpcError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(endpoints)
        }
    }

    fn consumer() -> Url {
        Url::new("stormo", "10.0.0.200", 0).with_path("com.foo.BarService")
    }

    fn members(hosts: &[&str]) -> Vec<Arc<dyn Endpoint>> {
        hosts
            .iter()
            .map(|h| MockEndpoint::ok(h, 20880) as Arc<dyn Endpoint>)
            .collect()
    }

    #[tokio::test]
    async fn test_runtime_routers_run_per_call() {
        let registry = crate::new_registry();
        let static_router = CountingRouter::new(false);
        let runtime_router = CountingRouter::new(true);
        let directory = SnapshotDirectory::new(
            &registry,
            consumer(),
            members(&["10.0.0.1", "10.0.0.2"]),
            vec![static_router.clone(), runtime_router.clone()],
        )
        .unwrap();

        let inv = Invocation::new("find");
        directory.list(&inv).unwrap();
        directory.list(&inv).unwrap();
        assert_eq!(static_router.runs.load(Ordering::SeqCst), 1);
        assert_eq!(runtime_router.runs.load(Ordering::SeqCst), 2);

        directory.update(members(&["10.0.0.3"])).unwrap();
        assert_eq!(static_router.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_list_is_a_snapshot() {
        let registry = crate::new_registry();
        let directory = SnapshotDirectory::new(
            &registry,
            consumer(),
            members(&["10.0.0.1", "10.0.0.2"]),
            Vec::new(),
        )
        .unwrap();

        let inv = Invocation::new("find");
        let snapshot = directory.list(&inv).unwrap();
        directory.update(members(&["10.0.0.9"])).unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(directory.list(&inv).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_default_router_from_url_parameter() {
        let registry = crate::new_registry();
        let consumer = consumer()
            .with_param("router", "condition")
            .with_param("rule", "=> host != 10.0.0.2");
        let directory = SnapshotDirectory::new(
            &registry,
            consumer,
            members(&["10.0.0.1", "10.0.0.2"]),
            Vec::new(),
        )
        .unwrap();
        let listed = directory.list(&Invocation::new("find")).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].url().host(), "10.0.0.1");
    }

    #[tokio::test]
    async fn test_watch_applies_updates() {
        let registry = crate::new_registry();
        let directory = SnapshotDirectory::new(
            &registry,
            consumer(),
            members(&["10.0.0.1"]),
            Vec::new(),
        )
        .unwrap();
        let (sender, receiver) = async_broadcast::broadcast(4);
        directory.watch(receiver);

        sender
            .broadcast(members(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(directory.list(&Invocation::new("find")).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_destroy_tears_down() {
        let registry = crate::new_registry();
        let a = MockEndpoint::ok("10.0.0.1", 20880);
        let directory = SnapshotDirectory::new(
            &registry,
            consumer(),
            vec![a.clone() as Arc<dyn Endpoint>],
            Vec::new(),
        )
        .unwrap();

        assert!(directory.is_available());
        directory.destroy();
        directory.destroy(); // idempotent
        assert!(!directory.is_available());
        assert!(a.is_destroyed());
        assert!(directory.list(&Invocation::new("find")).is_err());
    }
}
