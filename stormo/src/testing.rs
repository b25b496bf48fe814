//! Shared in-crate test doubles.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use faststr::FastStr;
use futures::future::BoxFuture;

use crate::{
    endpoint::Endpoint,
    error::{ErrorKind, RpcError},
    invocation::{Invocation, Reply},
    url::Url,
};

#[derive(Clone, Copy, Debug)]
pub(crate) enum Behavior {
    Ok,
    OkAfter(Duration),
    Fail(ErrorKind),
    FailAfter(ErrorKind, Duration),
    /// Fails the first `n` invocations, then recovers.
    FailFirst(ErrorKind, usize),
}

/// A scriptable endpoint: replies (or fails) per its behavior, counts its
/// invocations, and reports its own address as the reply payload so tests
/// can tell who answered.
pub(crate) struct MockEndpoint {
    url: Url,
    behavior: Behavior,
    available: AtomicBool,
    calls: AtomicUsize,
    destroyed: AtomicBool,
}

pub(crate) fn test_url(host: &str, port: u16) -> Url {
    Url::new("stormo", FastStr::new(host), port).with_path("com.foo.BarService")
}

impl MockEndpoint {
    pub(crate) fn with_url(url: Url) -> Arc<Self> {
        Self::with_behavior(url, Behavior::Ok)
    }

    pub(crate) fn with_behavior(url: Url, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            url,
            behavior,
            available: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
        })
    }

    pub(crate) fn ok(host: &str, port: u16) -> Arc<Self> {
        Self::with_url(test_url(host, port))
    }

    pub(crate) fn failing(host: &str, port: u16, kind: ErrorKind) -> Arc<Self> {
        Self::with_behavior(test_url(host, port), Behavior::Fail(kind))
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl Endpoint for MockEndpoint {
    fn url(&self) -> &Url {
        &self.url
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn invoke<'s>(
        &'s self,
        _invocation: &'s Invocation,
    ) -> BoxFuture<'s, Result<Reply, RpcError>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let (kind, delay) = match self.behavior {
                Behavior::Ok => (None, None),
                Behavior::OkAfter(d) => (None, Some(d)),
                Behavior::Fail(k) => (Some(k), None),
                Behavior::FailAfter(k, d) => (Some(k), Some(d)),
                Behavior::FailFirst(k, n) if call <= n => (Some(k), None),
                Behavior::FailFirst(..) => (None, None),
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match kind {
                None => Ok(Reply::with_payload(Bytes::from(self.url.address()))),
                Some(kind) => Err(RpcError::new(
                    kind,
                    format!("scripted failure from {}", self.url.address()),
                )),
            }
        })
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

/// The address a reply from [`MockEndpoint`] carries.
pub(crate) fn replied_by(reply: &Reply) -> String {
    String::from_utf8_lossy(reply.payload().map(|b| b.as_ref()).unwrap_or_default()).into_owned()
}
