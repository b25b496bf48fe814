use futures::future::BoxFuture;

use crate::{
    error::RpcError,
    invocation::{Invocation, Reply},
    url::Url,
};

/// A callable handle to one remote service instance.
///
/// The dispatch engine consumes endpoints through this trait only; how the
/// bytes reach the remote side (connection pools, codecs, protocols) is the
/// transport layer's business. Cluster strategies implement `Endpoint`
/// themselves, so a wired cluster is indistinguishable from a single remote
/// instance to its caller.
pub trait Endpoint: Send + Sync {
    /// The descriptive url of this endpoint (address plus parameters).
    fn url(&self) -> &Url;

    /// Whether this endpoint is currently believed to accept calls. May flip
    /// at any time; a `true` here is a hint, not a guarantee.
    fn is_available(&self) -> bool {
        true
    }

    /// Performs the remote call. This is the only point at which the engine
    /// blocks on the network.
    fn invoke<'s>(&'s self, invocation: &'s Invocation)
        -> BoxFuture<'s, Result<Reply, RpcError>>;

    /// Releases any resources held by this endpoint. Idempotent.
    fn destroy(&self) {}
}
