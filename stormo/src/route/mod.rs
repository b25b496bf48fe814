//! Declarative filtering of the endpoint list.
//!
//! A router is a pure function over the endpoint list; a directory composes
//! them into a pipeline ordered by `(priority, url)`. Routers whose
//! `runtime` flag is set are re-evaluated on every call, the rest only when
//! membership changes.

use std::{net::IpAddr, sync::Arc};

use ipnet::IpNet;

use crate::{endpoint::Endpoint, error::RpcError, invocation::Invocation, url::Url};

pub mod condition;
pub mod mock;

pub use condition::{ConditionRouter, ConditionRouterFactory};
pub use mock::MockSelector;

pub trait Router: Send + Sync {
    /// The url this router was built from (rule, priority, flags).
    fn url(&self) -> &Url;

    /// Pipeline position; lower runs earlier.
    fn priority(&self) -> i32 {
        0
    }

    /// Whether to re-evaluate on every call instead of once per membership
    /// change.
    fn runtime(&self) -> bool {
        false
    }

    /// Filters `endpoints`. `invocation` is absent when the pipeline runs at
    /// membership-change time.
    fn route(
        &self,
        endpoints: Vec<Arc<dyn Endpoint>>,
        consumer: &Url,
        invocation: Option<&Invocation>,
    ) -> Result<Vec<Arc<dyn Endpoint>>, RpcError>;
}

/// Builds routers from their rule urls; resolved by name through the
/// extension registry (`router` url parameter).
pub trait RouterFactory: Send + Sync {
    fn create(&self, url: &Url) -> Result<Arc<dyn Router>, RpcError>;
}

const MANIFEST: &str = "\
# builtin router factories
condition=route::ConditionRouterFactory
";

pub(crate) fn install(registry: &crate::extension::ExtensionRegistry) {
    let loader = registry.load::<dyn RouterFactory>();
    let providers = crate::extension::ManifestProviders::new()
        .plain("route::ConditionRouterFactory", |_| {
            Arc::new(ConditionRouterFactory) as Arc<dyn RouterFactory>
        });
    if let Err(err) =
        loader.load_manifest(crate::extension::ManifestTier::Internal, MANIFEST, &providers)
    {
        tracing::error!("[STORMO] builtin router manifest rejected: {err}");
    }
    loader.set_default("condition");
}

/// Orders a pipeline by `(priority, url-string)`. The sort is stable, so
/// routers that compare equal keep their insertion order.
pub fn sort_pipeline(routers: &mut [Arc<dyn Router>]) {
    routers.sort_by(|a, b| {
        a.priority()
            .cmp(&b.priority())
            .then_with(|| a.url().to_string().cmp(&b.url().to_string()))
    });
}

/// Glob match of `value` against `pattern`.
///
/// `*` matches any run of characters (one wildcard per pattern). A pattern
/// starting with `$` is substituted from `subst` before matching
/// (`$protocol` reads the protocol, any other `$key` reads a parameter).
/// Patterns in CIDR notation match address values by network containment.
pub(crate) fn value_match(pattern: &str, value: &str, subst: Option<&Url>) -> bool {
    if pattern == "*" {
        return true;
    }
    let substituted;
    let pattern = if let Some(key) = pattern.strip_prefix('$') {
        let Some(url) = subst else {
            return false;
        };
        substituted = if key == "protocol" {
            url.protocol().to_string()
        } else {
            url.param_or(key, "").to_string()
        };
        substituted.as_str()
    } else {
        pattern
    };

    if pattern.is_empty() {
        return value.is_empty();
    }
    if pattern == value {
        return true;
    }
    if pattern.contains('/') {
        if let (Ok(net), Ok(ip)) = (pattern.parse::<IpNet>(), value.parse::<IpAddr>()) {
            return net.contains(&ip);
        }
    }
    match pattern.find('*') {
        None => false,
        Some(0) => value.ends_with(&pattern[1..]),
        Some(i) if i == pattern.len() - 1 => value.starts_with(&pattern[..i]),
        Some(i) => {
            let (prefix, suffix) = (&pattern[..i], &pattern[i + 1..]);
            value.len() >= prefix.len() + suffix.len()
                && value.starts_with(prefix)
                && value.ends_with(suffix)
        }
    }
}
