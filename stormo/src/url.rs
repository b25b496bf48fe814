//! The `Url` is the single channel by which configuration reaches the
//! dispatch engine: every strategy, router and balancer reads its knobs from
//! the parameters of some `Url` (the consumer's or an endpoint's).

use std::{collections::BTreeMap, fmt, str::FromStr};

use faststr::FastStr;

use crate::error::RpcError;

/// An immutable service address plus its parameter map.
///
/// Parameters can be addressed globally (`param`) or per method
/// (`method_param`, stored under `"<method>.<key>"`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Url {
    protocol: FastStr,
    host: FastStr,
    port: u16,
    path: FastStr,
    params: BTreeMap<FastStr, FastStr>,
}

impl Url {
    pub fn new(protocol: impl Into<FastStr>, host: impl Into<FastStr>, port: u16) -> Self {
        Self {
            protocol: protocol.into(),
            host: host.into(),
            port,
            path: FastStr::from_static_str(""),
            params: BTreeMap::new(),
        }
    }

    pub fn with_path(mut self, path: impl Into<FastStr>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_param(mut self, key: impl Into<FastStr>, value: impl Into<FastStr>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_params<K, V>(mut self, params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<FastStr>,
        V: Into<FastStr>,
    {
        self.params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    #[inline]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// `host:port`, the form used in log lines and error summaries.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The full string form of this url. Stable for a given url, so it doubles
    /// as the node identity key of the stateful load balancers.
    pub fn identity(&self) -> FastStr {
        FastStr::from(self.to_string())
    }

    #[inline]
    pub fn param(&self, key: &str) -> Option<&FastStr> {
        self.params.get(key)
    }

    pub fn param_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.params.get(key).map(|v| v.as_str()).unwrap_or(default)
    }

    pub fn param_bool(&self, key: &str, default: bool) -> bool {
        self.params
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn param_u64(&self, key: &str, default: u64) -> u64 {
        self.params
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn param_i64(&self, key: &str, default: i64) -> i64 {
        self.params
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Method-scoped parameter, i.e. the value stored under
    /// `"<method>.<key>"`. Does not fall back to the global key.
    #[inline]
    pub fn method_param(&self, method: &str, key: &str) -> Option<&FastStr> {
        self.params.get(format!("{method}.{key}").as_str())
    }

    /// Method-scoped parameter falling back to the global key, then the
    /// default.
    pub fn method_param_or<'a>(&'a self, method: &str, key: &str, default: &'a str) -> &'a str {
        self.method_param(method, key)
            .map(|v| v.as_str())
            .unwrap_or_else(|| self.param_or(key, default))
    }

    pub fn method_param_bool(&self, method: &str, key: &str, default: bool) -> bool {
        self.method_param(method, key)
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| self.param_bool(key, default))
    }

    pub fn method_param_u64(&self, method: &str, key: &str, default: u64) -> u64 {
        self.method_param(method, key)
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| self.param_u64(key, default))
    }

    pub fn method_param_i64(&self, method: &str, key: &str, default: i64) -> i64 {
        self.method_param(method, key)
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| self.param_i64(key, default))
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.host, self.port)?;
        if !self.path.is_empty() {
            write!(f, "/{}", self.path)?;
        }
        for (i, (k, v)) in self.params.iter().enumerate() {
            f.write_str(if i == 0 { "?" } else { "&" })?;
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

impl FromStr for Url {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = url::Url::parse(s)
            .map_err(|e| RpcError::config(format!("invalid url {s:?}: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| RpcError::config(format!("url {s:?} has no host")))?;
        let mut params = BTreeMap::new();
        for (k, v) in parsed.query_pairs() {
            params.insert(FastStr::new(k), FastStr::new(v));
        }
        Ok(Self {
            protocol: FastStr::new(parsed.scheme()),
            host: FastStr::new(host),
            port: parsed.port().unwrap_or(0),
            path: FastStr::new(parsed.path().trim_start_matches('/')),
            params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::Url;

    #[test]
    fn test_parse_roundtrip() {
        let url: Url = "stormo://10.20.30.40:8900/com.foo.BarService?weight=200&loadbalance=roundrobin"
            .parse()
            .unwrap();
        assert_eq!(url.protocol(), "stormo");
        assert_eq!(url.host(), "10.20.30.40");
        assert_eq!(url.port(), 8900);
        assert_eq!(url.path(), "com.foo.BarService");
        assert_eq!(url.param_u64("weight", 100), 200);
        assert_eq!(url.param_or("loadbalance", "random"), "roundrobin");
        assert_eq!(
            url.to_string(),
            "stormo://10.20.30.40:8900/com.foo.BarService?loadbalance=roundrobin&weight=200"
        );
    }

    #[test]
    fn test_bad_url_is_config_error() {
        let err = "not a url".parse::<Url>().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn test_method_param_fallback() {
        let url = Url::new("stormo", "127.0.0.1", 20880)
            .with_param("retries", "5")
            .with_param("find.retries", "0")
            .with_param("sticky", "true");

        // method-scoped wins over global
        assert_eq!(url.method_param_or("find", "retries", "2"), "0");
        // no method-scoped entry falls back to the global key
        assert_eq!(url.method_param_or("list", "retries", "2"), "5");
        // neither falls back to the default
        assert_eq!(url.method_param_or("list", "forks", "2"), "2");

        assert!(url.method_param_bool("list", "sticky", false));
        assert_eq!(url.method_param_u64("find", "retries", 2), 0);
    }

    #[test]
    fn test_identity_is_stable() {
        let a = Url::new("stormo", "127.0.0.1", 1)
            .with_param("b", "2")
            .with_param("a", "1");
        let b = Url::new("stormo", "127.0.0.1", 1)
            .with_param("a", "1")
            .with_param("b", "2");
        assert_eq!(a.identity(), b.identity());
    }
}
