//! The condition router: `whenExpr => thenExpr` rules over url parameters.
//!
//! The when-side decides whether the rule applies to the consumer; the
//! then-side filters the endpoint list. An empty when-side matches every
//! consumer, an empty then-side blacklists it.

use std::{collections::{BTreeSet, HashMap}, sync::Arc};

use faststr::FastStr;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{value_match, Router, RouterFactory};
use crate::{endpoint::Endpoint, error::RpcError, invocation::Invocation, url::Url};

static CLAUSE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([&!=,]*)\s*([^&!=,\s]+)").unwrap_or_else(|_| unreachable!("static pattern"))
});

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct MatchPair {
    matches: BTreeSet<FastStr>,
    mismatches: BTreeSet<FastStr>,
}

impl MatchPair {
    pub(crate) fn is_match(&self, value: &str, subst: Option<&Url>) -> bool {
        let hit = |set: &BTreeSet<FastStr>| set.iter().any(|p| value_match(p, value, subst));
        match (self.matches.is_empty(), self.mismatches.is_empty()) {
            (false, true) => hit(&self.matches),
            (true, false) => !hit(&self.mismatches),
            (false, false) => !hit(&self.mismatches) && hit(&self.matches),
            (true, true) => false,
        }
    }
}

pub(crate) type Condition = HashMap<FastStr, MatchPair>;

/// Parses one side of a rule into its per-key match pairs.
pub(crate) fn parse_rule(rule: &str) -> Result<Condition, RpcError> {
    let mut condition = Condition::new();
    let mut key: Option<FastStr> = None;
    // which side of the current pair `,` extends
    let mut in_matches = true;
    for cap in CLAUSE_PATTERN.captures_iter(rule) {
        let separator = cap.get(1).map(|m| m.as_str()).unwrap_or("");
        let content = cap.get(2).map(|m| m.as_str()).unwrap_or("");
        match separator {
            "" | "&" => {
                let name = FastStr::new(content);
                condition.entry(name.clone()).or_default();
                key = Some(name);
            }
            "=" | "!=" => {
                let Some(name) = &key else {
                    return Err(RpcError::config(format!(
                        "illegal route rule {rule:?}: value {content:?} has no key"
                    )));
                };
                let pair = condition.entry(name.clone()).or_default();
                in_matches = separator == "=";
                if in_matches {
                    pair.matches.insert(FastStr::new(content));
                } else {
                    pair.mismatches.insert(FastStr::new(content));
                }
            }
            "," => {
                let Some(name) = &key else {
                    return Err(RpcError::config(format!(
                        "illegal route rule {rule:?}: value {content:?} has no key"
                    )));
                };
                let pair = condition.entry(name.clone()).or_default();
                if pair.matches.is_empty() && pair.mismatches.is_empty() {
                    return Err(RpcError::config(format!(
                        "illegal route rule {rule:?}: {content:?} extends an empty clause"
                    )));
                }
                if in_matches {
                    pair.matches.insert(FastStr::new(content));
                } else {
                    pair.mismatches.insert(FastStr::new(content));
                }
            }
            other => {
                return Err(RpcError::config(format!(
                    "illegal route rule {rule:?}: unexpected separator {other:?} before {content:?}"
                )));
            }
        }
    }
    Ok(condition)
}

fn sample_value(key: &str, url: &Url, invocation: Option<&Invocation>) -> Option<String> {
    if matches!(key, "method" | "methods") {
        if let Some(inv) = invocation {
            return Some(inv.method().to_string());
        }
    }
    match key {
        "address" => Some(url.address()),
        "host" => Some(url.host().to_string()),
        "protocol" => Some(url.protocol().to_string()),
        _ => url
            .param(key)
            .or_else(|| url.param(&format!("default.{key}")))
            .map(|v| v.to_string()),
    }
}

fn match_condition(
    condition: &Condition,
    url: &Url,
    subst: Option<&Url>,
    invocation: Option<&Invocation>,
) -> bool {
    let mut matched = false;
    for (key, pair) in condition {
        match sample_value(key, url, invocation) {
            Some(value) => {
                if !pair.is_match(&value, subst) {
                    return false;
                }
                matched = true;
            }
            None => {
                // an absent value fails a positive clause and passes a
                // purely negative one
                if !pair.matches.is_empty() {
                    return false;
                }
                matched = true;
            }
        }
    }
    matched
}

pub struct ConditionRouter {
    url: Url,
    priority: i32,
    force: bool,
    runtime: bool,
    when: Condition,
    then: Condition,
    /// Empty then-side: the matched consumer is blacklisted.
    deny_all: bool,
}

impl ConditionRouter {
    /// Builds a router from a rule url; the rule text lives in the `rule`
    /// parameter.
    pub fn new(url: Url) -> Result<Self, RpcError> {
        let rule = url
            .param("rule")
            .ok_or_else(|| RpcError::config(format!("router url {url} has no rule parameter")))?
            .clone();
        Self::with_rule(url, &rule)
    }

    pub fn with_rule(url: Url, rule: &str) -> Result<Self, RpcError> {
        let rule = rule.replace("consumer.", "").replace("provider.", "");
        if rule.trim().is_empty() {
            return Err(RpcError::config("illegal route rule: empty rule"));
        }
        let (when_rule, then_rule) = match rule.split_once("=>") {
            Some((when, then)) => (when.trim(), then.trim()),
            None => ("", rule.trim()),
        };
        let when = if when_rule.is_empty() || when_rule == "true" {
            Condition::new()
        } else {
            parse_rule(when_rule)?
        };
        let deny_all = then_rule.is_empty() || then_rule == "false";
        let then = if deny_all {
            Condition::new()
        } else {
            parse_rule(then_rule)?
        };
        Ok(Self {
            priority: url.param_i64("priority", 0) as i32,
            force: url.param_bool("force", false),
            runtime: url.param_bool("runtime", false),
            url,
            when,
            then,
            deny_all,
        })
    }

    fn match_when(&self, consumer: &Url, invocation: Option<&Invocation>) -> bool {
        self.when.is_empty() || match_condition(&self.when, consumer, None, invocation)
    }

    fn match_then(&self, endpoint: &Url, consumer: &Url) -> bool {
        !self.deny_all && match_condition(&self.then, endpoint, Some(consumer), None)
    }
}

impl Router for ConditionRouter {
    fn url(&self) -> &Url {
        &self.url
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn runtime(&self) -> bool {
        self.runtime
    }

    fn route(
        &self,
        endpoints: Vec<Arc<dyn Endpoint>>,
        consumer: &Url,
        invocation: Option<&Invocation>,
    ) -> Result<Vec<Arc<dyn Endpoint>>, RpcError> {
        if endpoints.is_empty() || !self.match_when(consumer, invocation) {
            return Ok(endpoints);
        }
        if self.deny_all {
            tracing::warn!(
                "[STORMO] consumer {} is blacklisted by route rule {}",
                consumer.address(),
                self.url,
            );
            return Ok(Vec::new());
        }
        let routed: Vec<Arc<dyn Endpoint>> = endpoints
            .iter()
            .filter(|ep| self.match_then(ep.url(), consumer))
            .cloned()
            .collect();
        if !routed.is_empty() {
            Ok(routed)
        } else if self.force {
            Ok(routed)
        } else {
            tracing::warn!(
                "[STORMO] route rule {} filtered out every endpoint, ignoring it (force=false)",
                self.url,
            );
            Ok(endpoints)
        }
    }
}

pub struct ConditionRouterFactory;

impl RouterFactory for ConditionRouterFactory {
    fn create(&self, url: &Url) -> Result<Arc<dyn Router>, RpcError> {
        Ok(Arc::new(ConditionRouter::new(url.clone())?))
    }
}
