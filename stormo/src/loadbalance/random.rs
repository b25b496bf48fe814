use std::sync::Arc;

use rand::Rng;

use super::{effective_weight, LoadBalance};
use crate::{endpoint::Endpoint, invocation::Invocation, url::Url};

/// Random selection biased by effective weight, with a uniform fast path
/// when every candidate weighs the same.
#[derive(Default)]
pub struct WeightedRandomBalance;

impl WeightedRandomBalance {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalance for WeightedRandomBalance {
    fn do_select(
        &self,
        endpoints: &[Arc<dyn Endpoint>],
        _url: &Url,
        invocation: &Invocation,
    ) -> Option<Arc<dyn Endpoint>> {
        let weights: Vec<u64> = endpoints
            .iter()
            .map(|ep| effective_weight(ep.url(), invocation))
            .collect();
        let total: u64 = weights.iter().sum();
        let uniform = weights.windows(2).all(|w| w[0] == w[1]);
        let mut rng = rand::rng();
        if total > 0 && !uniform {
            let mut offset = rng.random_range(0..total);
            for (endpoint, weight) in endpoints.iter().zip(&weights) {
                if offset < *weight {
                    return Some(endpoint.clone());
                }
                offset -= *weight;
            }
        }
        endpoints.get(rng.random_range(0..endpoints.len())).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use super::{LoadBalance, WeightedRandomBalance};
    use crate::{endpoint::Endpoint, invocation::Invocation, testing, testing::MockEndpoint, url::Url};

    #[test]
    fn test_respects_weights_roughly() {
        let eps: Vec<Arc<dyn Endpoint>> = vec![
            MockEndpoint::with_url(testing::test_url("10.0.0.1", 1).with_param("weight", "80")) as _,
            MockEndpoint::with_url(testing::test_url("10.0.0.2", 1).with_param("weight", "20")) as _,
        ];
        let lb = WeightedRandomBalance::new();
        let url = Url::new("stormo", "127.0.0.1", 0);
        let inv = Invocation::new("find");

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..10_000 {
            let picked = lb.select(&eps, &url, &inv).unwrap();
            *counts.entry(picked.url().address()).or_default() += 1;
        }
        let heavy = counts.get("10.0.0.1:1").copied().unwrap_or(0);
        assert!(
            (7_000..=9_000).contains(&heavy),
            "weight-80 endpoint picked {heavy} of 10000"
        );
    }

    #[test]
    fn test_zero_weights_fall_back_to_uniform() {
        let eps: Vec<Arc<dyn Endpoint>> = vec![
            MockEndpoint::with_url(testing::test_url("10.0.0.1", 1).with_param("weight", "0")) as _,
            MockEndpoint::with_url(testing::test_url("10.0.0.2", 1).with_param("weight", "0")) as _,
        ];
        let lb = WeightedRandomBalance::new();
        let url = Url::new("stormo", "127.0.0.1", 0);
        let inv = Invocation::new("find");
        assert!(lb.select(&eps, &url, &inv).is_some());
    }

    #[test]
    fn test_single_endpoint_short_circuits() {
        let only = MockEndpoint::ok("10.0.0.1", 1);
        let eps: Vec<Arc<dyn Endpoint>> = vec![only.clone() as _];
        let lb = WeightedRandomBalance::new();
        let picked = lb
            .select(&eps, &Url::new("stormo", "127.0.0.1", 0), &Invocation::new("find"))
            .unwrap();
        assert!(Arc::ptr_eq(&picked, &(only as Arc<dyn Endpoint>)));
    }
}
