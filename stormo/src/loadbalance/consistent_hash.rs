//! Consistent-hash selection: the same request key lands on the same
//! endpoint for as long as that endpoint stays in the list.
//!
//! One ring per `(service, method)` key. Each endpoint contributes
//! `hash.nodes` virtual nodes (hashes of `identity#serial`); the request key
//! hashes the arguments selected by `hash.arguments`. The ring is rebuilt
//! when the endpoint set changes.

use std::{collections::HashMap, sync::Arc};

use dashmap::DashMap;
use faststr::FastStr;

use super::{method_key, LoadBalance};
use crate::{endpoint::Endpoint, invocation::Invocation, url::Url};

const DEFAULT_VIRTUAL_NODES: u64 = 160;

struct HashRing {
    /// Fingerprint of the endpoint set this ring was built from.
    set_identity: u64,
    /// `(hash, index into identities)`, sorted by hash.
    virtual_nodes: Vec<(u64, usize)>,
    identities: Vec<FastStr>,
    hash_arguments: Vec<usize>,
}

impl HashRing {
    fn build(endpoints: &[Arc<dyn Endpoint>], identities: Vec<FastStr>, invocation: &Invocation) -> Self {
        let first = endpoints[0].url();
        let replicas = first.method_param_u64(invocation.method(), "hash.nodes", DEFAULT_VIRTUAL_NODES);
        let hash_arguments: Vec<usize> = first
            .method_param_or(invocation.method(), "hash.arguments", "0")
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();

        let mut virtual_nodes = Vec::with_capacity(identities.len() * replicas as usize);
        for (index, identity) in identities.iter().enumerate() {
            for serial in 0..replicas {
                let hash = hash_bytes(format!("{identity}#{serial}").as_bytes());
                virtual_nodes.push((hash, index));
            }
        }
        virtual_nodes.sort_unstable();
        Self {
            set_identity: set_identity(&identities),
            virtual_nodes,
            identities,
            hash_arguments,
        }
    }

    fn pick(&self, request_hash: u64) -> Option<&FastStr> {
        if self.virtual_nodes.is_empty() {
            return None;
        }
        let mut index = self
            .virtual_nodes
            .partition_point(|(hash, _)| *hash < request_hash);
        if index == self.virtual_nodes.len() {
            index = 0;
        }
        self.identities.get(self.virtual_nodes[index].1)
    }

    fn request_hash(&self, invocation: &Invocation) -> u64 {
        let mut key = Vec::new();
        for &argument in &self.hash_arguments {
            if let Some(bytes) = invocation.arguments().get(argument) {
                key.extend_from_slice(bytes);
            }
        }
        hash_bytes(&key)
    }
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    mur3::murmurhash3_x64_128(bytes, 0).0
}

fn set_identity(identities: &[FastStr]) -> u64 {
    let mut sorted: Vec<&FastStr> = identities.iter().collect();
    sorted.sort_unstable();
    let joined = sorted
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    hash_bytes(joined.as_bytes())
}

pub struct ConsistentHashBalance {
    rings: DashMap<FastStr, Arc<HashRing>>,
}

impl Default for ConsistentHashBalance {
    fn default() -> Self {
        Self {
            rings: DashMap::new(),
        }
    }
}

impl ConsistentHashBalance {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalance for ConsistentHashBalance {
    fn do_select(
        &self,
        endpoints: &[Arc<dyn Endpoint>],
        url: &Url,
        invocation: &Invocation,
    ) -> Option<Arc<dyn Endpoint>> {
        let key = method_key(url, invocation);
        let identities: Vec<FastStr> = endpoints.iter().map(|ep| ep.url().identity()).collect();
        let fingerprint = set_identity(&identities);

        let cached = self
            .rings
            .get(&key)
            .filter(|ring| ring.set_identity == fingerprint)
            .map(|ring| Arc::clone(ring.value()));
        let ring = match cached {
            Some(ring) => ring,
            None => {
                let ring = Arc::new(HashRing::build(endpoints, identities.clone(), invocation));
                self.rings.insert(key, ring.clone());
                ring
            }
        };

        let winner = ring.pick(ring.request_hash(invocation))?;
        // map the ring's identity back onto the current candidate list
        let by_identity: HashMap<&FastStr, usize> = identities
            .iter()
            .enumerate()
            .map(|(index, id)| (id, index))
            .collect();
        by_identity
            .get(winner)
            .and_then(|&index| endpoints.get(index))
            .cloned()
    }
}
