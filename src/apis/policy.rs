/*
 * Copyright 2022 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::{BTreeMap, HashSet, VecDeque};

use k8s_openapi::ByteString;
use kube::CustomResource;
use rand::{rngs::StdRng, Rng, SeedableRng};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Where, and how eagerly, to forward allocations to another cluster.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[kube(
    group = "multicluster.agones.dev",
    version = "v1",
    kind = "GameServerAllocationPolicy",
    plural = "gameserverallocationpolicies",
    derive = "PartialEq"
)]
#[kube(namespaced)]
#[serde(rename_all = "camelCase")]
pub struct GameServerAllocationPolicySpec {
    /// Lower values are tried first.
    #[serde(default)]
    pub priority: i32,
    /// Relative chance of being picked among policies of equal priority.
    #[serde(default)]
    pub weight: i32,
    #[serde(default)]
    pub connection_info: ClusterConnectionInfo,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConnectionInfo {
    #[serde(default)]
    pub cluster_name: String,
    /// Allocator service endpoints of the target cluster. Empty means the
    /// local cluster.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allocation_endpoints: Vec<String>,
    /// Secret holding the client certificate used to reach the endpoints.
    #[serde(default)]
    pub secret_name: String,
    /// Namespace to allocate from in the target cluster.
    #[serde(default)]
    pub namespace: String,
    /// Extra certificate authority for the target's server certificate.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "serverCa")]
    #[schemars(with = "Option<String>")]
    pub server_ca: Option<ByteString>,
}

impl ClusterConnectionInfo {
    pub fn is_local(&self) -> bool {
        self.allocation_endpoints.is_empty()
    }
}

type ClusterPolicies = BTreeMap<String, Vec<GameServerAllocationPolicySpec>>;

/// Yields connection details in priority order, drawing clusters of equal
/// priority at random by weight. A cluster is yielded at most once, and a
/// zero weight cluster is never drawn.
pub struct ConnectionInfoIterator<R = StdRng> {
    tiers: VecDeque<ClusterPolicies>,
    seen: HashSet<String>,
    rng: R,
}

impl ConnectionInfoIterator<StdRng> {
    pub fn new<'a>(policies: impl IntoIterator<Item = &'a GameServerAllocationPolicy>) -> Self {
        Self::with_rng(policies, StdRng::from_entropy())
    }
}

impl<R: Rng> ConnectionInfoIterator<R> {
    pub fn with_rng<'a>(
        policies: impl IntoIterator<Item = &'a GameServerAllocationPolicy>,
        rng: R,
    ) -> Self {
        let mut by_priority: BTreeMap<i32, ClusterPolicies> = BTreeMap::new();
        for policy in policies {
            by_priority
                .entry(policy.spec.priority)
                .or_default()
                .entry(policy.spec.connection_info.cluster_name.clone())
                .or_default()
                .push(policy.spec.clone());
        }

        Self {
            tiers: by_priority.into_values().collect(),
            seen: HashSet::new(),
            rng,
        }
    }

    fn draw(&mut self) -> Option<ClusterConnectionInfo> {
        let tier = self.tiers.front()?;
        let weighted: Vec<(&String, i64)> = tier
            .iter()
            .filter(|(cluster, _)| !self.seen.contains(*cluster))
            .map(|(cluster, policies)| {
                let sum: i64 = policies.iter().map(|p| i64::from(p.weight)).sum();
                (cluster, sum / policies.len().max(1) as i64)
            })
            .collect();

        let total: i64 = weighted.iter().map(|(_, weight)| weight).sum();
        if total <= 0 {
            return None;
        }

        let mut pick = self.rng.gen_range(0..total);
        let (cluster, _) = weighted.into_iter().find(|(_, weight)| {
            if pick < *weight {
                true
            } else {
                pick -= weight;
                false
            }
        })?;

        let info = tier.get(cluster)?.first()?.connection_info.clone();
        self.seen.insert(cluster.clone());
        Some(info)
    }
}

impl<R: Rng> Iterator for ConnectionInfoIterator<R> {
    type Item = ClusterConnectionInfo;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.tiers.is_empty() {
            match self.draw() {
                Some(info) => return Some(info),
                None => {
                    self.tiers.pop_front();
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn policy(priority: i32, weight: i32, cluster: &str) -> GameServerAllocationPolicy {
        GameServerAllocationPolicy::new(
            cluster,
            GameServerAllocationPolicySpec {
                priority,
                weight,
                connection_info: ClusterConnectionInfo {
                    cluster_name: cluster.into(),
                    allocation_endpoints: vec![format!("{cluster}.example.com")],
                    secret_name: format!("{cluster}-secret"),
                    namespace: "default".into(),
                    server_ca: None,
                },
            },
        )
    }

    fn clusters(policies: &[GameServerAllocationPolicy], seed: u64) -> Vec<String> {
        ConnectionInfoIterator::with_rng(policies, StdRng::seed_from_u64(seed))
            .map(|info| info.cluster_name)
            .collect()
    }

    #[test]
    fn single_policy() {
        let policies = [policy(1, 100, "cluster1")];
        let infos: Vec<_> = ConnectionInfoIterator::new(&policies).collect();
        assert_eq!(vec![policies[0].spec.connection_info.clone()], infos);
    }

    #[test]
    fn same_cluster_only_at_lowest_priority() {
        let policies = [policy(1, 100, "cluster-name"), policy(2, 300, "cluster-name")];
        assert_eq!(vec!["cluster-name".to_owned()], clusters(&policies, 1));
    }

    #[test]
    fn same_cluster_same_priority_uses_first_connection() {
        let mut second = policy(1, 300, "cluster-name");
        second.spec.connection_info.namespace = "other".into();
        let policies = [policy(1, 100, "cluster-name"), second];

        let infos: Vec<_> = ConnectionInfoIterator::new(&policies).collect();
        assert_eq!(1, infos.len());
        assert_eq!("default", infos[0].namespace);
    }

    #[test]
    fn priorities_are_ascending() {
        let policies = [policy(2, 100, "cluster2"), policy(1, 300, "cluster1")];
        for seed in 0..10 {
            assert_eq!(vec!["cluster1", "cluster2"], clusters(&policies, seed));
        }
    }

    #[test]
    fn clusters_repeated_across_priorities() {
        let policies = [
            policy(1, 300, "cluster1"),
            policy(1, 100, "cluster2"),
            policy(2, 300, "cluster1"),
            policy(2, 100, "cluster2"),
        ];

        for seed in 0..10 {
            let mut result = clusters(&policies, seed);
            result.sort();
            assert_eq!(vec!["cluster1", "cluster2"], result);
        }
    }

    #[test]
    fn weights_bias_the_draw() {
        let policies = [policy(1, 300, "cluster1"), policy(1, 100, "cluster2")];
        let firsts = (0..400)
            .filter(|seed| clusters(&policies, *seed)[0] == "cluster1")
            .count();

        assert!((240..=360).contains(&firsts), "cluster1 first {firsts} times");
    }

    #[test]
    fn zero_weight_never_chosen() {
        let policies = [policy(1, 0, "cluster1"), policy(1, 100, "cluster2")];
        for seed in 0..20 {
            assert_eq!(vec!["cluster2"], clusters(&policies, seed));
        }
    }

    #[test]
    fn all_zero_tier_is_skipped() {
        let policies = [
            policy(1, 0, "cluster1"),
            policy(1, 0, "cluster2"),
            policy(2, 10, "cluster3"),
        ];
        assert_eq!(vec!["cluster3"], clusters(&policies, 7));
    }

    #[test]
    fn empty_policy_list() {
        assert_eq!(Vec::<String>::new(), clusters(&[], 0));
    }
}
