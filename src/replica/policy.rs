// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replica load-balancing policies.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// How a replica is picked among the eligible candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingPolicy {
    /// Rotate through candidates.
    #[default]
    RoundRobin,
    /// Uniform pick among the two lowest-EWMA candidates.
    LatencyBased,
    /// Weighted random draw, weight = 1 / priority rank.
    WeightedPriority,
}

impl std::fmt::Display for LoadBalancingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RoundRobin => write!(f, "round_robin"),
            Self::LatencyBased => write!(f, "latency_based"),
            Self::WeightedPriority => write!(f, "weighted_priority"),
        }
    }
}

/// What a policy sees of a replica.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub replica_id: &'a str,
    pub priority: u32,
    /// `None` until the replica has served a query; ranks as fastest.
    pub ewma_latency: Option<Duration>,
}

/// Stateful selector for one policy.
#[derive(Debug)]
pub struct ReplicaSelector {
    policy: LoadBalancingPolicy,
    cursor: AtomicUsize,
}

impl ReplicaSelector {
    pub fn new(policy: LoadBalancingPolicy) -> Self {
        Self {
            policy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn policy(&self) -> LoadBalancingPolicy {
        self.policy
    }

    /// Pick an index into `candidates`. `None` only when it is empty.
    pub fn select(&self, candidates: &[Candidate<'_>]) -> Option<usize> {
        match candidates.len() {
            0 => None,
            1 => Some(0),
            len => Some(match self.policy {
                LoadBalancingPolicy::RoundRobin => self.cursor.fetch_add(1, Ordering::Relaxed) % len,
                LoadBalancingPolicy::LatencyBased => latency_based(candidates),
                LoadBalancingPolicy::WeightedPriority => weighted_priority(candidates),
            }),
        }
    }
}

fn latency_based(candidates: &[Candidate<'_>]) -> usize {
    let mut ranked: Vec<usize> = (0..candidates.len()).collect();
    ranked.sort_by_key(|i| candidates[*i].ewma_latency.unwrap_or(Duration::ZERO));
    let pool = ranked.len().min(2);
    ranked[rand::rng().random_range(0..pool)]
}

fn weighted_priority(candidates: &[Candidate<'_>]) -> usize {
    let weights: Vec<f64> = candidates
        .iter()
        .map(|c| 1.0 / f64::from(c.priority.max(1)))
        .collect();
    let total: f64 = weights.iter().sum();
    let mut draw = rand::rng().random::<f64>() * total;
    for (i, weight) in weights.iter().enumerate() {
        if draw < *weight {
            return i;
        }
        draw -= weight;
    }
    // Float rounding
    candidates.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn candidates() -> Vec<Candidate<'static>> {
        vec![
            Candidate {
                replica_id: "r1",
                priority: 1,
                ewma_latency: Some(Duration::from_millis(50)),
            },
            Candidate {
                replica_id: "r2",
                priority: 2,
                ewma_latency: Some(Duration::from_millis(5)),
            },
            Candidate {
                replica_id: "r3",
                priority: 4,
                ewma_latency: Some(Duration::from_millis(10)),
            },
        ]
    }

    #[test]
    fn test_default_policy() {
        assert_eq!(LoadBalancingPolicy::default(), LoadBalancingPolicy::RoundRobin);
        let parsed: LoadBalancingPolicy = serde_json::from_str("\"latency_based\"").unwrap();
        assert_eq!(parsed, LoadBalancingPolicy::LatencyBased);
        assert_eq!(LoadBalancingPolicy::WeightedPriority.to_string(), "weighted_priority");
    }

    #[test]
    fn test_empty_and_single() {
        let selector = ReplicaSelector::new(LoadBalancingPolicy::WeightedPriority);
        assert_eq!(selector.select(&[]), None);
        assert_eq!(selector.select(&candidates()[..1]), Some(0));
    }

    #[test]
    fn test_round_robin_rotates() {
        let selector = ReplicaSelector::new(LoadBalancingPolicy::RoundRobin);
        let candidates = candidates();
        let picks: Vec<usize> = (0..6).map(|_| selector.select(&candidates).unwrap()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_latency_based_prefers_two_fastest() {
        let selector = ReplicaSelector::new(LoadBalancingPolicy::LatencyBased);
        let candidates = candidates();
        let mut seen = HashMap::new();
        for _ in 0..500 {
            let pick = candidates[selector.select(&candidates).unwrap()].replica_id;
            *seen.entry(pick).or_insert(0) += 1;
        }
        assert!(!seen.contains_key("r1"));
        assert!(seen["r2"] > 0);
        assert!(seen["r3"] > 0);
    }

    #[test]
    fn test_weighted_priority_favours_rank_one() {
        let selector = ReplicaSelector::new(LoadBalancingPolicy::WeightedPriority);
        let candidates = candidates();
        let mut counts = [0usize; 3];
        for _ in 0..7_000 {
            counts[selector.select(&candidates).unwrap()] += 1;
        }
        // Expected shares 4/7, 2/7, 1/7
        assert!(counts[0] > counts[1]);
        assert!(counts[1] > counts[2]);
        assert!(counts[2] > 0);
    }
}
