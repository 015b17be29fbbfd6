//! Candidate ordering for load-balanced dispatch.
//!
//! Each healthy instance is ranked independently on average load, latency
//! and throughput; the composite of the three rank indices, the configured
//! weight and a stochastic factor decides the attempt order.

use std::cmp::Ordering;
use std::collections::HashMap;

use rand::Rng;

use crate::catalog::Instance;
use crate::errors::{ProxyError, Result};

fn rank_index_by<F>(instances: &[Instance], metric: F) -> HashMap<i64, usize>
where
    F: Fn(&Instance) -> f64,
{
    let mut order: Vec<&Instance> = instances.iter().collect();
    order.sort_by(|a, b| {
        metric(b)
            .partial_cmp(&metric(a))
            .unwrap_or(Ordering::Equal)
    });
    order
        .iter()
        .enumerate()
        .map(|(idx, inst)| (inst.id, idx))
        .collect()
}

/// Orders healthy instances for dispatch.
///
/// Zero healthy instances is a service-unavailable; a single one returns
/// as-is. The per-metric sorts are all descending and the composite is
/// ordered descending, mirroring the platform's established ranking.
pub fn rank_instances(instances: Vec<Instance>) -> Result<Vec<Instance>> {
    let mut connected: Vec<Instance> = instances.into_iter().filter(|i| i.connected).collect();
    if connected.is_empty() {
        return Err(ProxyError::ServiceUnavailable(
            "service has no available instance".to_string(),
        ));
    }
    if connected.len() == 1 {
        return Ok(connected);
    }

    let by_load = rank_index_by(&connected, |i| i.avg_load);
    let by_time = rank_index_by(&connected, |i| i.avg_time);
    let by_rps = rank_index_by(&connected, |i| i.avg_rps);

    let mut rng = rand::thread_rng();
    let mut scores: HashMap<i64, f64> = HashMap::new();
    for inst in &connected {
        let rank_sum = (by_load[&inst.id] + by_time[&inst.id] + by_rps[&inst.id] + 1) as f64;
        // stochastic factor keeps equally-ranked instances from always
        // landing in the same order
        scores.insert(inst.id, rank_sum * inst.weight * rng.gen_range(0.8..1.2));
    }

    connected.sort_by(|a, b| {
        scores[&b.id]
            .partial_cmp(&scores[&a.id])
            .unwrap_or(Ordering::Equal)
    });
    Ok(connected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: i64, weight: f64, load: f64, time: f64, rps: f64) -> Instance {
        Instance {
            id,
            service_id: 1,
            host: "10.0.0.1".to_string(),
            port: Some(8000),
            address: format!("10.0.0.{}:8000", id),
            base_url: format!("http://10.0.0.{}:8000", id),
            ops_api: format!("http://10.0.0.{}:8000/ops", id),
            resource_id: format!("ins-{}", id),
            server_id: None,
            remote_id: None,
            weight,
            connected: true,
            public: false,
            version: "1.0.0".to_string(),
            version_major: 1,
            version_minor: 0,
            version_patch: 0,
            asynchronous: false,
            production: false,
            language: "python".to_string(),
            language_version: None,
            utilmeta_version: "2.6.0".to_string(),
            backend: "django".to_string(),
            backend_version: None,
            cwd: None,
            created_time: 0,
            deprecated: false,
            resources: None,
            resources_etag: None,
            data: serde_json::Value::Null,
            avg_load: load,
            avg_time: time,
            avg_rps: rps,
        }
    }

    #[test]
    fn zero_healthy_is_service_unavailable() {
        let mut lone = instance(1, 1.0, 0.0, 0.0, 0.0);
        lone.connected = false;
        assert!(matches!(
            rank_instances(vec![lone]),
            Err(ProxyError::ServiceUnavailable(_))
        ));
    }

    #[test]
    fn single_healthy_returns_it() {
        let ranked = rank_instances(vec![instance(1, 1.0, 5.0, 10.0, 3.0)]).unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].id, 1);
    }

    #[test]
    fn disconnected_instances_are_dropped() {
        let mut down = instance(2, 1.0, 0.0, 0.0, 0.0);
        down.connected = false;
        let ranked =
            rank_instances(vec![instance(1, 1.0, 1.0, 1.0, 1.0), down]).unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].id, 1);
    }

    #[test]
    fn ranking_preserves_the_candidate_set() {
        let ranked = rank_instances(vec![
            instance(1, 1.0, 3.0, 20.0, 9.0),
            instance(2, 1.0, 1.0, 50.0, 2.0),
            instance(3, 1.0, 7.0, 10.0, 4.0),
        ])
        .unwrap();
        let mut ids: Vec<i64> = ranked.iter().map(|i| i.id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn dominant_weight_always_ranks_first() {
        // the stochastic factor spans [0.8, 1.2); a 100x weight gap cannot
        // be crossed by it
        for _ in 0..20 {
            let ranked = rank_instances(vec![
                instance(1, 1.0, 1.0, 1.0, 1.0),
                instance(2, 100.0, 1.0, 1.0, 1.0),
            ])
            .unwrap();
            assert_eq!(ranked[0].id, 2);
        }
    }
}
