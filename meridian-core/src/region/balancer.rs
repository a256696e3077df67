//! Region placement scoring

use super::registry::RegionRegistry;
use crate::error::PlacementError;
use crate::models::configuration::BalancerSettings;
use crate::models::region::{HealthStatus, RegionConfig, RegionId, RegionMetrics};
use serde::Serialize;
use std::cmp::Ordering;

/// Scored placement candidate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionScore {
    pub region: RegionId,
    pub score: f64,
    pub load: u32,
}

/// Picks the best healthy region for new or moved work
#[derive(Debug, Clone)]
pub struct GlobalLoadBalancer {
    settings: BalancerSettings,
}

impl GlobalLoadBalancer {
    pub fn new(settings: BalancerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &BalancerSettings {
        &self.settings
    }

    /// Weighted score in [0, 1]; every component is an inverse in [0, 1].
    /// `latency_ms` is the latency from the requester; an unmeasured link
    /// scores as the reference latency.
    pub fn score(&self, config: &RegionConfig, metrics: &RegionMetrics, latency_ms: Option<f64>) -> f64 {
        let load_score = if config.capacity == 0 {
            0.0
        } else {
            1.0 - (metrics.current_load as f64 / config.capacity as f64).clamp(0.0, 1.0)
        };
        let error_score = 1.0 - metrics.error_rate.clamp(0.0, 1.0);
        let reference = self.settings.latency_reference_ms.max(f64::EPSILON);
        let latency = latency_ms.map_or(reference, |ms| ms.max(0.0));
        let latency_score = reference / (reference + latency);

        let s = &self.settings;
        let total_weight = s.load_weight + s.error_weight + s.latency_weight;
        if total_weight <= 0.0 {
            return 0.0;
        }
        (s.load_weight * load_score + s.error_weight * error_score + s.latency_weight * latency_score)
            / total_weight
    }

    /// Score and sort candidates, best first. Ties go to the lower load, then
    /// the lower region id.
    pub fn rank<'a>(
        &self,
        candidates: impl IntoIterator<Item = (&'a RegionConfig, &'a RegionMetrics, Option<f64>)>,
    ) -> Vec<RegionScore> {
        let mut scores: Vec<RegionScore> = candidates
            .into_iter()
            .map(|(config, metrics, latency)| RegionScore {
                region: config.id.clone(),
                score: self.score(config, metrics, latency),
                load: metrics.current_load,
            })
            .collect();
        scores.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(a.load.cmp(&b.load))
                .then_with(|| a.region.cmp(&b.region))
        });
        scores
    }

    /// Best HEALTHY region of the registry accepted by `eligible`, scored
    /// with the latency observed from `requester`.
    /// Scores use the freshest metrics on every call.
    pub fn place(
        &self,
        registry: &RegionRegistry,
        requester: &str,
        eligible: impl Fn(&str) -> bool,
    ) -> Result<RegionScore, PlacementError> {
        let candidates: Vec<(RegionConfig, RegionMetrics, Option<f64>)> = registry
            .regions_in(HealthStatus::Healthy)
            .into_iter()
            .filter(|id| eligible(id))
            .filter_map(|id| {
                let config = registry.config(&id)?;
                let metrics = registry
                    .metrics(&id)
                    .unwrap_or_else(|| RegionMetrics::new(id.clone(), 0, 0.0));
                let latency = registry.latency(requester, &id);
                Some((config, metrics, latency))
            })
            .collect();

        let best = self
            .rank(candidates.iter().map(|(c, m, l)| (c, m, *l)))
            .into_iter()
            .next()
            .ok_or(PlacementError::NoHealthyRegion)?;
        tracing::debug!(region = %best.region, requester, score = best.score, "Placement chosen");
        Ok(best)
    }
}

impl Default for GlobalLoadBalancer {
    fn default() -> Self {
        Self::new(BalancerSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(id: &str, capacity: u32) -> RegionConfig {
        RegionConfig::new(id, format!("http://{}", id), capacity)
    }

    #[test]
    fn test_score_prefers_idle_reliable_close_regions() {
        let balancer = GlobalLoadBalancer::default();
        let c = config("eu", 100);
        let metrics = RegionMetrics::new("eu", 0, 0.0);
        let idle = balancer.score(&c, &metrics, Some(0.0));
        let busy = balancer.score(&c, &RegionMetrics::new("eu", 90, 0.0), Some(0.0));
        let flaky = balancer.score(&c, &RegionMetrics::new("eu", 0, 0.5), Some(0.0));
        let far = balancer.score(&c, &metrics, Some(400.0));
        let unmeasured = balancer.score(&c, &metrics, None);

        assert!((idle - 1.0).abs() < 1e-9);
        assert!(busy < idle);
        assert!(flaky < idle);
        assert!(far < unmeasured && unmeasured < idle);
        assert!((0.0..=1.0).contains(&busy));
    }

    #[test]
    fn test_rank_tie_breaks() {
        let balancer = GlobalLoadBalancer::default();
        let (a, b, c) = (config("b-region", 10), config("a-region", 10), config("c-region", 20));
        let ma = RegionMetrics::new("b-region", 5, 0.0);
        let mb = RegionMetrics::new("a-region", 5, 0.0);
        let mc = RegionMetrics::new("c-region", 10, 0.0);

        // All three score the same: half capacity used
        let ranked = balancer.rank([(&a, &ma, None), (&b, &mb, None), (&c, &mc, None)]);
        let order: Vec<&str> = ranked.iter().map(|s| s.region.as_str()).collect();
        assert_eq!(order, vec!["a-region", "b-region", "c-region"]);
    }

    #[test]
    fn test_place_skips_unhealthy() {
        let registry = RegionRegistry::new(Duration::from_millis(100), 3, 0.25).unwrap();
        let now = chrono::Utc::now();
        registry.register_at(config("eu", 10), now);
        registry.register_at(config("us", 10), now);
        registry.report(RegionMetrics::new("eu", 0, 0.9).reported_at(now));
        registry.report(RegionMetrics::new("us", 8, 0.0).reported_at(now));

        let balancer = GlobalLoadBalancer::default();
        assert_eq!(balancer.place(&registry, "us", |_| true).unwrap().region, "us");
        assert_eq!(
            balancer.place(&registry, "us", |id| id != "us").unwrap_err(),
            PlacementError::NoHealthyRegion
        );
    }

    #[test]
    fn test_placement_follows_latency_from_the_requester() {
        let registry = RegionRegistry::new(Duration::from_millis(100), 3, 0.25).unwrap();
        let now = chrono::Utc::now();
        for id in ["ap", "eu", "us"] {
            registry.register_at(config(id, 10), now);
        }
        registry.report(RegionMetrics::new("eu", 2, 0.0).reported_at(now));
        registry.report(RegionMetrics::new("us", 2, 0.0).reported_at(now));
        registry.report(
            RegionMetrics::new("ap", 9, 0.0)
                .with_latency("eu", 20.0)
                .with_latency("us", 400.0)
                .reported_at(now),
        );
        registry.observe_round_trip("us", "eu", Duration::from_millis(400));

        let balancer = GlobalLoadBalancer::default();
        let elsewhere = |id: &str| id != "ap";
        assert_eq!(balancer.place(&registry, "ap", elsewhere).unwrap().region, "eu");
        assert_eq!(balancer.place(&registry, "us", elsewhere).unwrap().region, "us");

        registry.observe_round_trip("ap", "us", Duration::from_millis(5));
        registry.observe_round_trip("ap", "eu", Duration::from_millis(600));
        assert_eq!(balancer.place(&registry, "ap", elsewhere).unwrap().region, "us");
    }
}
