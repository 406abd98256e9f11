//! Anchor-side handover: explicit commands and link-quality driven moves.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::binding::{FlowBindingRegistry, FlowId, Priority, Target};
use crate::error::BindingError;
use crate::selector::TrafficSelector;

/// Thresholds for link-quality driven handover.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandoverPolicy {
    /// Samples kept per target.
    pub history: usize,
    /// Average SNR below which a flow's current target is considered degraded.
    pub threshold_db: f64,
    /// Margin by which an alternative must beat the current target.
    pub hysteresis_db: f64,
    /// Samples older than this are discarded. Zero keeps them forever.
    pub sample_ttl: Duration,
}

impl Default for HandoverPolicy {
    fn default() -> Self {
        HandoverPolicy {
            history: 10,
            threshold_db: 10.0,
            hysteresis_db: 3.0,
            sample_ttl: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    snr_db: f64,
    at: Instant,
}

/// Moves flows between targets on command or when link quality degrades.
#[derive(Debug)]
pub struct HandoverController<T> {
    policy: HandoverPolicy,
    /// Newest sample first.
    samples: HashMap<T, VecDeque<Sample>>,
}

impl<T: Target> HandoverController<T> {
    pub fn new(policy: HandoverPolicy) -> Self {
        HandoverController {
            policy,
            samples: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &HandoverPolicy {
        &self.policy
    }

    /// Move a flow to `target`.
    ///
    /// Returns whether the target order changed.
    pub fn handover(
        &self,
        registry: &mut FlowBindingRegistry<T>,
        flow_id: FlowId,
        target: T,
    ) -> Result<bool, BindingError> {
        let moved = registry.promote(flow_id, target)?;
        if moved {
            info!(%flow_id, %target, "Handover");
        }
        Ok(moved)
    }

    /// Move the flow bound to exactly `selector` to `target`.
    ///
    /// Returns the flow id, or `None` if nothing is bound to the selector.
    pub fn handover_selector(
        &self,
        registry: &mut FlowBindingRegistry<T>,
        selector: &TrafficSelector,
        target: T,
    ) -> Option<FlowId> {
        let flow_id = registry.lookup(selector)?.flow_id();
        self.handover(registry, flow_id, target).ok()?;
        Some(flow_id)
    }

    /// Renumber all bindings after bulk reordering.
    pub fn reset_priorities(
        &self,
        registry: &mut FlowBindingRegistry<T>,
        start: Priority,
        increment: u32,
    ) -> Result<(), BindingError> {
        registry.reset_priorities(start, increment)
    }

    /// Record an SNR sample for `target` and re-evaluate every binding.
    ///
    /// Returns the flows that were moved.
    pub fn report_link_quality(
        &mut self,
        registry: &mut FlowBindingRegistry<T>,
        target: T,
        snr_db: f64,
        now: Instant,
    ) -> Vec<FlowId> {
        let history = self.policy.history.max(1);
        let samples = self.samples.entry(target).or_default();
        samples.push_front(Sample { snr_db, at: now });
        samples.truncate(history);
        self.prune(now);

        // Decide first, then reorder.
        let moves: Vec<(FlowId, T)> = registry
            .iter()
            .filter_map(|entry| {
                let (current, others) = entry.targets().split_first()?;
                let current_avg = self.average_snr(*current)?;
                if current_avg >= self.policy.threshold_db {
                    return None;
                }
                let (better, better_avg) = others
                    .iter()
                    .filter_map(|t| self.average_snr(*t).map(|avg| (*t, avg)))
                    .max_by(|a, b| a.1.total_cmp(&b.1))?;
                if better_avg < current_avg + self.policy.hysteresis_db {
                    return None;
                }
                debug!(
                    flow_id = %entry.flow_id(),
                    from = %current,
                    to = %better,
                    current_avg,
                    better_avg,
                    "Link quality degraded"
                );
                Some((entry.flow_id(), better))
            })
            .collect();

        moves
            .into_iter()
            .filter(|(flow_id, to)| matches!(self.handover(registry, *flow_id, *to), Ok(true)))
            .map(|(flow_id, _)| flow_id)
            .collect()
    }

    /// Mean of the retained samples for `target`.
    pub fn average_snr(&self, target: T) -> Option<f64> {
        let samples = self.samples.get(&target)?;
        if samples.is_empty() {
            return None;
        }
        let sum: f64 = samples.iter().map(|s| s.snr_db).sum();
        Some(sum / samples.len() as f64)
    }

    /// Most recent sample for `target`.
    pub fn latest_snr(&self, target: T) -> Option<f64> {
        self.samples.get(&target)?.front().map(|s| s.snr_db)
    }

    fn prune(&mut self, now: Instant) {
        let ttl = self.policy.sample_ttl;
        if ttl.is_zero() {
            return;
        }
        for samples in self.samples.values_mut() {
            samples.retain(|s| now.saturating_duration_since(s.at) <= ttl);
        }
        self.samples.retain(|_, samples| !samples.is_empty());
    }
}
