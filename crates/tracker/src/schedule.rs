use std::collections::{BTreeMap, BTreeSet};
use serde::{Deserialize, Serialize};
use crate::progress_log::EstimatedRemaining;

/// Static description of a pipeline: per-stage weights, names and which stages may be skipped.
///
/// Stage indices run from 1 to N. Stage 0 means "not started / failed" and N+1 means
/// "complete"; both only carry a label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSchedule {
    pub weights: BTreeMap<u32, f64>,
    pub names: BTreeMap<u32, String>,
    pub skippable: BTreeSet<u32>,
    pub start_label: String,
    pub finish_label: String,
}

/// Request to skip one stage for a particular task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipRequest {
    pub stage: u32,
    pub reason: String,
}

impl SkipRequest {
    pub fn new(stage: u32, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
        }
    }
}

/// A stage as it applies to one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageDescriptor {
    Normal {
        name: String,
        weight: f64,
    },
    Skipped {
        name: String,
        reason: String,
        original_weight: f64,
    },
}

impl StageDescriptor {
    pub fn name(&self) -> &str {
        match self {
            StageDescriptor::Normal { name, .. } | StageDescriptor::Skipped { name, .. } => name,
        }
    }

    /// Name as shown to users; skipped stages carry their reason
    pub fn display_name(&self) -> String {
        match self {
            StageDescriptor::Normal { name, .. } => name.clone(),
            StageDescriptor::Skipped { name, reason, .. } => format!("{} ({})", name, reason),
        }
    }

    /// Effective weight, zero for skipped stages
    pub fn weight(&self) -> f64 {
        match self {
            StageDescriptor::Normal { weight, .. } => *weight,
            StageDescriptor::Skipped { .. } => 0.0,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, StageDescriptor::Skipped { .. })
    }

    fn set_name(&mut self, new_name: &str) {
        match self {
            StageDescriptor::Normal { name, .. } | StageDescriptor::Skipped { name, .. } => {
                *name = new_name.to_string();
            }
        }
    }

    fn into_skipped(self, reason: &str) -> Self {
        match self {
            StageDescriptor::Normal { name, weight } => StageDescriptor::Skipped {
                name,
                reason: reason.to_string(),
                original_weight: weight,
            },
            StageDescriptor::Skipped { name, original_weight, .. } => StageDescriptor::Skipped {
                name,
                reason: reason.to_string(),
                original_weight,
            },
        }
    }
}

/// Per-task time budget: the schedule scaled by the observed media duration
#[derive(Debug, Clone, PartialEq)]
pub struct TimeBudget {
    /// Observed media duration in seconds, 0 when the probe failed
    pub observed_duration: f64,
    /// Number of stages, skipped ones included
    pub total_stages: u32,
    pub stages: BTreeMap<u32, StageDescriptor>,
    /// Absolute second estimates per stage
    pub estimates: BTreeMap<u32, f64>,
    pub start_label: String,
    pub finish_label: String,
    /// Skippable stages and whether they were skipped for this task
    pub dynamic_steps: BTreeMap<u32, bool>,
}

/// Scale a step schedule by the observed duration, honouring skip requests.
///
/// Pure and deterministic. A negative or non-finite duration is treated as unknown (0),
/// which makes every estimate 0. Skip requests for stages the schedule does not declare
/// are ignored.
pub fn compute_schedule(observed_duration: f64, schedule: &StepSchedule, skips: &[SkipRequest]) -> TimeBudget {
    let observed_duration = if observed_duration.is_finite() && observed_duration > 0.0 {
        observed_duration
    } else {
        0.0
    };

    let mut stages = BTreeMap::new();
    for (&stage, &weight) in &schedule.weights {
        let name = schedule
            .names
            .get(&stage)
            .cloned()
            .unwrap_or_else(|| format!("Stage {}", stage));
        stages.insert(stage, StageDescriptor::Normal { name, weight: weight.max(0.0) });
    }

    for skip in skips {
        if let Some(descriptor) = stages.remove(&skip.stage) {
            stages.insert(skip.stage, descriptor.into_skipped(&skip.reason));
        }
    }

    let estimates = stages
        .iter()
        .map(|(&stage, descriptor)| (stage, observed_duration * descriptor.weight()))
        .collect();

    let dynamic_steps = schedule
        .skippable
        .iter()
        .map(|&stage| (stage, stages.get(&stage).is_some_and(StageDescriptor::is_skipped)))
        .collect();

    TimeBudget {
        observed_duration,
        total_stages: stages.len() as u32,
        stages,
        estimates,
        start_label: schedule.start_label.clone(),
        finish_label: schedule.finish_label.clone(),
        dynamic_steps,
    }
}

impl TimeBudget {
    /// Sum of every stage estimate
    pub fn total_estimate(&self) -> f64 {
        self.estimates.values().sum()
    }

    pub fn estimate_for(&self, stage: u32) -> Option<f64> {
        self.estimates.get(&stage).copied()
    }

    /// Display name for any stage index, including the start and finish markers
    pub fn name_for(&self, stage: u32) -> String {
        if stage == 0 {
            return self.start_label.clone();
        }
        if stage == self.total_stages + 1 {
            return self.finish_label.clone();
        }
        self.stages
            .get(&stage)
            .map(StageDescriptor::display_name)
            .unwrap_or_else(|| "in progress".to_string())
    }

    /// Overwrite the display name of a stage. Unknown indices are ignored.
    pub fn rename(&mut self, stage: u32, name: &str) {
        if stage == 0 {
            self.start_label = name.to_string();
        } else if stage == self.total_stages + 1 {
            self.finish_label = name.to_string();
        } else if let Some(descriptor) = self.stages.get_mut(&stage) {
            descriptor.set_name(name);
        }
    }

    /// Mark a declared stage as skipped: its estimate becomes 0 and its name records the
    /// reason. The stage count never changes. Returns `false` for undeclared stages.
    pub fn skip(&mut self, stage: u32, reason: &str) -> bool {
        let Some(descriptor) = self.stages.remove(&stage) else {
            return false;
        };
        self.stages.insert(stage, descriptor.into_skipped(reason));
        self.estimates.insert(stage, 0.0);
        if let Some(flag) = self.dynamic_steps.get_mut(&stage) {
            *flag = true;
        }
        true
    }

    /// Estimate the time left once `current` is the active stage.
    ///
    /// Whole-stage granularity: the estimates of every stage after `current` are summed,
    /// then scaled by `elapsed / total_estimate` to correct for the pipeline running
    /// faster or slower than predicted. At stage 0 the uncorrected total is reported.
    pub fn remaining(&self, current: u32, elapsed_secs: f64) -> EstimatedRemaining {
        let total = self.total_estimate();
        if total <= 0.0 || !total.is_finite() {
            return EstimatedRemaining::unknown();
        }
        if current == 0 {
            return EstimatedRemaining::from_seconds(total);
        }

        let pending: f64 = self
            .estimates
            .iter()
            .filter(|(&stage, _)| stage > current)
            .map(|(_, &secs)| secs)
            .sum();
        let factor = elapsed_secs.max(0.0) / total;

        EstimatedRemaining::from_seconds(pending * factor)
    }
}
