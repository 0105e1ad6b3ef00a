//! Measurement fusion for one peer
//!
//! Combines concurrent per-technology measurement streams into the single
//! stream reported to the client. Two policies: pass-through (first live
//! source forwarded unfiltered) and filtering through a pluggable strategy.
//! Fusion is synchronous and non-blocking; the orchestrator never waits on
//! it.

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::config::FusionPolicy;
use crate::types::{RangingMeasurement, Technology, TechnologySet};

// ----------------------------------------------------------------------------
// Fusion Strategy
// ----------------------------------------------------------------------------

/// Pluggable blending strategy for the filtering policy.
///
/// `fuse` is called for every inbound measurement and may or may not yield an
/// output synchronously. Implementations must be fast and non-blocking.
pub trait FusionStrategy: Send {
    fn fuse(
        &mut self,
        sources: &TechnologySet,
        measurement: &RangingMeasurement,
    ) -> Option<RangingMeasurement>;

    /// Release any buffered state
    fn reset(&mut self);
}

/// Default filtering strategy: exponentially blends distances across live
/// sources, weighted by the global technology priority, and reports on every
/// measurement from the highest-priority live source.
pub struct PriorityWeightedStrategy {
    last_per_source: HashMap<Technology, f64>,
    blended: Option<f64>,
}

impl PriorityWeightedStrategy {
    const HIGH_PRIORITY_WEIGHT: f64 = 0.8;

    pub fn new() -> Self {
        Self {
            last_per_source: HashMap::new(),
            blended: None,
        }
    }
}

impl Default for PriorityWeightedStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl FusionStrategy for PriorityWeightedStrategy {
    fn fuse(
        &mut self,
        sources: &TechnologySet,
        measurement: &RangingMeasurement,
    ) -> Option<RangingMeasurement> {
        self.last_per_source
            .insert(measurement.technology, measurement.distance_m);

        let primary = sources.highest_priority()?;
        let weight = if measurement.technology == primary {
            Self::HIGH_PRIORITY_WEIGHT
        } else {
            1.0 - Self::HIGH_PRIORITY_WEIGHT
        };

        let blended = match self.blended {
            Some(previous) => previous * (1.0 - weight) + measurement.distance_m * weight,
            None => measurement.distance_m,
        };
        self.blended = Some(blended);

        // Only the primary source's cadence drives the output stream
        if measurement.technology != primary {
            return None;
        }

        let mut fused = measurement.clone();
        fused.distance_m = blended;
        Some(fused)
    }

    fn reset(&mut self) {
        self.last_per_source.clear();
        self.blended = None;
    }
}

// ----------------------------------------------------------------------------
// Fusion Engine
// ----------------------------------------------------------------------------

enum EngineMode {
    /// Forward the first live source unfiltered
    PassThrough { active: Option<Technology> },
    /// Blend through the configured strategy
    Filtering { strategy: Box<dyn FusionStrategy> },
}

/// Owns the active data-source set for one peer and applies the configured
/// fusion policy to every inbound measurement.
pub struct FusionEngine {
    sources: TechnologySet,
    mode: EngineMode,
    fed: u64,
    emitted: u64,
}

impl FusionEngine {
    /// Engine with the given policy; filtering uses the default strategy
    pub fn new(policy: FusionPolicy) -> Self {
        match policy {
            FusionPolicy::PassThrough => Self::pass_through(),
            FusionPolicy::Filtering => {
                Self::with_strategy(Box::new(PriorityWeightedStrategy::new()))
            }
        }
    }

    pub fn pass_through() -> Self {
        Self {
            sources: TechnologySet::empty(),
            mode: EngineMode::PassThrough { active: None },
            fed: 0,
            emitted: 0,
        }
    }

    pub fn with_strategy(strategy: Box<dyn FusionStrategy>) -> Self {
        Self {
            sources: TechnologySet::empty(),
            mode: EngineMode::Filtering { strategy },
            fed: 0,
            emitted: 0,
        }
    }

    /// Register a live source. Does not disturb in-flight feeds.
    pub fn add_source(&mut self, technology: Technology) {
        self.sources.insert(technology);
    }

    /// Remove a source. A pass-through engine locked onto this source
    /// re-locks onto the next live one.
    pub fn remove_source(&mut self, technology: Technology) {
        self.sources.remove(technology);
        if let EngineMode::PassThrough { active } = &mut self.mode {
            if *active == Some(technology) {
                *active = None;
            }
        }
    }

    pub fn sources(&self) -> SmallVec<[Technology; 4]> {
        self.sources.iter().collect()
    }

    /// Feed one inbound measurement; may synchronously yield a fused output.
    pub fn feed(&mut self, measurement: &RangingMeasurement) -> Option<RangingMeasurement> {
        if !self.sources.contains(measurement.technology) {
            return None;
        }
        self.fed += 1;

        let output = match &mut self.mode {
            EngineMode::PassThrough { active } => {
                let locked = *active.get_or_insert(measurement.technology);
                (measurement.technology == locked).then(|| measurement.clone())
            }
            EngineMode::Filtering { strategy } => strategy.fuse(&self.sources, measurement),
        };

        if output.is_some() {
            self.emitted += 1;
        }
        output
    }

    /// Release buffered state
    pub fn stop(&mut self) {
        self.sources = TechnologySet::empty();
        match &mut self.mode {
            EngineMode::PassThrough { active } => *active = None,
            EngineMode::Filtering { strategy } => strategy.reset(),
        }
    }

    pub fn measurements_emitted(&self) -> u64 {
        self.emitted
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
