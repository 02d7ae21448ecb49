use kiln_core::LossScaleSpec;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Loss-scale state persisted inside checkpoints.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LossScaleState {
    pub scale: f64,
    pub good_steps: u32,
}

/// Overflow-aware loss scaling.
///
/// Fixed mode keeps one scale for the whole run. Dynamic mode grows the scale
/// after `growth_interval` consecutive applied steps and backs off on every
/// overflow, never dropping below 1.0, the usual "try to grow, shrink on
/// failure" search for the largest stable scale.
pub struct LossScaler {
    spec: LossScaleSpec,
    scale: f64,
    good_steps: u32,
}

impl LossScaler {
    pub fn new(spec: LossScaleSpec) -> Self {
        let scale = match spec {
            LossScaleSpec::Fixed { scale } => scale,
            LossScaleSpec::Dynamic { init_scale, .. } => init_scale,
        };
        Self {
            spec,
            scale,
            good_steps: 0,
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.spec, LossScaleSpec::Dynamic { .. })
    }

    /// An overflowed window was discarded.
    pub fn on_overflow(&mut self) {
        if let LossScaleSpec::Dynamic { backoff_factor, .. } = self.spec {
            let previous = self.scale;
            self.scale = (self.scale / backoff_factor).max(1.0);
            self.good_steps = 0;
            debug!(
                previous_scale = previous,
                scale = self.scale,
                "gradient overflow, loss scale reduced"
            );
        }
    }

    /// A window was applied successfully.
    pub fn on_applied(&mut self) {
        if let LossScaleSpec::Dynamic {
            growth_factor,
            growth_interval,
            ..
        } = self.spec
        {
            self.good_steps += 1;
            if self.good_steps >= growth_interval {
                self.scale *= growth_factor;
                self.good_steps = 0;
            }
        }
    }

    pub fn state(&self) -> LossScaleState {
        LossScaleState {
            scale: self.scale,
            good_steps: self.good_steps,
        }
    }

    pub fn restore(&mut self, state: LossScaleState) {
        self.scale = state.scale;
        self.good_steps = state.good_steps;
    }
}
