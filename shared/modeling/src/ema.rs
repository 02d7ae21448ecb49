use thiserror::Error;

#[derive(Debug, Error)]
#[error("EMA shadow shape mismatch: expected {expected} values, got {got}")]
pub struct EmaShapeError {
    pub expected: usize,
    pub got: usize,
}

/// Exponential-moving-average shadow of the model parameters.
///
/// Updated once per *applied* optimizer step; skipped/overflowed windows
/// leave the shadow untouched. The shadow lives for the lifetime of the
/// optimizer wrapper and is reset only when the wrapper is re-created.
pub struct EmaShadow {
    decay: f64,
    shadow: Vec<f32>,
}

impl EmaShadow {
    /// Initialize the shadow as a copy of the live parameters.
    pub fn new(decay: f64, params: &[f32]) -> Self {
        Self {
            decay,
            shadow: params.to_vec(),
        }
    }

    pub fn update(&mut self, params: &[f32]) {
        let decay = self.decay as f32;
        for (s, &p) in self.shadow.iter_mut().zip(params) {
            *s = decay * *s + (1.0 - decay) * p;
        }
    }

    pub fn shadow(&self) -> &[f32] {
        &self.shadow
    }

    pub fn restore(&mut self, shadow: Vec<f32>) -> Result<(), EmaShapeError> {
        if shadow.len() != self.shadow.len() {
            return Err(EmaShapeError {
                expected: self.shadow.len(),
                got: shadow.len(),
            });
        }
        self.shadow = shadow;
        Ok(())
    }
}
