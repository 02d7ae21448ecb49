mod dummy;
mod ema;
mod loss_scale;
mod model;
mod optimizer;
mod trainer;

pub use dummy::DummyModel;
pub use ema::{EmaShadow, EmaShapeError};
pub use loss_scale::{LossScaleState, LossScaler};
pub use model::{Backward, Evaluator, Model, ModelError};
pub use optimizer::{Optimizer, OptimizerMoments, OptimizerStateError};
pub use trainer::{RestoreError, StepOutcome, StepperSnapshot, TrainStepper};
