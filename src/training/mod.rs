pub mod adapt;
pub mod engine;
pub mod evaluate;
pub mod optimizer;
pub mod reinit;

pub use adapt::{AdaptationUnit, MicroStep};
pub use engine::{Engine, RunOutcome};
pub use evaluate::{Evaluation, EvaluationUnit};
pub use optimizer::{LossScaler, Optimizer, OptimizerKind, OptimizerState, ScalerState};
pub use reinit::ReinitializationPolicy;
