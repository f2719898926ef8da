pub mod folder;
pub mod prefetch;
pub mod schedule;
pub mod transform;

pub use folder::TensorFolder;
pub use prefetch::{PlanEntry, PrefetchItem, Prefetcher};
pub use schedule::{load_minimizer, StepSchedule};
pub use transform::{eval_view, ViewSampler};
