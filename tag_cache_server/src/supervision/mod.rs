pub mod evaluator;
pub mod filter;
pub mod status;

pub use evaluator::{SupervisionChange, SupervisionEvaluator};
pub use filter::NewestWinsFilter;
pub use status::{SupervisionEntity, SupervisionStateTag, SupervisionStatus};
