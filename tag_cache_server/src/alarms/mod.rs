pub mod evaluator;
pub mod structures;

pub use evaluator::{AlarmEvaluator, AlarmOutcome, AlarmUpdate, AlarmUpdateListener};
pub use structures::{Alarm, AlarmCondition, AlarmPublication, AlarmState};
