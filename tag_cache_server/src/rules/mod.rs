pub mod evaluation;
pub mod resolver;

pub use evaluation::{recompute_rule, RuleEvaluator};
pub use resolver::RuleDependencyResolver;
