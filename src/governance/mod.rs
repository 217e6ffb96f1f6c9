pub mod gate;
pub mod models;
pub mod resolver;
pub mod routes;

pub use models::{EnforcementLevel, PolicyRules, PolicyScope, ScanGrade};
pub use resolver::{resolve_effective_policy, EffectivePolicy};
pub use routes::routes;
