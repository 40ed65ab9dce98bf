pub mod error;
pub mod types;
pub mod retry;
pub mod schema;
pub mod lang; // statement grammar and AST
pub mod expression; // store-native condition/update expressions
pub mod eval; // local predicate evaluation and update application
pub mod planner;
pub mod throttle;
pub mod cache;
pub mod config;

pub use error::{Error, Result};
pub use types::*;
pub use schema::{GlobalIndex, IndexProjection, KeyAttribute, KeyType, LocalIndex, TableMeta, Throughput};
pub use planner::{Plan, PlanKind, Planner, PlannerOptions};
pub use config::EngineConfig;
