//! Reflection pipeline: turns a query result into a diagnosis, a corrected
//! query (or `NULL`) and an explanation.

pub mod anomaly;
pub mod cache;
pub mod engine;
pub mod enricher;
pub mod explain;
pub mod field_check;
pub mod rewrite;
pub mod semantic;

pub use anomaly::{Anomaly, AnomalyDetector};
pub use cache::{fingerprint, CacheLayer, CacheStats, StageCache};
pub use engine::{ReflectionEngine, ReflectionVerdict, RefinedSql};
pub use enricher::{ContextEnricher, EnrichmentContext};
pub use explain::ExplanationGenerator;
pub use field_check::find_unknown_terms;
pub use semantic::{CheckOrigin, SemanticCheck, SemanticReflector};
