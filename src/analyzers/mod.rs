//! Analyzer integration: tool registry, service client, response
//! normalization, and the reachability cache.

pub mod client;
pub mod health;
pub mod normalize;
pub mod registry;

pub use client::{AnalyzerClient, AnalyzerError, AnalyzerRequest, HttpAnalyzerClient, RawAnalyzerResponse};
pub use health::HealthCache;
pub use normalize::{normalize, NormalizeOptions, NormalizedResult, RunStatus, ToolOutcome, ToolStatus};
pub use registry::{RegistryError, ServiceKind, ToolRegistry};
