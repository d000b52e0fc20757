//! Tool registry: canonical names, aliases, and service routing.
//!
//! The registry is an immutable value constructed at startup. Every
//! consumer resolves tool names through it; submissions and deduplication
//! use canonical names only, and unknown names are rejected before any
//! network or database call.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Classify, ErrorKind};

/// Errors produced by tool/service resolution.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Tool name (canonical or alias) not known to the registry.
    #[error("Unknown tool '{0}'")]
    UnknownTool(String),

    /// Service name not known to the registry.
    #[error("Unknown analyzer service '{0}'")]
    UnknownService(String),
}

impl Classify for RegistryError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

/// The analyzer services a tool group can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    /// Source-level scanners (linters, SAST).
    StaticAnalyzer,
    /// Probes against the running app (DAST).
    DynamicAnalyzer,
    /// Load and latency measurement.
    PerformanceTester,
    /// Model-driven code review.
    AiAnalyzer,
}

impl ServiceKind {
    /// All services, in routing order.
    pub fn all() -> [ServiceKind; 4] {
        [
            ServiceKind::StaticAnalyzer,
            ServiceKind::DynamicAnalyzer,
            ServiceKind::PerformanceTester,
            ServiceKind::AiAnalyzer,
        ]
    }

    /// Wire name of the service, as used in analyzer requests.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::StaticAnalyzer => "static-analyzer",
            ServiceKind::DynamicAnalyzer => "dynamic-analyzer",
            ServiceKind::PerformanceTester => "performance-tester",
            ServiceKind::AiAnalyzer => "ai-analyzer",
        }
    }

    /// Parses the wire name.
    pub fn parse(raw: &str) -> Result<Self, RegistryError> {
        match raw {
            "static-analyzer" => Ok(ServiceKind::StaticAnalyzer),
            "dynamic-analyzer" => Ok(ServiceKind::DynamicAnalyzer),
            "performance-tester" => Ok(ServiceKind::PerformanceTester),
            "ai-analyzer" => Ok(ServiceKind::AiAnalyzer),
            other => Err(RegistryError::UnknownService(other.to_string())),
        }
    }

    /// Default port the service container listens on.
    pub fn default_port(&self) -> u16 {
        match self {
            ServiceKind::StaticAnalyzer => 2001,
            ServiceKind::DynamicAnalyzer => 2002,
            ServiceKind::PerformanceTester => 2003,
            ServiceKind::AiAnalyzer => 2004,
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable mapping from tool names to canonical identities and services.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    /// Canonical name -> owning service.
    tools: HashMap<String, ServiceKind>,
    /// Alias -> canonical name.
    aliases: HashMap<String, String>,
}

impl ToolRegistry {
    /// Builds an empty registry. Mostly useful in tests; production code
    /// starts from [`ToolRegistry::builtin`].
    pub fn empty() -> Self {
        Self {
            tools: HashMap::new(),
            aliases: HashMap::new(),
        }
    }

    /// The registry of tools shipped with the stock analyzer containers.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();

        for tool in ["bandit", "pylint", "mypy", "eslint", "semgrep", "safety", "vulture"] {
            registry.register(tool, ServiceKind::StaticAnalyzer);
        }
        for tool in ["zap", "nikto", "curl-probe"] {
            registry.register(tool, ServiceKind::DynamicAnalyzer);
        }
        for tool in ["locust", "ab", "performance-profile"] {
            registry.register(tool, ServiceKind::PerformanceTester);
        }
        for tool in ["ai-review", "requirements-check"] {
            registry.register(tool, ServiceKind::AiAnalyzer);
        }

        registry.register_alias("zap-baseline", "zap");
        registry.register_alias("owasp-zap", "zap");
        registry.register_alias("apache-bench", "ab");
        registry.register_alias("safety-check", "safety");
        registry.register_alias("gpt-review", "ai-review");

        registry
    }

    /// Registers a canonical tool owned by `service`.
    pub fn register(&mut self, canonical: &str, service: ServiceKind) {
        self.tools.insert(canonical.to_string(), service);
    }

    /// Registers an alias for an already-registered canonical name.
    pub fn register_alias(&mut self, alias: &str, canonical: &str) {
        debug_assert!(self.tools.contains_key(canonical));
        self.aliases.insert(alias.to_string(), canonical.to_string());
    }

    /// Resolves a name (canonical or alias) to its canonical form.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::UnknownTool` for unregistered names.
    pub fn resolve(&self, name: &str) -> Result<&str, RegistryError> {
        if let Some(canonical) = self.aliases.get(name) {
            return Ok(canonical);
        }
        if let Some((canonical, _)) = self.tools.get_key_value(name) {
            return Ok(canonical);
        }
        Err(RegistryError::UnknownTool(name.to_string()))
    }

    /// The service owning a tool (canonical or alias).
    pub fn service(&self, name: &str) -> Result<ServiceKind, RegistryError> {
        let canonical = self.resolve(name)?;
        Ok(self.tools[canonical])
    }

    /// Canonical names owned by `service`, sorted for stable output.
    pub fn list_by_service(&self, service: ServiceKind) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .tools
            .iter()
            .filter(|(_, s)| **s == service)
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    /// Resolves a tool list and groups it by owning service, preserving
    /// the caller's tool order within each group.
    ///
    /// # Errors
    ///
    /// Fails on the first unknown name, before any partial grouping is
    /// observable.
    pub fn group_by_service(
        &self,
        tools: &[String],
    ) -> Result<Vec<(ServiceKind, Vec<String>)>, RegistryError> {
        let mut groups: HashMap<ServiceKind, Vec<String>> = HashMap::new();
        for name in tools {
            let canonical = self.resolve(name)?.to_string();
            let service = self.tools[&canonical];
            let group = groups.entry(service).or_default();
            if !group.contains(&canonical) {
                group.push(canonical);
            }
        }
        let mut ordered: Vec<(ServiceKind, Vec<String>)> = groups.into_iter().collect();
        ordered.sort_by_key(|(service, _)| *service);
        Ok(ordered)
    }

    /// The set of services a tool list requires, in routing order.
    pub fn services_for(&self, tools: &[String]) -> Result<Vec<ServiceKind>, RegistryError> {
        Ok(self
            .group_by_service(tools)?
            .into_iter()
            .map(|(service, _)| service)
            .collect())
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_canonical_and_alias() {
        let registry = ToolRegistry::builtin();
        assert_eq!(registry.resolve("bandit").expect("known"), "bandit");
        assert_eq!(registry.resolve("zap-baseline").expect("alias"), "zap");
        assert_eq!(registry.resolve("apache-bench").expect("alias"), "ab");
    }

    #[test]
    fn test_resolve_unknown_tool_fails() {
        let registry = ToolRegistry::builtin();
        let err = registry.resolve("left-pad").expect_err("unknown");
        assert!(err.to_string().contains("left-pad"));
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_service_routing() {
        let registry = ToolRegistry::builtin();
        assert_eq!(
            registry.service("bandit").expect("known"),
            ServiceKind::StaticAnalyzer
        );
        assert_eq!(
            registry.service("zap-baseline").expect("alias"),
            ServiceKind::DynamicAnalyzer
        );
        assert_eq!(
            registry.service("locust").expect("known"),
            ServiceKind::PerformanceTester
        );
        assert_eq!(
            registry.service("ai-review").expect("known"),
            ServiceKind::AiAnalyzer
        );
    }

    #[test]
    fn test_group_by_service_preserves_order_and_dedups() {
        let registry = ToolRegistry::builtin();
        let tools = vec![
            "zap-baseline".to_string(),
            "bandit".to_string(),
            "pylint".to_string(),
            "zap".to_string(), // same canonical as zap-baseline
        ];
        let groups = registry.group_by_service(&tools).expect("all known");

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, ServiceKind::StaticAnalyzer);
        assert_eq!(groups[0].1, vec!["bandit".to_string(), "pylint".to_string()]);
        assert_eq!(groups[1].0, ServiceKind::DynamicAnalyzer);
        assert_eq!(groups[1].1, vec!["zap".to_string()]);
    }

    #[test]
    fn test_group_by_service_fails_on_unknown() {
        let registry = ToolRegistry::builtin();
        let tools = vec!["bandit".to_string(), "not-a-tool".to_string()];
        assert!(registry.group_by_service(&tools).is_err());
    }

    #[test]
    fn test_services_for_empty_tool_list() {
        let registry = ToolRegistry::builtin();
        assert!(registry.services_for(&[]).expect("empty ok").is_empty());
    }

    #[test]
    fn test_list_by_service_sorted() {
        let registry = ToolRegistry::builtin();
        let names = registry.list_by_service(ServiceKind::DynamicAnalyzer);
        assert_eq!(names, vec!["curl-probe", "nikto", "zap"]);
    }

    #[test]
    fn test_service_kind_wire_names() {
        for service in ServiceKind::all() {
            assert_eq!(ServiceKind::parse(service.as_str()).expect("round-trip"), service);
        }
        assert!(ServiceKind::parse("mystery-analyzer").is_err());
    }
}
