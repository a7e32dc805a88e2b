//! Metric name -> collector dispatch (`spec.md` §3 `AgentMetricRegistration`,
//! §4.5 "Metric dispatch").

use crate::error::{AgentError, AgentResult, ResultCode};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricDataType {
    Int32,
    Int64,
    Float,
    String,
    Table,
}

/// A metric collector function: takes the literal metric name that
/// matched and the registration's opaque argument, returns the scalar
/// value as a string (the registry does not interpret metric semantics,
/// per `spec.md` §1 non-goals).
pub type MetricHandler = Arc<dyn Fn(&str, Option<&str>) -> AgentResult<String> + Send + Sync>;

/// An externally-consulted fallback: external subagent / application
/// agent / external script bridges. Tried in order when neither a
/// literal nor a wildcarded registration matches.
pub type FallbackHandler = Arc<dyn Fn(&str) -> Option<AgentResult<String>> + Send + Sync>;

#[derive(Clone)]
pub struct AgentMetricRegistration {
    pub name_pattern: String,
    pub handler: MetricHandler,
    pub argument: Option<String>,
    pub data_type: MetricDataType,
}

impl AgentMetricRegistration {
    fn is_wildcard(&self) -> bool {
        self.name_pattern.contains('*') || self.name_pattern.contains('?')
    }
}

/// Matches a wildcarded registration pattern (`*` = any run of
/// characters, `?` = any single character) against a literal metric name.
fn glob_match(pattern: &str, name: &str) -> bool {
    fn helper(pat: &[u8], s: &[u8]) -> bool {
        match (pat.first(), s.first()) {
            (None, None) => true,
            (Some(b'*'), _) => helper(&pat[1..], s) || (!s.is_empty() && helper(pat, &s[1..])),
            (Some(b'?'), Some(_)) => helper(&pat[1..], &s[1..]),
            (Some(p), Some(c)) if p.eq_ignore_ascii_case(c) => helper(&pat[1..], &s[1..]),
            _ => false,
        }
    }
    helper(pattern.as_bytes(), name.as_bytes())
}

/// Read-only, lock-free metric namespace built once at plugin-load time
/// (`spec.md` §3: "Immutable after plugin load; lookup is read-only and
/// lock-free in the hot path"). Duplicate literal names across plugins
/// are silently shadowed — first registration wins.
pub struct MetricRegistry {
    literal: std::collections::HashMap<String, AgentMetricRegistration>,
    wildcards: Vec<AgentMetricRegistration>,
    fallbacks: Vec<FallbackHandler>,
}

#[derive(Default)]
pub struct MetricRegistryBuilder {
    literal: std::collections::HashMap<String, AgentMetricRegistration>,
    wildcards: Vec<AgentMetricRegistration>,
    fallbacks: Vec<FallbackHandler>,
    shadowed_warnings: Vec<String>,
}

impl MetricRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one metric. First registration of a given literal name
    /// wins; later duplicates are recorded as shadowed (a plugin-load
    /// warning, not an error).
    pub fn register(&mut self, reg: AgentMetricRegistration) {
        if reg.is_wildcard() {
            self.wildcards.push(reg);
            return;
        }
        if self.literal.contains_key(&reg.name_pattern) {
            self.shadowed_warnings.push(reg.name_pattern.clone());
            return;
        }
        self.literal.insert(reg.name_pattern.clone(), reg);
    }

    pub fn register_fallback(&mut self, fallback: FallbackHandler) {
        self.fallbacks.push(fallback);
    }

    /// Names that were registered more than once and got shadowed by the
    /// first registration, for the caller to log as plugin-load warnings.
    pub fn shadowed_names(&self) -> &[String] {
        &self.shadowed_warnings
    }

    pub fn build(self) -> MetricRegistry {
        MetricRegistry {
            literal: self.literal,
            wildcards: self.wildcards,
            fallbacks: self.fallbacks,
        }
    }
}

impl MetricRegistry {
    /// `get_metric(name, session) -> (code, value)` from `spec.md` §4.5.
    /// Literal names are looked up directly; wildcards are scanned in
    /// registration order (first match wins); failing both, the fallback
    /// chain is consulted.
    pub fn get_metric(&self, name: &str, session_arg: Option<&str>) -> (ResultCode, AgentResult<String>) {
        if let Some(reg) = self.literal.get(name) {
            let result = (reg.handler)(name, reg.argument.as_deref().or(session_arg));
            return (result.as_ref().map(|_| ResultCode::Success).unwrap_or_else(|e| e.rcc()), result);
        }
        for reg in &self.wildcards {
            if glob_match(&reg.name_pattern, name) {
                let result = (reg.handler)(name, reg.argument.as_deref().or(session_arg));
                return (result.as_ref().map(|_| ResultCode::Success).unwrap_or_else(|e| e.rcc()), result);
            }
        }
        for fallback in &self.fallbacks {
            if let Some(result) = fallback(name) {
                return (result.as_ref().map(|_| ResultCode::Success).unwrap_or_else(|e| e.rcc()), result);
            }
        }
        (ResultCode::UnknownMetric, Err(AgentError::UnknownMetric(name.to_string())))
    }

    pub fn len(&self) -> usize {
        self.literal.len() + self.wildcards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-supplied metrics every agent exposes regardless of loaded
/// plugins, registered by the supervisor before any plugin's own metrics
/// (`spec.md` acceptance examples reference `Agent.Uptime` directly).
pub fn builtin_registrations(started_at_ms: i64) -> Vec<AgentMetricRegistration> {
    vec![
        AgentMetricRegistration {
            name_pattern: "Agent.Uptime".into(),
            handler: Arc::new(move |_name, _arg| {
                Ok(((crate::model::now_ms() - started_at_ms).max(0) / 1000).to_string())
            }),
            argument: None,
            data_type: MetricDataType::Int64,
        },
        AgentMetricRegistration {
            name_pattern: "Agent.Version".into(),
            handler: Arc::new(|_name, _arg| Ok(env!("CARGO_PKG_VERSION").to_string())),
            argument: None,
            data_type: MetricDataType::String,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(value: &'static str) -> MetricHandler {
        Arc::new(move |_name, _arg| Ok(value.to_string()))
    }

    #[test]
    fn literal_lookup_returns_success() {
        let mut builder = MetricRegistryBuilder::new();
        builder.register(AgentMetricRegistration {
            name_pattern: "Agent.Uptime".into(),
            handler: fixed("3600"),
            argument: None,
            data_type: MetricDataType::Int64,
        });
        let registry = builder.build();
        let (code, value) = registry.get_metric("Agent.Uptime", None);
        assert_eq!(code, ResultCode::Success);
        assert_eq!(value.unwrap(), "3600");
    }

    #[test]
    fn unknown_metric_reports_unknown_metric_code() {
        let registry = MetricRegistryBuilder::new().build();
        let (code, _) = registry.get_metric("Agent.Bogus", None);
        assert_eq!(code, ResultCode::UnknownMetric);
    }

    #[test]
    fn wildcard_is_scanned_in_registration_order_first_match_wins() {
        let mut builder = MetricRegistryBuilder::new();
        builder.register(AgentMetricRegistration {
            name_pattern: "Disk.*".into(),
            handler: fixed("first"),
            argument: None,
            data_type: MetricDataType::String,
        });
        builder.register(AgentMetricRegistration {
            name_pattern: "Disk.Free*".into(),
            handler: fixed("second"),
            argument: None,
            data_type: MetricDataType::String,
        });
        let registry = builder.build();
        let (_, value) = registry.get_metric("Disk.Free(/)", None);
        assert_eq!(value.unwrap(), "first");
    }

    #[test]
    fn duplicate_literal_name_is_shadowed_first_wins() {
        let mut builder = MetricRegistryBuilder::new();
        builder.register(AgentMetricRegistration {
            name_pattern: "Agent.Uptime".into(),
            handler: fixed("first"),
            argument: None,
            data_type: MetricDataType::Int64,
        });
        builder.register(AgentMetricRegistration {
            name_pattern: "Agent.Uptime".into(),
            handler: fixed("second"),
            argument: None,
            data_type: MetricDataType::Int64,
        });
        assert_eq!(builder.shadowed_names(), ["Agent.Uptime"]);
        let registry = builder.build();
        assert_eq!(registry.get_metric("Agent.Uptime", None).1.unwrap(), "first");
    }

    #[test]
    fn fallback_chain_is_consulted_when_no_registration_matches() {
        let mut builder = MetricRegistryBuilder::new();
        builder.register_fallback(Arc::new(|name| {
            if name == "External.Value" {
                Some(Ok("42".to_string()))
            } else {
                None
            }
        }));
        let registry = builder.build();
        let (code, value) = registry.get_metric("External.Value", None);
        assert_eq!(code, ResultCode::Success);
        assert_eq!(value.unwrap(), "42");
    }
}
