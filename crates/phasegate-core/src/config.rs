use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::MAX_DURATION_SECS;
use crate::error::{PhasegateError, Result};
use crate::gate::{DefaultAction, RejectionPolicy};

/// Prefix for flat environment overrides (`PHASEGATE_BUDGET_RUN_COST_CAP`).
pub const ENV_PREFIX: &str = "PHASEGATE_";

const SECTIONS: &[&str] = &[
    "orchestration",
    "hrg",
    "budget",
    "retry",
    "rol",
    "store",
    "observability",
    "gateway",
];

/// Top-level Phasegate configuration.
///
/// Built once at process start, validated, then shared by reference with
/// every component. Nothing downstream reads the environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
    #[serde(default)]
    pub hrg: HrgConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub rol: RolConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// Maximum nodes executing at once per run ("swarm" width).
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Interval of the SLA expiry sweep in `serve` mode.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default)]
    pub model: ModelSelection,
    /// Seed recorded in every run snapshot for reproducibility.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Model name -> pinned version, recorded in every run snapshot.
    #[serde(default)]
    pub pinned_models: HashMap<String, String>,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            concurrency_limit: default_concurrency_limit(),
            default_timeout_secs: default_timeout_secs(),
            tick_interval_ms: default_tick_interval_ms(),
            model: ModelSelection::default(),
            seed: None,
            pinned_models: HashMap::new(),
        }
    }
}

fn default_workspace() -> String { "~/.phasegate".to_string() }
fn default_concurrency_limit() -> usize { 4 }
fn default_timeout_secs() -> u64 { 300 }
fn default_tick_interval_ms() -> u64 { 1000 }

/// Model/network selection passed through to executors as opaque data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSelection {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default = "default_network")]
    pub network: String,
}

impl Default for ModelSelection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_id: None,
            network: default_network(),
        }
    }
}

fn default_provider() -> String { "local".to_string() }
fn default_network() -> String { "offline".to_string() }

/// Human review gate (HRG) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HrgConfig {
    /// When false, gate nodes are auto-resolved and audited as bypassed.
    #[serde(default = "default_hrg_enabled")]
    pub enabled: bool,
    /// SLA applied to gates that do not set their own (default: 12 hours).
    #[serde(default = "default_sla_secs")]
    pub default_sla_secs: u64,
    #[serde(default)]
    pub default_action: DefaultAction,
    #[serde(default)]
    pub rejection: RejectionPolicy,
    /// Escalations stop at this severity and page instead.
    #[serde(default = "default_max_escalation_level")]
    pub max_escalation_level: u8,
    /// On-call path paged by `pause_and_page`.
    #[serde(default)]
    pub oncall_path: Option<String>,
    /// Voter id -> role. When non-empty, only listed voters may vote.
    #[serde(default)]
    pub roles: HashMap<String, String>,
}

impl Default for HrgConfig {
    fn default() -> Self {
        Self {
            enabled: default_hrg_enabled(),
            default_sla_secs: default_sla_secs(),
            default_action: DefaultAction::default(),
            rejection: RejectionPolicy::default(),
            max_escalation_level: default_max_escalation_level(),
            oncall_path: None,
            roles: HashMap::new(),
        }
    }
}

fn default_hrg_enabled() -> bool { true }
fn default_sla_secs() -> u64 { 12 * 3600 }
fn default_max_escalation_level() -> u8 { 3 }

/// Budget caps. `run_cost_cap` is a hard safety control with no default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub run_cost_cap: Option<f64>,
    #[serde(default)]
    pub global_cost_cap: Option<f64>,
    #[serde(default)]
    pub run_time_cap_secs: Option<u64>,
    /// Default action of gates opened on a breach.
    #[serde(default = "default_breach_action")]
    pub breach_action: DefaultAction,
    /// Fraction of the original cap granted when a breach gate is approved.
    #[serde(default = "default_approval_extension_ratio")]
    pub approval_extension_ratio: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            run_cost_cap: None,
            global_cost_cap: None,
            run_time_cap_secs: None,
            breach_action: default_breach_action(),
            approval_extension_ratio: default_approval_extension_ratio(),
        }
    }
}

fn default_breach_action() -> DefaultAction { DefaultAction::Escalate }
fn default_approval_extension_ratio() -> f64 { 0.5 }

/// Node retry policy defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 30_000 }

/// Resource-optimization target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolConfig {
    /// Target utilization ratio of the worker pool, in (0, 1].
    #[serde(default = "default_target_utilization")]
    pub target_utilization: f64,
}

impl Default for RolConfig {
    fn default() -> Self {
        Self {
            target_utilization: default_target_utilization(),
        }
    }
}

fn default_target_utilization() -> f64 { 0.85 }

/// Checkpoint/audit ledger location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Default: <workspace>/ledger
    #[serde(default)]
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Bind address of the pull-based metrics endpoint.
    #[serde(default)]
    pub metrics_bind: Option<String>,
    /// Collector endpoint recorded for external exporters.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
    /// "text" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_bind: None,
            otlp_endpoint: None,
            log_format: default_log_format(),
        }
    }
}

fn default_log_format() -> String { "text".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token required on every API call when set.
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            token: None,
        }
    }
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| PhasegateError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse TOML text, expanding `${ENV_VAR}` references first.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| PhasegateError::Config(e.to_string()))
    }

    /// Set one flat named option, e.g. `budget.run_cost_cap = 25`.
    ///
    /// The raw value is parsed as a TOML literal, falling back to a plain
    /// string, so `hrg.default_action=escalate` and `budget.run_cost_cap=25`
    /// both work.
    pub fn set_option(&mut self, key: &str, raw: &str) -> Result<()> {
        let path: Vec<&str> = key.split('.').map(str::trim).collect();
        if path.len() < 2 || !SECTIONS.contains(&path[0]) || path.iter().any(|p| p.is_empty()) {
            return Err(PhasegateError::Config(format!("Unknown option: {}", key)));
        }

        let mut root = toml::Value::try_from(&*self)
            .map_err(|e| PhasegateError::Config(e.to_string()))?;
        let mut cursor = &mut root;
        for segment in &path[..path.len() - 1] {
            let table = cursor
                .as_table_mut()
                .ok_or_else(|| PhasegateError::Config(format!("Option {} is not a section", key)))?;
            cursor = table
                .entry(segment.to_string())
                .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
        }
        let table = cursor
            .as_table_mut()
            .ok_or_else(|| PhasegateError::Config(format!("Option {} is not a section", key)))?;
        table.insert(path[path.len() - 1].to_string(), parse_literal(raw));

        *self = root
            .try_into()
            .map_err(|e: toml::de::Error| PhasegateError::Config(format!("{}: {}", key, e)))?;
        Ok(())
    }

    /// Apply `PHASEGATE_<SECTION>_<KEY>` overrides from the given variables.
    ///
    /// Callers pass `std::env::vars()` once at startup.
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> Result<usize>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut applied = 0;
        for (name, value) in vars {
            let Some(rest) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let rest = rest.to_ascii_lowercase();
            let Some(section) = SECTIONS.iter().find(|s| {
                rest.starts_with(*s) && rest.as_bytes().get(s.len()) == Some(&b'_')
            }) else {
                warn!(variable = %name, "Ignoring unrecognized Phasegate environment override");
                continue;
            };
            let key = format!("{}.{}", section, &rest[section.len() + 1..]);
            self.set_option(&key, &value)?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Validate once at process start. Missing hard safety controls fail fast.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        match self.budget.run_cost_cap {
            None => problems.push(
                "budget.run_cost_cap is a required safety control and has no default".to_string(),
            ),
            Some(cap) if !(cap > 0.0) => {
                problems.push(format!("budget.run_cost_cap must be positive (got {})", cap))
            }
            _ => {}
        }
        if let Some(cap) = self.budget.global_cost_cap {
            if !(cap > 0.0) {
                problems.push(format!("budget.global_cost_cap must be positive (got {})", cap));
            }
        }
        if self.budget.approval_extension_ratio < 0.0 {
            problems.push("budget.approval_extension_ratio must not be negative".to_string());
        }
        let util = self.rol.target_utilization;
        if !(util > 0.0 && util <= 1.0) {
            problems.push(format!(
                "rol.target_utilization must be in (0, 1] (got {})",
                util
            ));
        }
        if self.orchestration.concurrency_limit == 0 {
            problems.push("orchestration.concurrency_limit must be at least 1".to_string());
        }
        if self.hrg.default_sla_secs == 0 {
            problems.push("hrg.default_sla_secs must be positive".to_string());
        }
        let bounded = [
            ("orchestration.default_timeout_secs", Some(self.orchestration.default_timeout_secs)),
            ("hrg.default_sla_secs", Some(self.hrg.default_sla_secs)),
            ("budget.run_time_cap_secs", self.budget.run_time_cap_secs),
        ];
        for (key, secs) in bounded {
            if let Some(secs) = secs.filter(|s| *s > MAX_DURATION_SECS) {
                problems.push(format!(
                    "{} must not exceed {} seconds (got {})",
                    key, MAX_DURATION_SECS, secs
                ));
            }
        }
        if self.hrg.max_escalation_level == 0 {
            problems.push("hrg.max_escalation_level must be at least 1".to_string());
        }
        if self.retry.max_attempts == 0 {
            problems.push("retry.max_attempts must be at least 1".to_string());
        }
        if !matches!(self.observability.log_format.as_str(), "text" | "json") {
            problems.push(format!(
                "observability.log_format must be \"text\" or \"json\" (got {:?})",
                self.observability.log_format
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(PhasegateError::Config(problems.join("; ")))
        }
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        let ws = &self.orchestration.workspace;
        if let Some(rest) = ws.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(ws)
    }

    /// Directory holding the checkpoint/audit ledger.
    pub fn store_dir(&self) -> PathBuf {
        match &self.store.dir {
            Some(dir) => PathBuf::from(dir),
            None => self.workspace_dir().join("ledger"),
        }
    }

    /// Worker permits per run: the concurrency limit scaled by the
    /// utilization target, never below one.
    pub fn effective_concurrency(&self) -> usize {
        let scaled = (self.orchestration.concurrency_limit as f64 * self.rol.target_utilization).ceil();
        (scaled as usize).clamp(1, self.orchestration.concurrency_limit.max(1))
    }
}

fn parse_literal(raw: &str) -> toml::Value {
    toml::from_str::<toml::Table>(&format!("v = {}", raw))
        .ok()
        .and_then(|mut t| t.remove("v"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
