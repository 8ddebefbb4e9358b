//! Execution context builder.
//!
//! [`ContextBuilder::build`] turns a raw [`ExecuteRequest`] into an
//! immutable [`ExecutionContext`] or rejects it. Nothing here touches the
//! pool or the stores, so a rejected request costs no pooled resource.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use scriptbox_state::SessionId;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::format::OutputFormat;
use crate::interp::parser::{self, ParseErrorKind};
use crate::interp::Value;
use crate::policy::{
    normalize_lexically, resolve, Capability, PolicyError, PolicySelector, SecurityPolicy,
};

pub const DEFAULT_TIMEOUT_SECS: i64 = 30;
pub const DEFAULT_SECURITY_LEVEL: &str = "Standard";

/// Raw request as received from the protocol layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecuteRequest {
    pub script: String,
    pub variables: BTreeMap<String, serde_json::Value>,
    pub security_level: String,
    /// Bypasses preset resolution; only honored when the engine allows it.
    pub custom_policy: Option<SecurityPolicy>,
    pub session_id: Option<String>,
    pub timeout_seconds: i64,
    pub output_format: String,
    pub imported_capabilities: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub environment_variables: BTreeMap<String, String>,
    /// Turn a silently dropped environment into a policy violation.
    pub require_environment: bool,
    pub execution_mode: String,
}

impl Default for ExecuteRequest {
    fn default() -> Self {
        Self {
            script: String::new(),
            variables: BTreeMap::new(),
            security_level: DEFAULT_SECURITY_LEVEL.to_string(),
            custom_policy: None,
            session_id: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            output_format: OutputFormat::Plain.to_string(),
            imported_capabilities: Vec::new(),
            working_directory: None,
            environment_variables: BTreeMap::new(),
            require_environment: false,
            execution_mode: ExecutionMode::Batch.to_string(),
        }
    }
}

impl ExecuteRequest {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            ..Self::default()
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn with_security_level(mut self, level: impl Into<String>) -> Self {
        self.security_level = level.into();
        self
    }

    pub fn with_custom_policy(mut self, policy: SecurityPolicy) -> Self {
        self.custom_policy = Some(policy);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_timeout_seconds(mut self, secs: i64) -> Self {
        self.timeout_seconds = secs;
        self
    }

    pub fn with_output_format(mut self, format: impl Into<String>) -> Self {
        self.output_format = format.into();
        self
    }

    pub fn with_import(mut self, name: impl Into<String>) -> Self {
        self.imported_capabilities.push(name.into());
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment_variables.insert(name.into(), value.into());
        self
    }

    pub fn requiring_environment(mut self) -> Self {
        self.require_environment = true;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode.to_string();
        self
    }
}

/// How the caller intends to consume the result.
///
/// `Debug` additionally logs the script text and the interpreter counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionMode {
    Interactive,
    Batch,
    Service,
    Debug,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionMode::Interactive => "Interactive",
            ExecutionMode::Batch => "Batch",
            ExecutionMode::Service => "Service",
            ExecutionMode::Debug => "Debug",
        };
        f.write_str(name)
    }
}

impl FromStr for ExecutionMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, ValidationError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interactive" => Ok(ExecutionMode::Interactive),
            "batch" => Ok(ExecutionMode::Batch),
            "service" => Ok(ExecutionMode::Service),
            "debug" => Ok(ExecutionMode::Debug),
            _ => Err(ValidationError::new(
                "executionMode",
                format!("unknown mode \"{s}\": must be Interactive, Batch, Service, or Debug"),
            )),
        }
    }
}

/// A request field that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Why a request could not become an [`ExecutionContext`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The request asks for something the resolved policy forbids.
    #[error("{capability} not permitted: {reason}")]
    PolicyViolation { capability: String, reason: String },
}

impl From<PolicyError> for ContextError {
    fn from(err: PolicyError) -> Self {
        let field = match err {
            PolicyError::UnknownLevel(_) => "securityLevel",
            PolicyError::InvalidCustom(_) => "customPolicy",
        };
        ContextError::Validation(ValidationError::new(field, err.to_string()))
    }
}

fn violation(capability: impl Into<String>, reason: impl Into<String>) -> ContextError {
    ContextError::PolicyViolation {
        capability: capability.into(),
        reason: reason.into(),
    }
}

/// Engine-wide limits applied on top of the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextLimits {
    pub max_script_bytes: usize,
    /// Global ceiling; the policy maximum may lower it further.
    pub max_timeout_secs: u64,
    pub allow_custom_policies: bool,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            max_script_bytes: 1024 * 1024,
            max_timeout_secs: 300,
            allow_custom_policies: false,
        }
    }
}

/// A validated, immutable execution request.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    execution_id: Uuid,
    session_id: Option<SessionId>,
    script: String,
    variables: BTreeMap<String, Value>,
    policy: Arc<SecurityPolicy>,
    timeout: Duration,
    timeout_clamped: bool,
    working_dir: Option<PathBuf>,
    environment: BTreeMap<String, String>,
    environment_dropped: bool,
    capabilities: BTreeSet<Capability>,
    namespaces: BTreeSet<String>,
    format: OutputFormat,
    mode: ExecutionMode,
}

impl ExecutionContext {
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }

    pub fn policy(&self) -> &Arc<SecurityPolicy> {
        &self.policy
    }

    /// Effective timeout after clamping to the policy ceiling.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `true` when the requested timeout was lowered.
    pub fn timeout_clamped(&self) -> bool {
        self.timeout_clamped
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    /// Environment to expose; empty when the policy withholds it.
    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    pub fn environment_dropped(&self) -> bool {
        self.environment_dropped
    }

    pub fn imported_capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    pub fn imported_namespaces(&self) -> &BTreeSet<String> {
        &self.namespaces
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.policy.max_memory_bytes()
    }
}

/// Validates requests against [`ContextLimits`] and the resolved policy.
#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    limits: ContextLimits,
}

impl ContextBuilder {
    pub fn new(limits: ContextLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ContextLimits {
        &self.limits
    }

    pub fn build(&self, request: &ExecuteRequest) -> Result<ExecutionContext, ContextError> {
        self.build_for(Uuid::new_v4(), request)
    }

    /// [`build`](Self::build) with a caller-chosen execution id.
    pub fn build_for(
        &self,
        execution_id: Uuid,
        request: &ExecuteRequest,
    ) -> Result<ExecutionContext, ContextError> {
        if request.script.trim().is_empty() {
            return Err(ValidationError::new("script", "must not be empty").into());
        }
        if request.script.len() > self.limits.max_script_bytes {
            return Err(ValidationError::new(
                "script",
                format!(
                    "{} bytes exceeds the {} byte limit",
                    request.script.len(),
                    self.limits.max_script_bytes
                ),
            )
            .into());
        }
        // Other syntax errors surface as script errors when evaluated.
        if let Err(err) = parser::parse(&request.script) {
            if err.kind == ParseErrorKind::TooDeep {
                return Err(ValidationError::new("script", err.to_string()).into());
            }
        }

        let policy = self.resolve_policy(request)?;

        let (timeout, timeout_clamped) = self.clamp_timeout(request.timeout_seconds, &policy)?;

        let format: OutputFormat = request
            .output_format
            .parse()
            .map_err(|e: crate::format::FormatError| ValidationError::new("outputFormat", e.to_string()))?;
        let mode: ExecutionMode = request.execution_mode.parse()?;

        let session_id = request
            .session_id
            .as_deref()
            .map(SessionId::parse)
            .transpose()
            .map_err(|e| ValidationError::new("sessionId", e.to_string()))?;

        let mut variables = BTreeMap::new();
        for (name, value) in &request.variables {
            if !is_variable_name(name) {
                return Err(ValidationError::new(
                    "variables",
                    format!("\"{name}\" is not a valid variable name"),
                )
                .into());
            }
            variables.insert(name.clone(), Value::from_json(value));
        }

        let working_dir = working_directory(request.working_directory.as_deref(), &policy)?;

        let (environment, environment_dropped) = self.environment(request, &policy)?;

        let (capabilities, namespaces) = imports(&request.imported_capabilities, &policy)?;

        Ok(ExecutionContext {
            execution_id,
            session_id,
            script: request.script.clone(),
            variables,
            policy: Arc::new(policy),
            timeout,
            timeout_clamped,
            working_dir,
            environment,
            environment_dropped,
            capabilities,
            namespaces,
            format,
            mode,
        })
    }

    fn resolve_policy(&self, request: &ExecuteRequest) -> Result<SecurityPolicy, ContextError> {
        let selector = match &request.custom_policy {
            Some(custom) => {
                if !self.limits.allow_custom_policies {
                    return Err(violation(
                        "customPolicy",
                        "custom policies are not enabled for this engine",
                    ));
                }
                PolicySelector::Custom(custom.clone())
            }
            None => PolicySelector::Level(request.security_level.clone()),
        };
        Ok(resolve(&selector)?)
    }

    fn clamp_timeout(
        &self,
        requested: i64,
        policy: &SecurityPolicy,
    ) -> Result<(Duration, bool), ContextError> {
        if requested <= 0 {
            return Err(ValidationError::new(
                "timeoutSeconds",
                format!("must be positive, got {requested}"),
            )
            .into());
        }
        let ceiling = policy.max_execution_secs.min(self.limits.max_timeout_secs);
        let requested = requested as u64;
        let effective = requested.min(ceiling);
        Ok((Duration::from_secs(effective), effective < requested))
    }

    fn environment(
        &self,
        request: &ExecuteRequest,
        policy: &SecurityPolicy,
    ) -> Result<(BTreeMap<String, String>, bool), ContextError> {
        for name in request.environment_variables.keys() {
            if name.is_empty() || name.contains(['=', '\0']) {
                return Err(ValidationError::new(
                    "environmentVariables",
                    format!("\"{name}\" is not a valid environment variable name"),
                )
                .into());
            }
        }
        if request.environment_variables.is_empty() || policy.allows(Capability::Environment) {
            return Ok((request.environment_variables.clone(), false));
        }
        if request.require_environment {
            return Err(violation(
                Capability::Environment.to_string(),
                format!("the {} policy does not allow environment access", policy.name),
            ));
        }
        debug!(
            dropped = request.environment_variables.len(),
            policy = %policy.name,
            "environment variables omitted by policy"
        );
        Ok((BTreeMap::new(), true))
    }
}

fn is_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn working_directory(
    requested: Option<&Path>,
    policy: &SecurityPolicy,
) -> Result<Option<PathBuf>, ContextError> {
    let Some(dir) = requested else {
        if !policy.allows(Capability::Filesystem) {
            return Ok(None);
        }
        return Ok(policy
            .allowed_paths
            .first()
            .cloned()
            .or_else(|| std::env::current_dir().ok()));
    };
    if !policy.allows(Capability::Filesystem) {
        return Err(violation(
            Capability::Filesystem.to_string(),
            format!(
                "a working directory requires filesystem access, which the {} policy withholds",
                policy.name
            ),
        ));
    }
    let absolute = if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| ValidationError::new("workingDirectory", e.to_string()))?
            .join(dir)
    };
    let normalized = normalize_lexically(&absolute);
    if !policy.permits_path(&normalized) {
        return Err(violation(
            Capability::Filesystem.to_string(),
            format!(
                "working directory {} is outside the paths allowed by the {} policy",
                normalized.display(),
                policy.name
            ),
        ));
    }
    Ok(Some(normalized))
}

fn imports(
    names: &[String],
    policy: &SecurityPolicy,
) -> Result<(BTreeSet<Capability>, BTreeSet<String>), ContextError> {
    let mut capabilities = BTreeSet::new();
    let mut namespaces = BTreeSet::new();
    for name in names {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::new("importedCapabilities", "empty entry").into());
        }
        if let Some(cap) = Capability::from_name(name) {
            if !policy.allows(cap) {
                return Err(violation(
                    cap.to_string(),
                    format!("the {} policy does not grant {cap}", policy.name),
                ));
            }
            capabilities.insert(cap);
        } else if policy.permits_namespace(name) {
            namespaces.insert(name.to_string());
        } else {
            return Err(violation(
                Capability::Reflection.to_string(),
                format!("namespace {name} is not permitted by the {} policy", policy.name),
            ));
        }
    }
    Ok((capabilities, namespaces))
}
