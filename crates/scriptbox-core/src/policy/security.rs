//! Security levels and the policy record.
//!
//! The four presets differ only by field values. Each is at least as
//! permissive as the one below it along every dimension:
//!
//! | Level    | fs | env | net | interop | process | restricted | time  | memory  |
//! |----------|----|-----|-----|---------|---------|------------|-------|---------|
//! | Minimal  | ✗  |  ✗  |  ✗  |    ✗    |    ✗    | 25 cmds    | 10s   | 64 MB   |
//! | Standard | ✓¹ |  ✓  |  ✗  |    ✗    |    ✗    | 14 cmds    | 30s   | 256 MB  |
//! | Elevated | ✓  |  ✓  |  ✓  |    ✓²   |    ✗    | 5 cmds     | 120s  | 512 MB  |
//! | Maximum  | ✓  |  ✓  |  ✓  |    ✓    |    ✓    | none       | 300s  | 1024 MB |
//!
//! ¹ limited to the temp directory. ² `System.Collections`, `System.Text`.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::capability::Capability;
use super::error::{PolicyError, PolicyResult};

/// Ordered privilege levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SecurityLevel {
    Minimal,
    Standard,
    Elevated,
    Maximum,
}

impl SecurityLevel {
    pub const ALL: [SecurityLevel; 4] = [
        SecurityLevel::Minimal,
        SecurityLevel::Standard,
        SecurityLevel::Elevated,
        SecurityLevel::Maximum,
    ];
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SecurityLevel::Minimal => "Minimal",
            SecurityLevel::Standard => "Standard",
            SecurityLevel::Elevated => "Elevated",
            SecurityLevel::Maximum => "Maximum",
        };
        f.write_str(name)
    }
}

impl FromStr for SecurityLevel {
    type Err = PolicyError;

    fn from_str(s: &str) -> PolicyResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minimal" => Ok(SecurityLevel::Minimal),
            "standard" => Ok(SecurityLevel::Standard),
            "elevated" => Ok(SecurityLevel::Elevated),
            "maximum" => Ok(SecurityLevel::Maximum),
            _ => Err(PolicyError::UnknownLevel(s.to_string())),
        }
    }
}

/// Commands withheld at Minimal. Higher levels restrict a subset.
const MINIMAL_RESTRICTED: &[&str] = &[
    "cd", "close", "env", "exec", "exit", "fconfigure", "file", "flush", "gets", "glob", "http",
    "interp", "load", "object", "open", "pwd", "read", "rename", "seek", "socket", "source",
    "update", "uplevel", "upvar", "vwait",
];

const STANDARD_RESTRICTED: &[&str] = &[
    "cd", "exec", "exit", "http", "interp", "load", "object", "rename", "socket", "source",
    "update", "uplevel", "upvar", "vwait",
];

const ELEVATED_RESTRICTED: &[&str] = &["cd", "exec", "exit", "update", "vwait"];

/// Immutable description of what one execution may do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicy {
    pub name: String,
    pub level: SecurityLevel,
    pub allow_filesystem: bool,
    pub allow_network: bool,
    pub allow_reflection: bool,
    pub allow_process: bool,
    pub allow_environment: bool,
    pub restricted_commands: BTreeSet<String>,
    /// Filesystem prefixes; empty means unrestricted when filesystem access
    /// is allowed.
    #[serde(default)]
    pub allowed_paths: Vec<PathBuf>,
    /// Interop namespaces; `*` permits any.
    #[serde(default)]
    pub allowed_namespaces: BTreeSet<String>,
    pub max_execution_secs: u64,
    pub max_memory_mb: u64,
}

fn names(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl SecurityPolicy {
    pub fn minimal() -> Self {
        Self {
            name: "Minimal".to_string(),
            level: SecurityLevel::Minimal,
            allow_filesystem: false,
            allow_network: false,
            allow_reflection: false,
            allow_process: false,
            allow_environment: false,
            restricted_commands: names(MINIMAL_RESTRICTED),
            allowed_paths: Vec::new(),
            allowed_namespaces: BTreeSet::new(),
            max_execution_secs: 10,
            max_memory_mb: 64,
        }
    }

    pub fn standard() -> Self {
        let mut allowed_paths = vec![normalize_lexically(&std::env::temp_dir())];
        let tmp = PathBuf::from("/tmp");
        if !allowed_paths.contains(&tmp) {
            allowed_paths.push(tmp);
        }
        Self {
            name: "Standard".to_string(),
            level: SecurityLevel::Standard,
            allow_filesystem: true,
            allow_environment: true,
            restricted_commands: names(STANDARD_RESTRICTED),
            allowed_paths,
            max_execution_secs: 30,
            max_memory_mb: 256,
            ..Self::minimal()
        }
    }

    pub fn elevated() -> Self {
        Self {
            name: "Elevated".to_string(),
            level: SecurityLevel::Elevated,
            allow_filesystem: true,
            allow_network: true,
            allow_reflection: true,
            allow_process: false,
            allow_environment: true,
            restricted_commands: names(ELEVATED_RESTRICTED),
            allowed_paths: Vec::new(),
            allowed_namespaces: names(&["System.Collections", "System.Text"]),
            max_execution_secs: 120,
            max_memory_mb: 512,
        }
    }

    pub fn maximum() -> Self {
        Self {
            name: "Maximum".to_string(),
            level: SecurityLevel::Maximum,
            allow_filesystem: true,
            allow_network: true,
            allow_reflection: true,
            allow_process: true,
            allow_environment: true,
            // Empty on purpose: Maximum lifts command restrictions.
            restricted_commands: BTreeSet::new(),
            allowed_paths: Vec::new(),
            allowed_namespaces: names(&["*"]),
            max_execution_secs: 300,
            max_memory_mb: 1024,
        }
    }

    pub fn preset(level: SecurityLevel) -> Self {
        match level {
            SecurityLevel::Minimal => Self::minimal(),
            SecurityLevel::Standard => Self::standard(),
            SecurityLevel::Elevated => Self::elevated(),
            SecurityLevel::Maximum => Self::maximum(),
        }
    }

    /// Check the invariants every policy must hold.
    pub fn validate(&self) -> PolicyResult<()> {
        if self.name.trim().is_empty() {
            return Err(PolicyError::InvalidCustom("name must not be empty".into()));
        }
        if self.level < SecurityLevel::Maximum && self.restricted_commands.is_empty() {
            return Err(PolicyError::InvalidCustom(format!(
                "restricted commands must not be empty below Maximum (level {})",
                self.level
            )));
        }
        if self.max_execution_secs == 0 {
            return Err(PolicyError::InvalidCustom(
                "max execution time must be positive".into(),
            ));
        }
        if self.max_memory_mb == 0 {
            return Err(PolicyError::InvalidCustom(
                "max memory must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn max_execution_time(&self) -> Duration {
        Duration::from_secs(self.max_execution_secs)
    }

    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_mb.saturating_mul(1024 * 1024)
    }

    /// Effective permission for `capability`. Minimal never grants any.
    pub fn allows(&self, capability: Capability) -> bool {
        if self.level == SecurityLevel::Minimal {
            return false;
        }
        match capability {
            Capability::Filesystem => self.allow_filesystem,
            Capability::Network => self.allow_network,
            Capability::Reflection => self.allow_reflection,
            Capability::Process => self.allow_process,
            Capability::Environment => self.allow_environment,
        }
    }

    pub fn is_restricted(&self, command: &str) -> bool {
        self.restricted_commands.contains(command)
    }

    /// Whether `path` lies under an allowed prefix (lexically normalized).
    pub fn permits_path(&self, path: &Path) -> bool {
        if !self.allows(Capability::Filesystem) {
            return false;
        }
        if self.allowed_paths.is_empty() {
            return true;
        }
        let path = normalize_lexically(path);
        self.allowed_paths
            .iter()
            .any(|prefix| path.starts_with(normalize_lexically(prefix)))
    }

    pub fn permits_namespace(&self, namespace: &str) -> bool {
        if !self.allows(Capability::Reflection) {
            return false;
        }
        self.allowed_namespaces.iter().any(|allowed| {
            allowed == "*"
                || allowed == namespace
                || namespace
                    .strip_prefix(allowed.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }
}

/// Resolve `.` and `..` without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parse_and_order() {
        assert_eq!("standard".parse::<SecurityLevel>(), Ok(SecurityLevel::Standard));
        assert_eq!(" MAXIMUM ".parse::<SecurityLevel>(), Ok(SecurityLevel::Maximum));
        assert_eq!(
            "root".parse::<SecurityLevel>(),
            Err(PolicyError::UnknownLevel("root".into()))
        );
        assert!(SecurityLevel::Minimal < SecurityLevel::Standard);
        assert!(SecurityLevel::Elevated < SecurityLevel::Maximum);
    }

    #[test]
    fn test_presets_are_monotonic() {
        for pair in SecurityLevel::ALL.windows(2) {
            let (lower, higher) = (
                SecurityPolicy::preset(pair[0]),
                SecurityPolicy::preset(pair[1]),
            );
            for cap in Capability::ALL {
                assert!(
                    !lower.allows(cap) || higher.allows(cap),
                    "{cap} allowed at {} but not at {}",
                    lower.level,
                    higher.level
                );
            }
            assert!(higher.restricted_commands.is_subset(&lower.restricted_commands));
            assert!(higher.max_execution_secs >= lower.max_execution_secs);
            assert!(higher.max_memory_mb >= lower.max_memory_mb);
        }
    }

    #[test]
    fn test_presets_validate() {
        for level in SecurityLevel::ALL {
            SecurityPolicy::preset(level).validate().unwrap();
        }
        assert!(SecurityPolicy::maximum().restricted_commands.is_empty());
    }

    #[test]
    fn test_minimal_ignores_flags() {
        let mut policy = SecurityPolicy::minimal();
        policy.allow_filesystem = true;
        policy.allow_process = true;
        assert!(!policy.allows(Capability::Filesystem));
        assert!(!policy.allows(Capability::Process));
        assert!(!policy.permits_path(Path::new("/tmp/x")));
    }

    #[test]
    fn test_custom_validation() {
        let mut policy = SecurityPolicy::standard();
        policy.restricted_commands.clear();
        assert!(matches!(policy.validate(), Err(PolicyError::InvalidCustom(_))));

        let mut policy = SecurityPolicy::elevated();
        policy.max_execution_secs = 0;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_path_prefixes() {
        let policy = SecurityPolicy::standard();
        assert!(policy.permits_path(Path::new("/tmp/work/a.txt")));
        assert!(!policy.permits_path(Path::new("/tmp/../etc/passwd")));
        assert!(!policy.permits_path(Path::new("/etc/passwd")));
        assert!(SecurityPolicy::elevated().permits_path(Path::new("/etc/hosts")));
    }

    #[test]
    fn test_namespaces() {
        let elevated = SecurityPolicy::elevated();
        assert!(elevated.permits_namespace("System.Text"));
        assert!(elevated.permits_namespace("System.Text.RegularExpressions"));
        assert!(!elevated.permits_namespace("System.IO"));
        assert!(!elevated.permits_namespace("System.TextX"));
        assert!(SecurityPolicy::maximum().permits_namespace("Anything"));
        assert!(!SecurityPolicy::standard().permits_namespace("System.Text"));
    }

    #[test]
    fn test_normalize_lexically() {
        assert_eq!(
            normalize_lexically(Path::new("/a/./b/../c")),
            PathBuf::from("/a/c")
        );
        assert_eq!(normalize_lexically(Path::new("/../x")), PathBuf::from("/x"));
    }

    #[test]
    fn test_serde_roundtrip() {
        let policy = SecurityPolicy::elevated();
        let json = serde_json::to_string(&policy).unwrap();
        let back: SecurityPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, back);
    }
}
