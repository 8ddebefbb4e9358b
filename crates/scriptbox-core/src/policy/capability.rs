//! Capabilities: the permission axes of a security policy.

use serde::{Deserialize, Serialize};

/// A class of external access a script may be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Filesystem,
    Network,
    /// Host-language interop (`load`, `interp`, `object`).
    Reflection,
    Process,
    Environment,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Filesystem,
        Capability::Network,
        Capability::Reflection,
        Capability::Process,
        Capability::Environment,
    ];

    /// The capability a command exercises, if any.
    pub fn for_command(command: &str) -> Option<Capability> {
        match command {
            "exec" => Some(Capability::Process),
            "open" | "close" | "read" | "gets" | "seek" | "flush" | "fconfigure" | "file"
            | "glob" | "cd" | "pwd" | "source" => Some(Capability::Filesystem),
            "socket" | "http" => Some(Capability::Network),
            "load" | "interp" | "object" => Some(Capability::Reflection),
            "env" => Some(Capability::Environment),
            _ => None,
        }
    }

    /// Parse an imported capability name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Capability> {
        match name.to_ascii_lowercase().as_str() {
            "filesystem" | "fs" => Some(Capability::Filesystem),
            "network" | "net" => Some(Capability::Network),
            "reflection" | "interop" => Some(Capability::Reflection),
            "process" => Some(Capability::Process),
            "environment" | "env" => Some(Capability::Environment),
            _ => None,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Filesystem => write!(f, "filesystem"),
            Capability::Network => write!(f, "network"),
            Capability::Reflection => write!(f, "reflection"),
            Capability::Process => write!(f, "process"),
            Capability::Environment => write!(f, "environment"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_roundtrips_through_from_name() {
        for cap in Capability::ALL {
            assert_eq!(Capability::from_name(&cap.to_string()), Some(cap));
        }
        assert_eq!(Capability::from_name("FS"), Some(Capability::Filesystem));
        assert_eq!(Capability::from_name("System.Text"), None);
    }

    #[test]
    fn test_command_mapping() {
        assert_eq!(Capability::for_command("exec"), Some(Capability::Process));
        assert_eq!(Capability::for_command("file"), Some(Capability::Filesystem));
        assert_eq!(Capability::for_command("socket"), Some(Capability::Network));
        assert_eq!(Capability::for_command("load"), Some(Capability::Reflection));
        assert_eq!(Capability::for_command("env"), Some(Capability::Environment));
        assert_eq!(Capability::for_command("set"), None);
    }
}
