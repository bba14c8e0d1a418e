use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::ROLE_METADATA_KEY;

/// Role of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    #[default]
    Unknown,
    /// Control-plane node.
    Coordinator,
    /// Worker node.
    Node,
    Admin,
}

impl Role {
    /// Parse a role name case-insensitively. Unrecognized input maps to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "coordinator" | "controlplane" | "control-plane" => Self::Coordinator,
            "node" | "worker" => Self::Node,
            "admin" => Self::Admin,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Coordinator => write!(f, "Coordinator"),
            Self::Node => write!(f, "Node"),
            Self::Admin => write!(f, "Admin"),
        }
    }
}

impl Serialize for Role {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

/// Read the role from provider tags or labels.
///
/// Total: a missing `constellation-role` key or an unrecognized value yields `Unknown`.
pub fn extract_role(metadata: &BTreeMap<String, String>) -> Role {
    metadata
        .get(ROLE_METADATA_KEY)
        .map(|v| Role::parse(v))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!(Role::parse("coordinator"), Role::Coordinator);
        assert_eq!(Role::parse("COORDINATOR"), Role::Coordinator);
        assert_eq!(Role::parse("ControlPlane"), Role::Coordinator);
        assert_eq!(Role::parse("Node"), Role::Node);
        assert_eq!(Role::parse("worker"), Role::Node);
        assert_eq!(Role::parse("admin"), Role::Admin);
        assert_eq!(Role::parse("something"), Role::Unknown);
        assert_eq!(Role::parse(""), Role::Unknown);
    }

    #[test]
    fn test_display_is_canonical() {
        assert_eq!(Role::Coordinator.to_string(), "Coordinator");
        assert_eq!(Role::Node.to_string(), "Node");
        assert_eq!(Role::Admin.to_string(), "Admin");
        assert_eq!(Role::Unknown.to_string(), "Unknown");
    }

    #[test]
    fn test_serde_canonical_on_write_lenient_on_read() {
        assert_eq!(serde_json::to_string(&Role::Node).unwrap(), "\"Node\"");
        let parsed: Role = serde_json::from_str("\"coordinator\"").unwrap();
        assert_eq!(parsed, Role::Coordinator);
        let parsed: Role = serde_json::from_str("\"bogus\"").unwrap();
        assert_eq!(parsed, Role::Unknown);
    }

    #[test]
    fn test_extract_role() {
        let mut metadata = BTreeMap::new();
        assert_eq!(extract_role(&metadata), Role::Unknown);

        metadata.insert(ROLE_METADATA_KEY.to_string(), "Coordinator".to_string());
        assert_eq!(extract_role(&metadata), Role::Coordinator);

        metadata.insert(ROLE_METADATA_KEY.to_string(), "Node".to_string());
        assert_eq!(extract_role(&metadata), Role::Node);

        metadata.insert(ROLE_METADATA_KEY.to_string(), "\u{0}garbage".to_string());
        assert_eq!(extract_role(&metadata), Role::Unknown);
    }
}
