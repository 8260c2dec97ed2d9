//! Genlock operating mode

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::FrameLockError;

/// Role of a clock sync engine within a genlock group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenlockMode {
    /// Free-running local clock, no network traffic
    #[default]
    Disabled,

    /// Broadcasts the timing reference
    #[serde(alias = "master")]
    Reference,

    /// Aligns its clock to a reference
    #[serde(alias = "slave")]
    Follower,
}

impl GenlockMode {
    pub fn as_str(self) -> &'static str {
        match self {
            GenlockMode::Disabled => "disabled",
            GenlockMode::Reference => "reference",
            GenlockMode::Follower => "follower",
        }
    }

    /// Whether this mode needs a socket and a network task.
    pub fn uses_network(self) -> bool {
        !matches!(self, GenlockMode::Disabled)
    }
}

impl fmt::Display for GenlockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenlockMode {
    type Err = FrameLockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" | "none" => Ok(GenlockMode::Disabled),
            "reference" | "master" => Ok(GenlockMode::Reference),
            "follower" | "slave" => Ok(GenlockMode::Follower),
            other => Err(FrameLockError::invalid_config(
                "genlock.mode",
                format!("unknown mode '{}' (expected disabled, reference or follower)", other),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_legacy_names() {
        assert_eq!("master".parse::<GenlockMode>().unwrap(), GenlockMode::Reference);
        assert_eq!("Slave".parse::<GenlockMode>().unwrap(), GenlockMode::Follower);
        assert_eq!(" disabled ".parse::<GenlockMode>().unwrap(), GenlockMode::Disabled);
        assert!("leader".parse::<GenlockMode>().is_err());
    }

    #[test]
    fn serde_accepts_aliases() {
        let mode: GenlockMode = serde_yaml_ng::from_str("master").unwrap();
        assert_eq!(mode, GenlockMode::Reference);
        assert_eq!(serde_yaml_ng::to_string(&GenlockMode::Follower).unwrap().trim(), "follower");
    }

    #[test]
    fn only_disabled_is_offline() {
        assert!(!GenlockMode::Disabled.uses_network());
        assert!(GenlockMode::Reference.uses_network());
        assert!(GenlockMode::Follower.uses_network());
    }
}
