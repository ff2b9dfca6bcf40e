//! Session operating mode.

use serde::{Deserialize, Serialize};

/// Whether proposed file changes wait for the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    /// The user approves each change (default)
    #[default]
    Copilot,
    /// Changes are applied as soon as they are proposed
    Agent,
}

impl AgentMode {
    pub fn auto_apply(&self) -> bool {
        matches!(self, Self::Agent)
    }
}

impl std::str::FromStr for AgentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "copilot" | "co-pilot" => Ok(Self::Copilot),
            "agent" => Ok(Self::Agent),
            other => Err(format!("unknown mode '{other}' (expected copilot or agent)")),
        }
    }
}
