use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps a raw identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// The raw identifier.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Identity of a registered agent, chosen by the agent runtime.
    ///
    /// Ordering is used as the global lock order when two agents' ledger
    /// entries must be held at once.
    AgentId
);

string_id!(
    /// Identity of a submitted task, chosen by the submitter.
    TaskId
);

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_ordering() {
        let a = AgentId::from("agent-a");
        let b = AgentId::new("agent-b");
        assert_eq!(a.to_string(), "agent-a");
        assert!(a < b);
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let id = TaskId::from("task-7");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"task-7\"");
        let parsed: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }
}
