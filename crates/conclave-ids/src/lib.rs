//! Opaque identifiers and clock helpers shared by every conclave crate.
//!
//! Every id in the wire protocol (`MessageId`, `TaskId`, `ConnectionId`,
//! `AgentId`, `ServiceId`, `ClientId`) is a UUIDv4 wrapped in its own type so
//! that a `TaskId` can never be passed where a `ConnectionId` is expected.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl From<Uuid> for $name {
            fn from(u: Uuid) -> Self {
                Self(u)
            }
        }
    };
}

opaque_id!(MessageId);
opaque_id!(TaskId);
opaque_id!(ConnectionId);
opaque_id!(AgentId);
opaque_id!(ServiceId);
opaque_id!(ClientId);
opaque_id!(ToolServerId);

/// RFC 3339 timestamp assigned by the orchestrator on egress, never by a peer.
pub fn now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

pub fn now_rfc3339() -> String {
    now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_round_trip_through_display() {
        let a = MessageId::new();
        let b = MessageId::new();
        assert_ne!(a, b);
        let parsed: MessageId = a.to_string().parse().unwrap();
        assert_eq!(a, parsed);
    }

    #[test]
    fn ids_serialize_as_bare_strings() {
        let id = TaskId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.0));
    }

    #[test]
    fn now_rfc3339_is_parseable() {
        let ts = now_rfc3339();
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
