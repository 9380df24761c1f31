//! Object model for fwforge.
//!
//! The model is an identity-addressed arena of network entities: addresses,
//! services, interfaces, firewalls, clusters, groups, time intervals, rule
//! sets and rules. Cross-references between objects are [`ObjectId`] handles
//! into the arena; containment is a parent pointer plus an ordered child
//! list. Compilers never mutate the arena — they deep-copy rules out of it
//! and work on the copies.

pub mod address;
pub mod object;
pub mod rules;
pub mod service;
pub mod yaml;

pub use object::{
    DeviceType, InterfaceData, Object, ObjectId, ObjectKind, ObjectStore,
};
pub use rules::{
    Action, Direction, NatRuleData, PolicyRuleData, RoutingRuleData, RuleElement, RuleOptions,
    RuleSetData, RuleSetFamily,
};
pub use service::{PortRange, TcpFlags};

use thiserror::Error;

/// Address family a compile pass runs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn as_str(&self) -> &'static str {
        match self {
            Family::V4 => "ipv4",
            Family::V6 => "ipv6",
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown object '{0}'")]
    UnknownObject(String),
    #[error("duplicate object name '{0}'")]
    DuplicateName(String),
    #[error("object '{name}' is not usable here: {reason}")]
    BadReference { name: String, reason: String },
    #[error("failed to parse graph: {0}")]
    Parse(String),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
