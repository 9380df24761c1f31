//! Rule rows, rule elements and rule-set metadata.

use crate::object::ObjectId;
use std::collections::BTreeMap;

/// A positional slot in a rule: a list of object references plus a negation
/// flag. The empty list is the distinguished "any" marker; negation is only
/// meaningful when the list is non-empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleElement {
    pub items: Vec<ObjectId>,
    pub negated: bool,
}

impl RuleElement {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn of(items: Vec<ObjectId>) -> Self {
        Self {
            items,
            negated: false,
        }
    }

    pub fn is_any(&self) -> bool {
        self.items.is_empty()
    }

    /// The single object, when the element holds exactly one.
    pub fn single(&self) -> Option<ObjectId> {
        match self.items.as_slice() {
            [one] => Some(*one),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Reset to "any", clearing negation.
    pub fn clear(&mut self) {
        self.items.clear();
        self.negated = false;
    }
}

/// Traffic direction relative to the firewall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    Inbound,
    Outbound,
    Both,
    /// Not set in the source; normalized to `Both` early in the pipeline.
    #[default]
    Undefined,
}

impl Direction {
    /// One-letter code used by the debug printer.
    pub fn code(&self) -> char {
        match self {
            Direction::Inbound => 'i',
            Direction::Outbound => 'o',
            Direction::Both => 'b',
            Direction::Undefined => '?',
        }
    }
}

/// Rule actions. Parameters (reject kind, branch target, raw code) live in
/// [`RuleOptions`] so that action rewriting does not lose them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Accept,
    Deny,
    Reject,
    Return,
    Continue,
    Accounting,
    Pipe,
    Custom,
    Branch,
    Tag,
    Classify,
    Route,
    Modify,
    Scrub,
    Skip,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Accept => "Accept",
            Action::Deny => "Deny",
            Action::Reject => "Reject",
            Action::Return => "Return",
            Action::Continue => "Continue",
            Action::Accounting => "Accounting",
            Action::Pipe => "Pipe",
            Action::Custom => "Custom",
            Action::Branch => "Branch",
            Action::Tag => "Tag",
            Action::Classify => "Classify",
            Action::Route => "Route",
            Action::Modify => "Modify",
            Action::Scrub => "Scrub",
            Action::Skip => "Skip",
        }
    }

    /// Terminating actions stop rule-set traversal for a matched packet.
    /// Shadow detection only considers these as shadowers.
    pub fn is_terminating(&self) -> bool {
        matches!(
            self,
            Action::Accept | Action::Deny | Action::Reject | Action::Return | Action::Pipe
        )
    }
}

/// Boolean options and action parameters carried on every rule.
///
/// Unknown keys found in the source document are preserved in `extras` so
/// the compiler can warn about them instead of silently dropping them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleOptions {
    pub log: bool,
    pub stateless: bool,
    pub tagging: bool,
    pub classification: bool,
    pub routing: bool,
    pub mark_connections: bool,

    pub log_prefix: Option<String>,
    pub log_level: Option<String>,
    pub limit_value: Option<String>,
    pub limit_burst: Option<u32>,
    pub connlimit_above: Option<u32>,
    pub connlimit_masklen: Option<u8>,
    pub hashlimit_value: Option<String>,
    pub hashlimit_name: Option<String>,
    pub hashlimit_mode: Option<String>,

    pub reject_with: Option<String>,
    pub branch_target: Option<ObjectId>,
    pub custom_code: Option<String>,
    pub accounting_chain: Option<String>,
    pub tag_value: Option<String>,
    pub classify_value: Option<String>,
    pub route_gateway: Option<String>,
    pub route_interface: Option<String>,

    pub extras: BTreeMap<String, String>,
}

impl RuleOptions {
    /// Clear logging and rate-limit knobs; jump rules generated by the
    /// splitting stages must not log or limit on their own.
    pub fn strip_log_and_limits(&mut self) {
        self.log = false;
        self.log_prefix = None;
        self.log_level = None;
        self.limit_value = None;
        self.limit_burst = None;
        self.connlimit_above = None;
        self.connlimit_masklen = None;
        self.hashlimit_value = None;
        self.hashlimit_name = None;
        self.hashlimit_mode = None;
    }
}

/// A policy rule row as loaded from the source graph.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyRuleData {
    pub src: RuleElement,
    pub dst: RuleElement,
    pub srv: RuleElement,
    pub itf: RuleElement,
    pub time: RuleElement,
    pub direction: Direction,
    pub action: Action,
    pub options: RuleOptions,
    pub position: usize,
    pub label: String,
    pub disabled: bool,
    pub comment: String,
}

/// A NAT rule row.
#[derive(Debug, Clone, PartialEq)]
pub struct NatRuleData {
    pub osrc: RuleElement,
    pub odst: RuleElement,
    pub osrv: RuleElement,
    pub tsrc: RuleElement,
    pub tdst: RuleElement,
    pub tsrv: RuleElement,
    pub itf_in: RuleElement,
    pub itf_out: RuleElement,
    pub action: Action,
    pub options: RuleOptions,
    pub position: usize,
    pub label: String,
    pub disabled: bool,
    pub comment: String,
}

/// A routing rule row.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingRuleData {
    pub dst: RuleElement,
    pub gateway: RuleElement,
    pub itf: RuleElement,
    pub metric: u32,
    pub options: RuleOptions,
    pub position: usize,
    pub label: String,
    pub disabled: bool,
    pub comment: String,
}

/// Address-family setting on a rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuleSetFamily {
    V4,
    V6,
    #[default]
    Both,
}

impl RuleSetFamily {
    pub fn includes(&self, family: crate::Family) -> bool {
        match self {
            RuleSetFamily::V4 => family == crate::Family::V4,
            RuleSetFamily::V6 => family == crate::Family::V6,
            RuleSetFamily::Both => true,
        }
    }
}

/// Metadata on a policy/NAT/routing rule set; the rules themselves are the
/// rule set's children in the arena.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSetData {
    pub family: RuleSetFamily,
    /// Top rule sets compile into the built-in chains; branch rule sets
    /// become user chains named after the set.
    pub top: bool,
}
