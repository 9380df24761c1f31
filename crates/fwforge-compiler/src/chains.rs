//! Chain bookkeeping: usage counting, temp-chain allocation and the
//! iptables chain-name length limit.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// iptables rejects chain names longer than this.
pub const MAX_CHAIN_NAME: usize = 30;

pub const BUILTIN_CHAINS: [&str; 5] =
    ["INPUT", "OUTPUT", "FORWARD", "PREROUTING", "POSTROUTING"];

/// Targets that are not user-chain references.
pub const BUILTIN_TARGETS: [&str; 16] = [
    "ACCEPT", "DROP", "REJECT", "RETURN", "QUEUE", "LOG", "MARK", "CONNMARK", "CLASSIFY",
    "ROUTE", "SNAT", "DNAT", "MASQUERADE", "REDIRECT", "NETMAP", "ULOG",
];

pub fn is_builtin_chain(name: &str) -> bool {
    BUILTIN_CHAINS.contains(&name)
}

pub fn is_builtin_target(name: &str) -> bool {
    BUILTIN_TARGETS.contains(&name)
}

/// Per-compile chain registry. Allocation order is the deterministic source
/// of temp-chain names; the usage counter lets the emitter skip chains
/// nothing jumps to.
#[derive(Debug, Default)]
pub struct ChainRegistry {
    usage: BTreeMap<String, u32>,
    temp_counter: u32,
    base: String,
}

impl ChainRegistry {
    pub fn new(rule_set_name: &str) -> Self {
        Self {
            usage: BTreeMap::new(),
            temp_counter: 0,
            base: sanitize(rule_set_name),
        }
    }

    /// Allocate a fresh user chain for a splitting stage. `hint` names the
    /// reason (negation, logging, optimization) and the rule position ties
    /// the name to its origin for readable scripts.
    pub fn fresh_chain(&mut self, hint: &str, position: usize) -> String {
        let n = self.temp_counter;
        self.temp_counter += 1;
        fit_chain_name(&format!("{}_{}_{}_{}", self.base, hint, position, n))
    }

    /// Record a `-j chain` reference.
    pub fn count_target(&mut self, chain: &str) {
        if !is_builtin_target(chain) && !is_builtin_chain(chain) {
            *self.usage.entry(chain.to_string()).or_insert(0) += 1;
        }
    }

    pub fn usage_of(&self, chain: &str) -> u32 {
        self.usage.get(chain).copied().unwrap_or(0)
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Shorten a chain name to the iptables limit, keeping a readable prefix
/// and a hash suffix so distinct long names stay distinct.
pub fn fit_chain_name(name: &str) -> String {
    if name.len() <= MAX_CHAIN_NAME {
        return name.to_string();
    }
    let digest = Sha256::digest(name.as_bytes());
    let suffix = hex::encode(&digest[..3]);
    let prefix: String = name.chars().take(MAX_CHAIN_NAME - 7).collect();
    format!("{}_{}", prefix, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_chains_are_unique_and_deterministic() {
        let mut a = ChainRegistry::new("Policy");
        let mut b = ChainRegistry::new("Policy");
        let c1 = a.fresh_chain("neg", 2);
        let c2 = a.fresh_chain("neg", 2);
        assert_ne!(c1, c2);
        assert_eq!(c1, b.fresh_chain("neg", 2));
    }

    #[test]
    fn long_names_are_hashed_to_fit() {
        let long = "a".repeat(64);
        let fitted = fit_chain_name(&long);
        assert_eq!(fitted.len(), MAX_CHAIN_NAME);
        assert_ne!(fit_chain_name(&"b".repeat(64)), fitted);
        assert_eq!(fit_chain_name("INPUT"), "INPUT");
    }

    #[test]
    fn usage_counts_only_user_chains() {
        let mut reg = ChainRegistry::new("Policy");
        reg.count_target("ACCEPT");
        reg.count_target("FORWARD");
        reg.count_target("mychain");
        reg.count_target("mychain");
        assert_eq!(reg.usage_of("ACCEPT"), 0);
        assert_eq!(reg.usage_of("mychain"), 2);
    }
}
