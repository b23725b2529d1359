//! Per-chain finality tiers.
//!
//! Each chain maps to four block counts (instant / fast / safe / finalized).
//! Chains not in the table fall back to a default tier set.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::TrackError;

/// A finality tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationTier {
    Instant,
    #[default]
    Fast,
    Safe,
    Finalized,
}

impl std::fmt::Display for ConfirmationTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Instant => write!(f, "instant"),
            Self::Fast => write!(f, "fast"),
            Self::Safe => write!(f, "safe"),
            Self::Finalized => write!(f, "finalized"),
        }
    }
}

/// Block counts for each tier on one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tiers {
    pub instant: u64,
    pub fast: u64,
    pub safe: u64,
    pub finalized: u64,
}

impl Tiers {
    pub const fn new(instant: u64, fast: u64, safe: u64, finalized: u64) -> Self {
        Self {
            instant,
            fast,
            safe,
            finalized,
        }
    }

    pub fn get(&self, tier: ConfirmationTier) -> u64 {
        match tier {
            ConfirmationTier::Instant => self.instant,
            ConfirmationTier::Fast => self.fast,
            ConfirmationTier::Safe => self.safe,
            ConfirmationTier::Finalized => self.finalized,
        }
    }
}

/// Tiers used for chains missing from the table.
pub const DEFAULT_TIERS: Tiers = Tiers::new(1, 6, 12, 64);

/// Built-in table: (chain id, name, tiers).
const BUILTIN: &[(u64, &str, Tiers)] = &[
    (1, "ethereum", Tiers::new(1, 12, 32, 64)),
    (11_155_111, "sepolia", Tiers::new(1, 6, 32, 64)),
    (17_000, "holesky", Tiers::new(1, 6, 32, 64)),
    (10, "optimism", Tiers::new(1, 10, 60, 1_800)),
    (8_453, "base", Tiers::new(1, 10, 60, 1_800)),
    (42_161, "arbitrum", Tiers::new(1, 20, 240, 4_800)),
    (137, "polygon", Tiers::new(1, 32, 128, 256)),
    (56, "bsc", Tiers::new(1, 3, 15, 30)),
    (43_114, "avalanche", Tiers::new(1, 1, 2, 4)),
    (100, "gnosis", Tiers::new(1, 8, 20, 40)),
];

/// Static mapping from chain id to finality tiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationPolicy {
    #[serde(default)]
    chains: HashMap<u64, Tiers>,
    #[serde(default = "default_tiers")]
    default: Tiers,
}

fn default_tiers() -> Tiers {
    DEFAULT_TIERS
}

impl Default for ConfirmationPolicy {
    /// The built-in table.
    fn default() -> Self {
        Self {
            chains: BUILTIN.iter().map(|(id, _, tiers)| (*id, *tiers)).collect(),
            default: DEFAULT_TIERS,
        }
    }
}

impl ConfirmationPolicy {
    /// A policy with no per-chain entries; every chain uses `default`.
    pub fn uniform(default: Tiers) -> Self {
        Self {
            chains: HashMap::new(),
            default,
        }
    }

    /// Load a policy from JSON, e.g. `{"chains": {"1": {...}}, "default": {...}}`.
    pub fn from_json(json: &str) -> Result<Self, TrackError> {
        serde_json::from_str(json).map_err(|e| TrackError::Other(format!("confirmation policy: {e}")))
    }

    /// Override (or add) the tiers for one chain.
    pub fn with_chain(mut self, chain_id: u64, tiers: Tiers) -> Self {
        self.chains.insert(chain_id, tiers);
        self
    }

    /// Tiers for `chain_id`, falling back to the default set.
    pub fn tiers(&self, chain_id: u64) -> Tiers {
        self.chains.get(&chain_id).copied().unwrap_or(self.default)
    }

    /// Number of confirmations for `chain_id` at `tier`.
    pub fn threshold(&self, chain_id: u64, tier: ConfirmationTier) -> u64 {
        self.tiers(chain_id).get(tier)
    }

    /// Returns `true` if the chain has its own entry.
    pub fn is_known(&self, chain_id: u64) -> bool {
        self.chains.contains_key(&chain_id)
    }

    /// All per-chain entries, sorted by chain id.
    pub fn entries(&self) -> Vec<(u64, Tiers)> {
        let mut out: Vec<_> = self.chains.iter().map(|(id, t)| (*id, *t)).collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    pub fn default_tiers(&self) -> Tiers {
        self.default
    }
}

/// Human name of a built-in chain id.
pub fn chain_name(chain_id: u64) -> Option<&'static str> {
    BUILTIN
        .iter()
        .find(|(id, _, _)| *id == chain_id)
        .map(|(_, name, _)| *name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_chain_uses_its_tiers() {
        let policy = ConfirmationPolicy::default();
        assert!(policy.is_known(1));
        assert_eq!(policy.threshold(1, ConfirmationTier::Fast), 12);
        assert_eq!(policy.threshold(1, ConfirmationTier::Finalized), 64);
        assert_eq!(chain_name(137), Some("polygon"));
    }

    #[test]
    fn unknown_chain_falls_back_to_default() {
        let policy = ConfirmationPolicy::default();
        assert!(!policy.is_known(999_999));
        assert_eq!(policy.tiers(999_999), DEFAULT_TIERS);
        assert_eq!(policy.threshold(999_999, ConfirmationTier::default()), DEFAULT_TIERS.fast);
    }

    #[test]
    fn override_and_json() {
        let policy = ConfirmationPolicy::uniform(Tiers::new(0, 2, 4, 8)).with_chain(5, Tiers::new(1, 1, 1, 1));
        assert_eq!(policy.threshold(5, ConfirmationTier::Safe), 1);
        assert_eq!(policy.threshold(6, ConfirmationTier::Safe), 4);

        let json = r#"{"chains": {"7": {"instant": 1, "fast": 3, "safe": 5, "finalized": 9}}}"#;
        let loaded = ConfirmationPolicy::from_json(json).unwrap();
        assert_eq!(loaded.threshold(7, ConfirmationTier::Fast), 3);
        assert_eq!(loaded.default_tiers(), DEFAULT_TIERS);
        assert!(ConfirmationPolicy::from_json("not json").is_err());
    }
}
