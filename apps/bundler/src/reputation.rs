use alloy::primitives::Address;
use std::collections::{HashMap, HashSet};

/// ERC-4337 reputation thresholds: an entity whose seen/included ratio drifts
/// past the slack is throttled, then banned.
const MIN_INCLUSION_RATE_DENOMINATOR: u64 = 10;
const THROTTLING_SLACK: u64 = 10;
const BAN_SLACK: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationStatus {
    Ok,
    Throttled,
    Banned,
}

#[derive(Debug, Clone, Copy, Default)]
struct ReputationEntry {
    ops_seen: u64,
    ops_included: u64,
}

/// In-memory reputation counters for senders, factories and paymasters.
/// Mutations go through `&mut self`; the bundle task is the single writer.
#[derive(Debug, Default)]
pub struct ReputationManager {
    entries: HashMap<Address, ReputationEntry>,
    banned: HashSet<Address>,
}

impl ReputationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_seen(&mut self, address: Address) {
        self.entries.entry(address).or_default().ops_seen += 1;
    }

    pub fn update_included(&mut self, address: Address) {
        self.entries.entry(address).or_default().ops_included += 1;
    }

    pub fn ban(&mut self, address: Address) {
        tracing::warn!(entity = %address, "banning entity");
        self.banned.insert(address);
    }

    pub fn status(&self, address: Address) -> ReputationStatus {
        if self.banned.contains(&address) {
            return ReputationStatus::Banned;
        }
        let Some(entry) = self.entries.get(&address) else {
            return ReputationStatus::Ok;
        };

        let max_seen = entry.ops_seen / MIN_INCLUSION_RATE_DENOMINATOR;
        if max_seen > entry.ops_included + BAN_SLACK {
            ReputationStatus::Banned
        } else if max_seen > entry.ops_included + THROTTLING_SLACK {
            ReputationStatus::Throttled
        } else {
            ReputationStatus::Ok
        }
    }

    pub fn ops_included(&self, address: Address) -> u64 {
        self.entries.get(&address).map_or(0, |entry| entry.ops_included)
    }

    pub fn ops_seen(&self, address: Address) -> u64 {
        self.entries.get(&address).map_or(0, |entry| entry.ops_seen)
    }
}
