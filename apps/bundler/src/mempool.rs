use aa::UserOperation;
use alloy::primitives::Address;
use std::collections::HashMap;

use crate::reputation::{ReputationManager, ReputationStatus};

/// Throttled entities still get a trickle of inclusions per bundle.
const THROTTLED_ENTITY_BUNDLE_COUNT: usize = 4;

#[derive(Debug, Clone)]
struct PoolOperation {
    op: UserOperation,
    sender_staked: bool,
}

/// In-memory pool of validated UserOperations, keyed by (sender, nonce).
/// Arrival order is bundling order.
#[derive(Debug)]
pub struct Mempool {
    ops: Vec<PoolOperation>,
    max_bundle_size: usize,
}

impl Mempool {
    pub fn new(max_bundle_size: usize) -> Self {
        Self {
            ops: Vec::new(),
            max_bundle_size: max_bundle_size.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Stores a validated op, replacing any previous op with the same sender
    /// and nonce, and records a sighting for each of its entities.
    pub fn add_user_operation(
        &mut self,
        op: UserOperation,
        sender_staked: bool,
        reputation: &mut ReputationManager,
    ) {
        reputation.update_seen(op.sender);
        if let Some(factory) = op.factory_address() {
            reputation.update_seen(factory);
        }
        if let Some(paymaster) = op.paymaster_address() {
            reputation.update_seen(paymaster);
        }

        let key = (op.sender, op.nonce);
        self.ops.retain(|pooled| (pooled.op.sender, pooled.op.nonce) != key);
        self.ops.push(PoolOperation { op, sender_staked });
    }

    /// Next batch to bundle. Ops from banned entities are dropped from the
    /// pool; throttled entities are capped per bundle; an unstaked sender
    /// contributes at most one op per bundle. Selected ops leave the pool.
    pub fn get_user_operations_to_bundle(
        &mut self,
        reputation: &ReputationManager,
    ) -> Vec<UserOperation> {
        let mut selected: Vec<UserOperation> = Vec::new();
        let mut remaining: Vec<PoolOperation> = Vec::new();
        let mut senders_in_bundle: HashMap<Address, bool> = HashMap::new();
        let mut entity_counts: HashMap<Address, usize> = HashMap::new();

        for pooled in std::mem::take(&mut self.ops) {
            if selected.len() >= self.max_bundle_size {
                remaining.push(pooled);
                continue;
            }

            let entities = op_entities(&pooled.op);
            if entities
                .iter()
                .any(|entity| reputation.status(*entity) == ReputationStatus::Banned)
            {
                tracing::info!(
                    sender = %pooled.op.sender,
                    nonce = %pooled.op.nonce,
                    "dropping op from banned entity"
                );
                continue;
            }

            let throttled_at_cap = entities.iter().any(|entity| {
                reputation.status(*entity) == ReputationStatus::Throttled
                    && entity_counts.get(entity).copied().unwrap_or(0)
                        >= THROTTLED_ENTITY_BUNDLE_COUNT
            });
            if throttled_at_cap {
                remaining.push(pooled);
                continue;
            }

            if let Some(staked) = senders_in_bundle.get(&pooled.op.sender)
                && !staked
            {
                remaining.push(pooled);
                continue;
            }

            senders_in_bundle.insert(pooled.op.sender, pooled.sender_staked);
            for entity in entities {
                *entity_counts.entry(entity).or_default() += 1;
            }
            selected.push(pooled.op);
        }

        self.ops = remaining;
        selected
    }

}

fn op_entities(op: &UserOperation) -> Vec<Address> {
    let mut entities = vec![op.sender];
    if let Some(factory) = op.factory_address() {
        entities.push(factory);
    }
    if let Some(paymaster) = op.paymaster_address() {
        entities.push(paymaster);
    }
    entities
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_op;
    use alloy::primitives::{Bytes, U256};

    fn op_with(sender_byte: u8, nonce: u64) -> UserOperation {
        let mut op = test_op();
        op.sender = Address::repeat_byte(sender_byte);
        op.nonce = U256::from(nonce);
        op
    }

    #[test]
    fn same_sender_nonce_replaces() {
        let mut reputation = ReputationManager::new();
        let mut pool = Mempool::new(10);

        let mut first = op_with(1, 0);
        first.call_gas_limit = U256::from(1u64);
        let mut second = op_with(1, 0);
        second.call_gas_limit = U256::from(2u64);

        pool.add_user_operation(first, false, &mut reputation);
        pool.add_user_operation(second.clone(), false, &mut reputation);
        assert_eq!(pool.len(), 1);

        let bundle = pool.get_user_operations_to_bundle(&reputation);
        assert_eq!(bundle, vec![second]);
        assert!(pool.is_empty());
    }

    #[test]
    fn adding_records_seen_for_all_entities() {
        let mut reputation = ReputationManager::new();
        let mut pool = Mempool::new(10);

        let paymaster = Address::repeat_byte(9);
        let mut op = op_with(1, 0);
        op.paymaster_and_data = Bytes::from(paymaster.to_vec());

        pool.add_user_operation(op.clone(), false, &mut reputation);
        assert_eq!(reputation.ops_seen(op.sender), 1);
        assert_eq!(reputation.ops_seen(paymaster), 1);
    }

    #[test]
    fn unstaked_sender_gets_one_op_per_bundle() {
        let mut reputation = ReputationManager::new();
        let mut pool = Mempool::new(10);

        pool.add_user_operation(op_with(1, 0), false, &mut reputation);
        pool.add_user_operation(op_with(1, 1), false, &mut reputation);
        pool.add_user_operation(op_with(2, 0), false, &mut reputation);

        let bundle = pool.get_user_operations_to_bundle(&reputation);
        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle[0].sender, Address::repeat_byte(1));
        assert_eq!(bundle[1].sender, Address::repeat_byte(2));

        // The second op of the unstaked sender waits for the next bundle.
        assert_eq!(pool.len(), 1);
        let next = pool.get_user_operations_to_bundle(&reputation);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].nonce, U256::from(1u64));
    }

    #[test]
    fn staked_sender_may_fill_multiple_slots() {
        let mut reputation = ReputationManager::new();
        let mut pool = Mempool::new(10);

        pool.add_user_operation(op_with(1, 0), true, &mut reputation);
        pool.add_user_operation(op_with(1, 1), true, &mut reputation);

        let bundle = pool.get_user_operations_to_bundle(&reputation);
        assert_eq!(bundle.len(), 2);
    }

    #[test]
    fn banned_entity_ops_are_dropped() {
        let mut reputation = ReputationManager::new();
        let mut pool = Mempool::new(10);

        pool.add_user_operation(op_with(1, 0), false, &mut reputation);
        reputation.ban(Address::repeat_byte(1));

        assert!(pool.get_user_operations_to_bundle(&reputation).is_empty());
        assert!(pool.is_empty());
    }

    #[test]
    fn bundle_size_is_bounded() {
        let mut reputation = ReputationManager::new();
        let mut pool = Mempool::new(2);

        for sender in 1..=4u8 {
            pool.add_user_operation(op_with(sender, 0), false, &mut reputation);
        }

        assert_eq!(pool.get_user_operations_to_bundle(&reputation).len(), 2);
        assert_eq!(pool.len(), 2);
    }
}
