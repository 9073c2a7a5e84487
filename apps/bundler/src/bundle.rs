use aa::contracts::IEntryPoint;
use aa::{UserOperation, encode_handle_ops};
use alloy::consensus::{SignableTransaction, TxEip1559, TxEnvelope, TxLegacy};
use alloy::eips::eip2718::Encodable2718;
use alloy::network::TxSignerSync;
use alloy::primitives::{B256, Bytes, TxKind, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolError;
use anyhow::{Context, Result};
use futures::future::OptionFuture;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::config::BundlerConfig;
use crate::gas::estimate_call_gas_limit;
use crate::mempool::Mempool;
use crate::reputation::ReputationManager;
use crate::rpc::{EthRpc, parse_quantity_u64, parse_quantity_u128};

/// Owns the mempool and the reputation store and drives bundle submission.
/// One instance runs per bundler task; everything here is single-writer.
pub struct BundleManager<R> {
    rpc: Arc<R>,
    cfg: BundlerConfig,
    signer: PrivateKeySigner,
    mempool: Mempool,
    reputation: ReputationManager,
}

enum SubmitOutcome {
    Submitted(B256),
    FailedOp { op_index: usize, reason: String },
    Rejected(String),
}

impl<R: EthRpc> BundleManager<R> {
    pub fn new(rpc: Arc<R>, cfg: BundlerConfig) -> Result<Self> {
        let signer =
            PrivateKeySigner::from_slice(&cfg.bundler_private_key).context("bundler signing key")?;
        let mempool = Mempool::new(cfg.max_bundle_size);
        Ok(Self {
            rpc,
            cfg,
            signer,
            mempool,
            reputation: ReputationManager::new(),
        })
    }

    /// Admits a validated op into the pool. `sender_staked` is the
    /// validator's verdict and controls how many slots the sender may take
    /// per bundle.
    pub fn add_user_operation(&mut self, op: UserOperation, sender_staked: bool) {
        self.mempool
            .add_user_operation(op, sender_staked, &mut self.reputation);
    }

    pub fn reputation(&self) -> &ReputationManager {
        &self.reputation
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    /// Pulls the next batch from the mempool and submits it, if any.
    pub async fn send_next_bundle(&mut self) -> Result<Option<B256>> {
        let ops = self.mempool.get_user_operations_to_bundle(&self.reputation);
        if ops.is_empty() {
            tracing::debug!("no user operations to bundle");
            return Ok(None);
        }
        tracing::info!(ops = ops.len(), "sending bundle");
        self.send_bundle(ops).await
    }

    /// Submits `handleOps(ops)` and recovers per-op failures: the op named by
    /// a `FailedOp` revert is evicted, its offending entity banned, and the
    /// strictly smaller remainder resubmitted. Any other submission error
    /// drops the whole bundle.
    pub async fn send_bundle(&mut self, mut ops: Vec<UserOperation>) -> Result<Option<B256>> {
        while !ops.is_empty() {
            match self.submit_once(&ops).await? {
                SubmitOutcome::Submitted(tx_hash) => {
                    for op in &ops {
                        self.reputation.update_included(op.sender);
                        if let Some(factory) = op.factory_address() {
                            self.reputation.update_included(factory);
                        }
                        if let Some(paymaster) = op.paymaster_address() {
                            self.reputation.update_included(paymaster);
                        }
                    }
                    tracing::info!(tx_hash = %tx_hash, ops = ops.len(), "bundle submitted");
                    return Ok(Some(tx_hash));
                }
                SubmitOutcome::FailedOp { op_index, reason } => {
                    if op_index >= ops.len() {
                        tracing::error!(
                            op_index,
                            ops = ops.len(),
                            "FailedOp index out of range, dropping bundle"
                        );
                        return Ok(None);
                    }
                    let failed = ops.remove(op_index);
                    self.penalize(&failed, &reason);
                    tracing::info!(
                        sender = %failed.sender,
                        reason,
                        remaining = ops.len(),
                        "dropped user operation that crashed the bundle"
                    );
                }
                SubmitOutcome::Rejected(message) => {
                    tracing::warn!(
                        error = %message,
                        "failed to send bundle, dropping all user operations"
                    );
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }

    async fn submit_once(&self, ops: &[UserOperation]) -> Result<SubmitOutcome> {
        let call_bytes = encode_handle_ops(ops, self.cfg.bundler_address);
        let call_data = format!("0x{}", hex::encode(&call_bytes));

        let gas_estimate_fut = estimate_call_gas_limit(
            self.rpc.as_ref(),
            &call_data,
            self.cfg.bundler_address,
            self.cfg.entrypoint,
        );
        let gas_price_fut = self.rpc.request("eth_gasPrice", json!([]));
        let nonce_fut = self.rpc.request(
            "eth_getTransactionCount",
            json!([self.cfg.bundler_address, "latest"]),
        );
        let tip_fut: OptionFuture<_> = (!self.cfg.is_legacy_mode)
            .then(|| self.rpc.request("eth_maxPriorityFeePerGas", json!([])))
            .into();

        let (gas_estimate, gas_price_reply, nonce_reply, tip_reply) =
            tokio::join!(gas_estimate_fut, gas_price_fut, nonce_fut, tip_fut);

        let gas_limit = parse_quantity_u64(&Value::String(gas_estimate?))?;
        let gas_price =
            parse_quantity_u128(&gas_price_reply?.into_result("eth_gasPrice")?)?;
        let nonce =
            parse_quantity_u64(&nonce_reply?.into_result("eth_getTransactionCount")?)?;
        let tip = match tip_reply {
            Some(reply) => {
                parse_quantity_u128(&reply?.into_result("eth_maxPriorityFeePerGas")?)?
            }
            None => gas_price,
        };

        let raw_tx = self.sign_transaction(call_bytes, gas_limit, gas_price, tip, nonce)?;

        let method = if self.cfg.is_send_raw_transaction_conditional {
            "eth_sendRawTransactionConditional"
        } else {
            "eth_sendRawTransaction"
        };
        let reply = self.rpc.request(method, json!([raw_tx])).await?;

        if let Some(error) = reply.error {
            if let Some((op_index, reason)) = decode_failed_op(error.data.as_ref()) {
                return Ok(SubmitOutcome::FailedOp { op_index, reason });
            }
            return Ok(SubmitOutcome::Rejected(error.message));
        }

        let tx_hash = reply
            .result
            .as_ref()
            .and_then(Value::as_str)
            .with_context(|| format!("{method} returned no transaction hash"))?
            .parse::<B256>()
            .context("parse transaction hash")?;
        Ok(SubmitOutcome::Submitted(tx_hash))
    }

    fn sign_transaction(
        &self,
        input: Vec<u8>,
        gas_limit: u64,
        gas_price: u128,
        tip: u128,
        nonce: u64,
    ) -> Result<String> {
        let input = Bytes::from(input);
        let envelope: TxEnvelope = if self.cfg.is_legacy_mode {
            let mut tx = TxLegacy {
                chain_id: Some(self.cfg.chain_id),
                nonce,
                gas_price,
                gas_limit,
                to: TxKind::Call(self.cfg.entrypoint),
                value: U256::ZERO,
                input,
            };
            let signature = self
                .signer
                .sign_transaction_sync(&mut tx)
                .context("sign legacy transaction")?;
            tx.into_signed(signature).into()
        } else {
            let mut tx = TxEip1559 {
                chain_id: self.cfg.chain_id,
                nonce,
                gas_limit,
                max_fee_per_gas: gas_price,
                max_priority_fee_per_gas: tip,
                to: TxKind::Call(self.cfg.entrypoint),
                value: U256::ZERO,
                access_list: Default::default(),
                input,
            };
            let signature = self
                .signer
                .sign_transaction_sync(&mut tx)
                .context("sign eip-1559 transaction")?;
            tx.into_signed(signature).into()
        };
        Ok(format!("0x{}", hex::encode(envelope.encoded_2718())))
    }

    /// ERC-4337 blame attribution: AA1 reasons are factory failures, AA2
    /// account failures, AA3 paymaster failures.
    fn penalize(&mut self, op: &UserOperation, reason: &str) {
        if reason.starts_with("AA1") {
            if let Some(factory) = op.factory_address() {
                self.reputation.ban(factory);
            }
        } else if reason.starts_with("AA2") {
            self.reputation.ban(op.sender);
        } else if reason.starts_with("AA3") {
            if let Some(paymaster) = op.paymaster_address() {
                self.reputation.ban(paymaster);
            }
        }
    }
}

fn decode_failed_op(data: Option<&Value>) -> Option<(usize, String)> {
    let hex_str = data?.as_str()?;
    let bytes = hex::decode(hex_str.strip_prefix("0x").unwrap_or(hex_str)).ok()?;
    if bytes.len() < 4 || bytes[..4] != IEntryPoint::FailedOp::SELECTOR[..] {
        return None;
    }
    let failed = IEntryPoint::FailedOp::abi_decode_raw(&bytes[4..]).ok()?;
    let op_index = usize::try_from(failed.opIndex).ok()?;
    Some((op_index, failed.reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reputation::ReputationStatus;
    use crate::testutil::{MockRpc, test_config, test_op};
    use alloy::eips::eip2718::Decodable2718;
    use alloy::primitives::Address;
    use alloy::sol_types::SolCall;

    fn tx_hash_hex() -> String {
        format!("0x{}", "11".repeat(32))
    }

    fn push_fanout_replies(rpc: &MockRpc, legacy: bool) {
        rpc.push_result("eth_estimateGas", json!("0x5208"));
        rpc.push_result("eth_gasPrice", json!("0x3b9aca00"));
        rpc.push_result("eth_getTransactionCount", json!("0x0"));
        if !legacy {
            rpc.push_result("eth_maxPriorityFeePerGas", json!("0x1"));
        }
    }

    fn failed_op_data(op_index: u64, reason: &str) -> Value {
        let revert = IEntryPoint::FailedOp {
            opIndex: U256::from(op_index),
            reason: reason.to_string(),
        };
        Value::String(format!("0x{}", hex::encode(revert.abi_encode())))
    }

    fn submitted_envelope(rpc: &MockRpc, method: &str, index: usize) -> TxEnvelope {
        let params = &rpc.calls_for(method)[index];
        let raw = params[0].as_str().unwrap();
        let bytes = hex::decode(raw.strip_prefix("0x").unwrap()).unwrap();
        TxEnvelope::decode_2718(&mut bytes.as_slice()).unwrap()
    }

    #[tokio::test]
    async fn happy_path_submits_eip1559_bundle() {
        let rpc = Arc::new(MockRpc::new());
        push_fanout_replies(&rpc, false);
        rpc.push_result("eth_sendRawTransaction", json!(tx_hash_hex()));

        let cfg = test_config();
        let entrypoint = cfg.entrypoint;
        let mut manager = BundleManager::new(Arc::clone(&rpc), cfg).unwrap();

        let op = test_op();
        let sender = op.sender;
        let tx_hash = manager.send_bundle(vec![op]).await.unwrap().unwrap();
        assert_eq!(tx_hash, tx_hash_hex().parse::<B256>().unwrap());

        let envelope = submitted_envelope(&rpc, "eth_sendRawTransaction", 0);
        let TxEnvelope::Eip1559(signed) = envelope else {
            panic!("expected an EIP-1559 transaction");
        };
        let tx = signed.tx();
        assert_eq!(tx.to, TxKind::Call(entrypoint));
        assert_eq!(tx.gas_limit, 21_000);
        assert_eq!(tx.max_fee_per_gas, 1_000_000_000);
        assert_eq!(tx.max_priority_fee_per_gas, 1);
        assert_eq!(tx.nonce, 0);
        assert_eq!(tx.chain_id, 31337);
        assert_eq!(hex::encode(&tx.input[..4]), "1fad948c");

        assert_eq!(manager.reputation().ops_included(sender), 1);
    }

    #[tokio::test]
    async fn failed_op_evicts_and_resubmits_remainder() {
        let rpc = Arc::new(MockRpc::new());
        // First round: the node reports op[0] as failing.
        push_fanout_replies(&rpc, false);
        rpc.push_error(
            "eth_sendRawTransaction",
            -32000,
            "execution reverted",
            Some(failed_op_data(0, "AA23 reverted: bad sig")),
        );
        // Second round: the remainder goes through.
        push_fanout_replies(&rpc, false);
        rpc.push_result("eth_sendRawTransaction", json!(tx_hash_hex()));

        let mut manager = BundleManager::new(Arc::clone(&rpc), test_config()).unwrap();

        let bad = test_op();
        let mut good = test_op();
        good.sender = Address::repeat_byte(0x22);

        let tx_hash = manager
            .send_bundle(vec![bad.clone(), good.clone()])
            .await
            .unwrap();
        assert!(tx_hash.is_some());

        assert_eq!(
            manager.reputation().status(bad.sender),
            ReputationStatus::Banned
        );
        assert_eq!(manager.reputation().ops_included(bad.sender), 0);
        assert_eq!(manager.reputation().ops_included(good.sender), 1);

        // The resubmission carries only the surviving op.
        let envelope = submitted_envelope(&rpc, "eth_sendRawTransaction", 1);
        let TxEnvelope::Eip1559(signed) = envelope else {
            panic!("expected an EIP-1559 transaction");
        };
        let decoded = IEntryPoint::handleOpsCall::abi_decode(&signed.tx().input).unwrap();
        assert_eq!(decoded.ops.len(), 1);
        assert_eq!(decoded.ops[0].sender, good.sender);
    }

    #[tokio::test]
    async fn aa1_bans_factory_and_aa3_bans_paymaster() {
        let factory = Address::repeat_byte(0x33);
        let paymaster = Address::repeat_byte(0x44);

        for (reason, banned) in [
            ("AA13 initCode failed or OOG", factory),
            ("AA31 paymaster deposit too low", paymaster),
        ] {
            let rpc = Arc::new(MockRpc::new());
            push_fanout_replies(&rpc, false);
            rpc.push_error(
                "eth_sendRawTransaction",
                -32000,
                "execution reverted",
                Some(failed_op_data(0, reason)),
            );

            let mut manager = BundleManager::new(Arc::clone(&rpc), test_config()).unwrap();

            let mut op = test_op();
            let mut init_code = factory.to_vec();
            init_code.extend_from_slice(&[0u8; 4]);
            op.init_code = Bytes::from(init_code);
            op.paymaster_and_data = Bytes::from(paymaster.to_vec());

            let result = manager.send_bundle(vec![op.clone()]).await.unwrap();
            assert!(result.is_none(), "bundle is empty after eviction");

            assert_eq!(manager.reputation().status(banned), ReputationStatus::Banned);
            assert_eq!(
                manager.reputation().status(op.sender),
                ReputationStatus::Ok,
                "sender is not to blame for {reason}"
            );
        }
    }

    #[tokio::test]
    async fn undecodable_submission_error_drops_bundle() {
        let rpc = Arc::new(MockRpc::new());
        push_fanout_replies(&rpc, false);
        rpc.push_error("eth_sendRawTransaction", -32000, "nonce too low", None);

        let mut manager = BundleManager::new(Arc::clone(&rpc), test_config()).unwrap();
        let op = test_op();
        let result = manager.send_bundle(vec![op.clone()]).await.unwrap();

        assert!(result.is_none());
        assert_eq!(manager.reputation().status(op.sender), ReputationStatus::Ok);
        assert_eq!(rpc.calls_for("eth_sendRawTransaction").len(), 1);
    }

    #[tokio::test]
    async fn out_of_range_failed_op_index_drops_bundle() {
        let rpc = Arc::new(MockRpc::new());
        push_fanout_replies(&rpc, false);
        rpc.push_error(
            "eth_sendRawTransaction",
            -32000,
            "execution reverted",
            Some(failed_op_data(7, "AA23 reverted: bad sig")),
        );

        let mut manager = BundleManager::new(Arc::clone(&rpc), test_config()).unwrap();
        let op = test_op();
        let result = manager.send_bundle(vec![op.clone()]).await.unwrap();

        assert!(result.is_none());
        assert_eq!(manager.reputation().status(op.sender), ReputationStatus::Ok);
    }

    #[tokio::test]
    async fn legacy_mode_signs_a_legacy_transaction() {
        let rpc = Arc::new(MockRpc::new());
        push_fanout_replies(&rpc, true);
        rpc.push_result("eth_sendRawTransaction", json!(tx_hash_hex()));

        let mut cfg = test_config();
        cfg.is_legacy_mode = true;
        let mut manager = BundleManager::new(Arc::clone(&rpc), cfg).unwrap();

        manager.send_bundle(vec![test_op()]).await.unwrap().unwrap();

        assert!(rpc.calls_for("eth_maxPriorityFeePerGas").is_empty());
        let envelope = submitted_envelope(&rpc, "eth_sendRawTransaction", 0);
        let TxEnvelope::Legacy(signed) = envelope else {
            panic!("expected a legacy transaction");
        };
        assert_eq!(signed.tx().gas_price, 1_000_000_000);
        assert_eq!(signed.tx().chain_id, Some(31337));
    }

    #[tokio::test]
    async fn conditional_submission_uses_the_conditional_method() {
        let rpc = Arc::new(MockRpc::new());
        push_fanout_replies(&rpc, false);
        rpc.push_result("eth_sendRawTransactionConditional", json!(tx_hash_hex()));

        let mut cfg = test_config();
        cfg.is_send_raw_transaction_conditional = true;
        let mut manager = BundleManager::new(Arc::clone(&rpc), cfg).unwrap();

        manager.send_bundle(vec![test_op()]).await.unwrap().unwrap();

        assert!(rpc.calls_for("eth_sendRawTransaction").is_empty());
        assert_eq!(rpc.calls_for("eth_sendRawTransactionConditional").len(), 1);
    }

    #[tokio::test]
    async fn send_next_bundle_is_a_noop_on_an_empty_pool() {
        let rpc = Arc::new(MockRpc::new());
        let mut manager = BundleManager::new(Arc::clone(&rpc), test_config()).unwrap();

        assert!(manager.send_next_bundle().await.unwrap().is_none());
        assert!(rpc.recorded_calls().is_empty());
    }

    #[tokio::test]
    async fn send_next_bundle_drains_the_mempool() {
        let rpc = Arc::new(MockRpc::new());
        push_fanout_replies(&rpc, false);
        rpc.push_result("eth_sendRawTransaction", json!(tx_hash_hex()));

        let mut manager = BundleManager::new(Arc::clone(&rpc), test_config()).unwrap();
        let op = test_op();
        manager.add_user_operation(op.clone(), false);
        assert_eq!(manager.reputation().ops_seen(op.sender), 1);

        let tx_hash = manager.send_next_bundle().await.unwrap();
        assert!(tx_hash.is_some());
        assert!(manager.mempool().is_empty());
        assert_eq!(manager.reputation().ops_included(op.sender), 1);
    }
}
