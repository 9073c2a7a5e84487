use aa::contracts::{IEntryPoint, VALIDATE_PAYMASTER_USER_OP_SELECTOR};
use aa::tracer::{self, SlotAccess, TraceData, TracerOutput};
use aa::{EntityKind, ReturnInfo, StakeInfo, UserOperation, encode_simulate_validation};
use alloy::primitives::{Address, B256, U256};
use alloy::sol_types::{SolError, SolValue};
use anyhow::{Context, anyhow};
use futures::future::OptionFuture;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::BundlerConfig;
use crate::error::ValidationError;
use crate::gas::calc_preverification_gas;
use crate::rpc::{EthRpc, parse_quantity_u128};

/// The JS tracer shipped with the binary. Its output schema is what
/// `aa::tracer` parses; `ValidationManager::new` refuses to start when the
/// two drift apart.
pub const BUNDLER_COLLECTOR_TRACER: &str = include_str!("../resources/BundlerCollectorTracer.js");

/// Opcodes forbidden during validation: anything that reads block context or
/// mutable chain state and would make the simulated outcome non-reproducible
/// at inclusion time.
const BANNED_OPCODES: [&str; 16] = [
    "GAS",
    "NUMBER",
    "TIMESTAMP",
    "COINBASE",
    "DIFFICULTY",
    "BASEFEE",
    "GASLIMIT",
    "GASPRICE",
    "SELFBALANCE",
    "BALANCE",
    "ORIGIN",
    "BLOCKHASH",
    "CREATE",
    "SELFDESTRUCT",
    "RANDOM",
    "PREVRANDAO",
];

/// Ops must already be valid and keep being valid for this long.
const VALIDITY_WINDOW_SECS: u64 = 30;

/// `validatePaymasterUserOp` return data longer than this (hex chars) means
/// the paymaster returned a non-empty context.
const EMPTY_PAYMASTER_CONTEXT_HEX_LEN: usize = 194;

pub struct ValidationManager<R> {
    rpc: Arc<R>,
    cfg: BundlerConfig,
}

struct DecodedValidation {
    return_info: ReturnInfo,
    sender_info: StakeInfo,
    factory_info: StakeInfo,
    paymaster_info: StakeInfo,
}

impl<R: EthRpc> ValidationManager<R> {
    pub fn new(rpc: Arc<R>, cfg: BundlerConfig) -> anyhow::Result<Self> {
        assert_tracer_schema(BUNDLER_COLLECTOR_TRACER)?;
        Ok(Self { rpc, cfg })
    }

    pub fn is_unsafe(&self) -> bool {
        self.cfg.is_unsafe
    }

    /// Runs the full validation pipeline and returns whether the sender is
    /// staked. The op is augmented with the code hash and associated
    /// addresses observed during the traced simulation.
    pub async fn validate_user_operation(
        &self,
        op: &mut UserOperation,
    ) -> Result<bool, ValidationError> {
        self.verify_preverification_gas(op)?;
        let gas_price_hex = self.verify_gas_fees(op).await?;

        let (selector, body, trace) = if self.cfg.is_unsafe {
            let (selector, body) = self.simulate_without_tracing(op).await?;
            (selector, body, None)
        } else {
            let output = self.simulate_with_tracing(op, &gas_price_hex).await?;
            let trace = TraceData::from_output(output).map_err(ValidationError::Internal)?;
            let (selector, body) = {
                let revert = trace.top_level_revert().map_err(ValidationError::Internal)?;
                split_revert_payload(revert)?
            };
            (selector, body, Some(trace))
        };

        if selector == IEntryPoint::FailedOp::SELECTOR {
            let failed = IEntryPoint::FailedOp::abi_decode_raw(&body)
                .context("decode FailedOp revert")
                .map_err(ValidationError::Internal)?;
            return Err(ValidationError::SimulateValidation(format!(
                "revert reason: {}",
                failed.reason
            )));
        }

        let decoded = decode_validation_result(&body)?;
        self.check_return_info(op, &decoded.return_info)?;

        if let Some(trace) = trace {
            self.validate_trace_results(op, &decoded, &trace).await?;
        }

        Ok(decoded.sender_info.is_staked())
    }

    fn verify_preverification_gas(&self, op: &UserOperation) -> Result<(), ValidationError> {
        let minimum = calc_preverification_gas(op);
        if op.pre_verification_gas < minimum {
            return Err(ValidationError::SimulateValidation(format!(
                "preVerificationGas is too low, minimum: {minimum}"
            )));
        }
        Ok(())
    }

    /// Checks the op's fees against the node's current suggestions and
    /// returns the base+tip gas price (hex) for the traced simulation.
    async fn verify_gas_fees(&self, op: &UserOperation) -> Result<String, ValidationError> {
        let base_plus_tip_fut = self.rpc.request("eth_gasPrice", json!([]));
        let tip_fut: OptionFuture<_> = (!self.cfg.is_legacy_mode)
            .then(|| self.rpc.request("eth_maxPriorityFeePerGas", json!([])))
            .into();
        let (base_plus_tip_reply, tip_reply) = tokio::join!(base_plus_tip_fut, tip_fut);

        let base_plus_tip_value = base_plus_tip_reply
            .and_then(|reply| reply.into_result("eth_gasPrice"))
            .map_err(ValidationError::Internal)?;
        let base_plus_tip_hex = base_plus_tip_value
            .as_str()
            .context("eth_gasPrice returned a non-string quantity")
            .map_err(ValidationError::Internal)?
            .to_string();
        let base_plus_tip = parse_quantity_u128(&base_plus_tip_value)
            .map_err(ValidationError::Internal)?;

        let tip = match tip_reply {
            Some(reply) => {
                let value = reply
                    .and_then(|reply| reply.into_result("eth_maxPriorityFeePerGas"))
                    .map_err(ValidationError::Internal)?;
                parse_quantity_u128(&value).map_err(ValidationError::Internal)?
            }
            None => base_plus_tip,
        };

        if op.max_fee_per_gas < U256::from(base_plus_tip) {
            return Err(ValidationError::SimulateValidation(format!(
                "maxFeePerGas is too low, minimum: {base_plus_tip}"
            )));
        }
        if op.max_priority_fee_per_gas < U256::from(tip) {
            return Err(ValidationError::SimulateValidation(format!(
                "maxPriorityFeePerGas is too low, minimum: {tip}"
            )));
        }

        Ok(base_plus_tip_hex)
    }

    /// Plain `eth_call` simulation. `simulateValidation` reverts by design,
    /// so a successful call means the EntryPoint (or the node) is broken.
    async fn simulate_without_tracing(
        &self,
        op: &UserOperation,
    ) -> Result<([u8; 4], Vec<u8>), ValidationError> {
        let call_data = hex_bytes0x(&encode_simulate_validation(op));
        let params = json!([
            {
                "from": self.cfg.bundler_address,
                "to": self.cfg.entrypoint,
                "data": call_data,
            },
            "latest",
        ]);

        let reply = self
            .rpc
            .request("eth_call", params)
            .await
            .map_err(ValidationError::Internal)?;

        let Some(error) = reply.error else {
            return Err(ValidationError::Internal(anyhow!(
                "simulateValidation didn't revert!"
            )));
        };
        if !error.message.contains("execution reverted") {
            return Err(ValidationError::Internal(anyhow!(
                "simulateValidation didn't revert: {}",
                error.message
            )));
        }
        let Some(data) = error.data_hex() else {
            return Err(ValidationError::SimulateValidation(error.message.clone()));
        };
        if data.len() < 10 {
            return Err(ValidationError::SimulateValidation(error.message.clone()));
        }
        split_revert_payload(data)
    }

    async fn simulate_with_tracing(
        &self,
        op: &UserOperation,
        gas_price_hex: &str,
    ) -> Result<TracerOutput, ValidationError> {
        let call_data = hex_bytes0x(&encode_simulate_validation(op));
        let params = json!([
            {
                "from": self.cfg.bundler_address,
                "to": self.cfg.entrypoint,
                "data": call_data,
                "gasLimit": 0,
                "gasPrice": gas_price_hex,
            },
            "latest",
            { "tracer": BUNDLER_COLLECTOR_TRACER },
        ]);

        let reply = self
            .rpc
            .request("debug_traceCall", params)
            .await
            .map_err(ValidationError::Internal)?;

        if let Some(error) = reply.error {
            return Err(ValidationError::SimulateValidation(format!(
                "{} - try reducing maxFeePerGas or funding the bundler account",
                error.message
            )));
        }
        let result = reply
            .result
            .context("debug_traceCall missing result")
            .map_err(ValidationError::Internal)?;
        serde_json::from_value(result)
            .context("parse tracer output")
            .map_err(ValidationError::Internal)
    }

    fn check_return_info(
        &self,
        op: &UserOperation,
        info: &ReturnInfo,
    ) -> Result<(), ValidationError> {
        if info.sig_failed {
            return Err(ValidationError::InvalidSignature(
                "invalid UserOp signature or paymaster signature".to_string(),
            ));
        }

        if op.verification_gas_limit + op.pre_verification_gas < info.pre_op_gas {
            return Err(ValidationError::SimulateValidation(format!(
                "verification gas + preVerificationGas is too low, minimum: {}",
                info.pre_op_gas
            )));
        }

        let now = unix_now();
        if info.valid_after > now.saturating_sub(VALIDITY_WINDOW_SECS) {
            return Err(ValidationError::InvalidFields(
                "operation is not valid yet".to_string(),
            ));
        }
        if info.valid_until < now + VALIDITY_WINDOW_SECS {
            return Err(ValidationError::ExpiresShortly(
                "operation will expire shortly or has expired".to_string(),
            ));
        }

        Ok(())
    }

    /// Opcode, storage-access and paymaster-context rules over the traced
    /// simulation, then the code hash snapshot of every touched contract.
    async fn validate_trace_results(
        &self,
        op: &mut UserOperation,
        decoded: &DecodedValidation,
        trace: &TraceData,
    ) -> Result<(), ValidationError> {
        for kind in EntityKind::WIRE_ORDER {
            verify_banned_opcodes(&trace.entity(kind).opcodes, kind)?;
        }

        let sender = op.sender;
        let factory_address = op.factory_address();
        let paymaster_address = op.paymaster_address();
        let is_init_code = !op.init_code.is_empty();

        let mut entities = Vec::new();
        if let Some(factory) = factory_address {
            entities.push(factory);
        }
        entities.push(sender);
        if let Some(paymaster) = paymaster_address {
            entities.push(paymaster);
        }
        let associated_slots = tracer::parse_entity_slots(&entities, &trace.keccak);

        self.validate_entity_storage_access(
            sender,
            "sender",
            &associated_slots,
            &decoded.sender_info,
            sender,
            &trace.entity(EntityKind::Account).access,
            is_init_code,
        )?;

        if let Some(factory) = factory_address {
            self.validate_entity_storage_access(
                factory,
                "factory",
                &associated_slots,
                &decoded.factory_info,
                sender,
                &trace.entity(EntityKind::Factory).access,
                is_init_code,
            )?;
        }

        if let Some(paymaster) = paymaster_address {
            self.validate_entity_storage_access(
                paymaster,
                "paymaster",
                &associated_slots,
                &decoded.paymaster_info,
                sender,
                &trace.entity(EntityKind::Paymaster).access,
                is_init_code,
            )?;

            let paymaster_call = trace.find_call_to(paymaster, VALIDATE_PAYMASTER_USER_OP_SELECTOR);
            if let Some(call) = paymaster_call
                && call.data.len() > EMPTY_PAYMASTER_CONTEXT_HEX_LEN
                && !decoded.paymaster_info.is_staked()
            {
                return Err(ValidationError::OpcodeValidation(
                    "unstaked paymaster must not return context".to_string(),
                ));
            }
        }

        let accessed = trace.accessed_contracts();
        if !accessed.is_empty() {
            op.code_hash = Some(self.get_addresses_code_hash(&accessed).await?);
            op.associated_addresses = accessed;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn validate_entity_storage_access(
        &self,
        entity: Address,
        title: &str,
        associated_slots: &HashMap<Address, Vec<B256>>,
        stake_info: &StakeInfo,
        sender: Address,
        access: &BTreeMap<Address, SlotAccess>,
        is_init_code: bool,
    ) -> Result<(), ValidationError> {
        if self.cfg.whitelist_entity_storage_access.contains(&entity) {
            return Ok(());
        }

        let is_staked = stake_info.is_staked();

        for (contract, slot_access) in access {
            if *contract == sender || *contract == self.cfg.entrypoint {
                continue;
            }

            for slot in slot_access.all_slots() {
                let sender_associated = associated_slots
                    .get(&sender)
                    .is_some_and(|slots| tracer::is_slot_associated(*slot, sender, slots));
                let entity_associated = associated_slots
                    .get(&entity)
                    .is_some_and(|slots| tracer::is_slot_associated(*slot, entity, slots));

                let requires_stake = if sender_associated {
                    is_init_code
                } else if entity_associated || *contract == entity {
                    true
                } else {
                    return Err(ValidationError::OpcodeValidation(format!(
                        "{title} {entity} banned access to slot {slot:#x} at contract {contract}"
                    )));
                };

                if requires_stake && !is_staked {
                    return Err(ValidationError::OpcodeValidation(format!(
                        "{title} {entity} insufficient stake to access slot {slot:#x} at contract {contract}"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Calls the BundlerHelper bytecode, which reverts with a content hash
    /// over the given addresses' code.
    async fn get_addresses_code_hash(
        &self,
        addresses: &[Address],
    ) -> Result<B256, ValidationError> {
        let encoded_addresses = addresses.to_vec().abi_encode();
        let data = format!(
            "0x{}{}",
            hex::encode(&self.cfg.bundler_helper_byte_code),
            hex::encode(encoded_addresses),
        );
        let params = json!([{ "from": self.cfg.bundler_address, "data": data }, "latest"]);

        let reply = self
            .rpc
            .request("eth_call", params)
            .await
            .map_err(ValidationError::Internal)?;

        let Some(error) = reply.error else {
            return Err(ValidationError::Internal(anyhow!(
                "BundlerHelper should revert"
            )));
        };
        let data = error
            .data_hex()
            .context("BundlerHelper revert carried no data")
            .map_err(ValidationError::Internal)?;
        let bytes = hex::decode(data.strip_prefix("0x").unwrap_or(data))
            .context("BundlerHelper revert data hex")
            .map_err(ValidationError::Internal)?;
        if bytes.len() < 32 {
            return Err(ValidationError::Internal(anyhow!(
                "BundlerHelper revert data too short: {} bytes",
                bytes.len()
            )));
        }
        Ok(B256::from_slice(&bytes[bytes.len() - 32..]))
    }
}

fn verify_banned_opcodes(
    opcodes: &BTreeMap<String, u64>,
    kind: EntityKind,
) -> Result<(), ValidationError> {
    let found: Vec<&str> = opcodes
        .keys()
        .filter(|opcode| BANNED_OPCODES.contains(&opcode.as_str()))
        .map(String::as_str)
        .collect();
    if !found.is_empty() {
        return Err(ValidationError::OpcodeValidation(format!(
            "{} uses banned opcode: {}",
            kind.as_str(),
            found.join(" ")
        )));
    }

    // The factory gets exactly one CREATE2 for the account deployment.
    if let Some(count) = opcodes.get("CREATE2")
        && (*count > 1 || (*count == 1 && kind != EntityKind::Factory))
    {
        return Err(ValidationError::OpcodeValidation(format!(
            "{} uses banned opcode: CREATE2",
            kind.as_str()
        )));
    }

    Ok(())
}

fn decode_validation_result(body: &[u8]) -> Result<DecodedValidation, ValidationError> {
    match IEntryPoint::ValidationResult::abi_decode_raw(body) {
        Ok(result) => Ok(DecodedValidation {
            return_info: result.returnInfo.into(),
            sender_info: result.senderInfo.into(),
            factory_info: result.factoryInfo.into(),
            paymaster_info: result.paymasterInfo.into(),
        }),
        Err(_) => {
            let failed = IEntryPoint::FailedOp::abi_decode_raw(body).map_err(|_| {
                ValidationError::SimulateValidation(
                    "unrecognized simulateValidation revert".to_string(),
                )
            })?;
            Err(ValidationError::SimulateValidation(failed.reason))
        }
    }
}

fn split_revert_payload(data: &str) -> Result<([u8; 4], Vec<u8>), ValidationError> {
    let bytes = hex::decode(data.strip_prefix("0x").unwrap_or(data)).map_err(|_| {
        ValidationError::SimulateValidation(format!("malformed revert payload: {data}"))
    })?;
    if bytes.len() < 4 {
        return Err(ValidationError::SimulateValidation(format!(
            "revert payload too short: {data}"
        )));
    }
    let mut selector = [0u8; 4];
    selector.copy_from_slice(&bytes[..4]);
    Ok((selector, bytes[4..].to_vec()))
}

fn assert_tracer_schema(source: &str) -> anyhow::Result<()> {
    for field in ["numberLevels", "keccak", "calls", "logs", "debug"] {
        if !source.contains(field) {
            anyhow::bail!("bundler collector tracer does not emit `{field}`");
        }
    }
    Ok(())
}

fn hex_bytes0x(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
