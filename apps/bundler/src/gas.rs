use aa::UserOperation;
use alloy::primitives::{Address, Bytes, U256};
use alloy::sol_types::SolValue;
use anyhow::{Context, Result};
use serde_json::json;

use crate::rpc::EthRpc;

/// Calldata pricing for the pre-verification gas floor. The values mirror
/// the EntryPoint reference bundler overheads.
#[derive(Debug, Clone, Copy)]
pub struct GasOverheads {
    pub fixed: u64,
    pub per_user_op: u64,
    pub per_user_op_word: u64,
    pub zero_byte: u64,
    pub non_zero_byte: u64,
    pub bundle_size: u64,
    pub sig_size: usize,
}

impl Default for GasOverheads {
    fn default() -> Self {
        Self {
            fixed: 21_000,
            per_user_op: 18_300,
            per_user_op_word: 4,
            zero_byte: 4,
            non_zero_byte: 16,
            bundle_size: 1,
            sig_size: 65,
        }
    }
}

/// Minimum `preVerificationGas` for an op: its share of the bundle's intrinsic
/// cost plus the calldata cost of the packed op with a worst-case signature.
pub fn calc_preverification_gas(op: &UserOperation) -> U256 {
    let ov = GasOverheads::default();

    let mut packed_op = op.clone();
    packed_op.signature = Bytes::from(vec![0xffu8; ov.sig_size]);
    let packed = packed_op.to_wire().abi_encode();

    let call_data_cost: u64 = packed
        .iter()
        .map(|byte| {
            if *byte == 0 {
                ov.zero_byte
            } else {
                ov.non_zero_byte
            }
        })
        .sum();
    let words = (packed.len() as u64).div_ceil(32);

    U256::from(call_data_cost + ov.fixed / ov.bundle_size + ov.per_user_op + ov.per_user_op_word * words)
}

/// `eth_estimateGas` for a call from the bundler, returned as the node's hex
/// quantity.
pub async fn estimate_call_gas_limit<R: EthRpc>(
    rpc: &R,
    data: &str,
    from: Address,
    to: Address,
) -> Result<String> {
    let reply = rpc
        .request(
            "eth_estimateGas",
            json!([{ "from": from, "to": to, "data": data }]),
        )
        .await?;
    let result = reply.into_result("eth_estimateGas")?;
    result
        .as_str()
        .map(str::to_string)
        .context("eth_estimateGas returned a non-string quantity")
}
