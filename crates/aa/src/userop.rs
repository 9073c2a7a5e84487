use alloy::primitives::{Address, B256, Bytes, U256};
use alloy::sol_types::SolCall;
use serde::{Deserialize, Serialize};

use crate::contracts::IEntryPoint;

/// An ERC-4337 UserOperation as accepted from the mempool, plus the metadata
/// the validator attaches once simulation has run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,

    /// Hash over the code of every contract touched during validation,
    /// recorded so a later re-validation can detect code changes.
    #[serde(skip)]
    pub code_hash: Option<B256>,
    /// Contracts whose code size was observed during the traced simulation.
    #[serde(skip)]
    pub associated_addresses: Vec<Address>,
}

impl UserOperation {
    /// First 20 bytes of `initCode` when the op deploys its account.
    pub fn factory_address(&self) -> Option<Address> {
        leading_address(&self.init_code)
    }

    /// First 20 bytes of `paymasterAndData` when a paymaster sponsors the op.
    pub fn paymaster_address(&self) -> Option<Address> {
        leading_address(&self.paymaster_and_data)
    }

    pub fn to_wire(&self) -> IEntryPoint::UserOperation {
        IEntryPoint::UserOperation {
            sender: self.sender,
            nonce: self.nonce,
            initCode: self.init_code.clone(),
            callData: self.call_data.clone(),
            callGasLimit: self.call_gas_limit,
            verificationGasLimit: self.verification_gas_limit,
            preVerificationGas: self.pre_verification_gas,
            maxFeePerGas: self.max_fee_per_gas,
            maxPriorityFeePerGas: self.max_priority_fee_per_gas,
            paymasterAndData: self.paymaster_and_data.clone(),
            signature: self.signature.clone(),
        }
    }

    pub fn from_wire(op: IEntryPoint::UserOperation) -> Self {
        Self {
            sender: op.sender,
            nonce: op.nonce,
            init_code: op.initCode,
            call_data: op.callData,
            call_gas_limit: op.callGasLimit,
            verification_gas_limit: op.verificationGasLimit,
            pre_verification_gas: op.preVerificationGas,
            max_fee_per_gas: op.maxFeePerGas,
            max_priority_fee_per_gas: op.maxPriorityFeePerGas,
            paymaster_and_data: op.paymasterAndData,
            signature: op.signature,
            code_hash: None,
            associated_addresses: Vec::new(),
        }
    }
}

fn leading_address(data: &Bytes) -> Option<Address> {
    if data.len() < Address::len_bytes() {
        return None;
    }
    Some(Address::from_slice(&data[..Address::len_bytes()]))
}

/// `handleOps(ops, beneficiary)` calldata, selector included.
pub fn encode_handle_ops(ops: &[UserOperation], beneficiary: Address) -> Vec<u8> {
    IEntryPoint::handleOpsCall {
        ops: ops.iter().map(UserOperation::to_wire).collect(),
        beneficiary,
    }
    .abi_encode()
}

/// `simulateValidation(op)` calldata, selector included.
pub fn encode_simulate_validation(op: &UserOperation) -> Vec<u8> {
    IEntryPoint::simulateValidationCall { userOp: op.to_wire() }.abi_encode()
}
