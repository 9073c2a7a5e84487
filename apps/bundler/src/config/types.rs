use alloy::primitives::{Address, Bytes};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BundlerConfig {
    pub ethereum_node_url: String,
    pub bundler_private_key: [u8; 32],
    pub bundler_address: Address,
    pub entrypoint: Address,
    pub chain_id: u64,

    /// Legacy gas pricing instead of EIP-1559.
    pub is_legacy_mode: bool,
    /// Submit via eth_sendRawTransactionConditional.
    pub is_send_raw_transaction_conditional: bool,
    /// Validate with a plain eth_call instead of the traced simulation. The
    /// opcode and storage rules cannot run in this mode.
    pub is_unsafe: bool,

    pub whitelist_entity_storage_access: Vec<Address>,
    /// BundlerHelper runtime bytecode, called to snapshot code hashes.
    pub bundler_helper_byte_code: Bytes,

    pub bundle_interval: Duration,
    pub max_bundle_size: usize,
    pub rpc_timeout: Duration,
}
