use aa::UserOperation;
use alloy::primitives::{Address, Bytes, U256};
use anyhow::Result;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::BundlerConfig;
use crate::rpc::{EthRpc, RpcReply};

/// Well-known dev key (anvil account 0) and the v0.6 EntryPoint address.
pub const TEST_PRIVATE_KEY: &str =
    "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
pub const TEST_BUNDLER_ADDRESS: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";
pub const TEST_ENTRYPOINT: &str = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789";

/// Canned-reply RPC: each method has a queue of replies consumed in order,
/// and every request is recorded for assertions.
#[derive(Default)]
pub struct MockRpc {
    replies: Mutex<HashMap<String, VecDeque<RpcReply>>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockRpc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, method: &str, reply: RpcReply) {
        self.replies
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn push_result(&self, method: &str, result: Value) {
        self.push_reply(method, RpcReply::from_result(result));
    }

    pub fn push_error(&self, method: &str, code: i64, message: &str, data: Option<Value>) {
        self.push_reply(method, RpcReply::from_error(code, message, data));
    }

    pub fn recorded_calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, method: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params.clone())
            .collect()
    }
}

impl EthRpc for MockRpc {
    async fn request(&self, method: &str, params: Value) -> Result<RpcReply> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), params));
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get_mut(method)
            .and_then(VecDeque::pop_front);
        reply.ok_or_else(|| anyhow::anyhow!("no canned reply for {method}"))
    }
}

pub fn test_config() -> BundlerConfig {
    BundlerConfig {
        ethereum_node_url: "http://localhost:8545".to_string(),
        bundler_private_key: {
            let mut key = [0u8; 32];
            key.copy_from_slice(&hex::decode(TEST_PRIVATE_KEY).unwrap());
            key
        },
        bundler_address: TEST_BUNDLER_ADDRESS.parse().unwrap(),
        entrypoint: TEST_ENTRYPOINT.parse().unwrap(),
        chain_id: 31337,
        is_legacy_mode: false,
        is_send_raw_transaction_conditional: false,
        is_unsafe: false,
        whitelist_entity_storage_access: Vec::new(),
        bundler_helper_byte_code: Bytes::from(vec![0x60, 0x80, 0x60, 0x40]),
        bundle_interval: Duration::from_secs(1),
        max_bundle_size: 10,
        rpc_timeout: Duration::from_secs(5),
    }
}

pub fn test_op() -> UserOperation {
    UserOperation {
        sender: "0xb856dbd4fa1a79a46d426f537455e7d3e79ab7c4".parse().unwrap(),
        nonce: U256::ZERO,
        init_code: Bytes::new(),
        call_data: Bytes::from(vec![0xb6, 0x1d, 0x27, 0xf6]),
        call_gas_limit: U256::from(100_000u64),
        verification_gas_limit: U256::from(200_000u64),
        pre_verification_gas: U256::from(100_000u64),
        max_fee_per_gas: U256::from(2_000_000_000u64),
        max_priority_fee_per_gas: U256::from(1_000_000_000u64),
        paymaster_and_data: Bytes::new(),
        signature: Bytes::from(vec![0x98u8; 65]),
        code_hash: None,
        associated_addresses: Vec::new(),
    }
}
