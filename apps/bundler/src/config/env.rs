use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub(super) struct Env {
    pub bundler_eth_node_url: String,

    pub bundler_private_key_hex: String,

    /// Must match the address derived from the private key.
    pub bundler_address: String,

    pub bundler_entrypoint_address: String,

    pub bundler_chain_id: u64,

    #[serde(default)]
    pub bundler_legacy_mode: bool,

    #[serde(default)]
    pub bundler_send_raw_conditional: bool,

    /// Skip debug_traceCall and validate with a plain eth_call.
    #[serde(default)]
    pub bundler_unsafe_mode: bool,

    /// Entities exempt from the storage access rules.
    #[serde(default)]
    pub bundler_storage_whitelist: String,

    /// Runtime bytecode of the BundlerHelper contract, hex without 0x.
    #[serde(default)]
    pub bundler_helper_bytecode_hex: String,

    #[serde(default = "default_bundle_interval_secs")]
    pub bundler_bundle_interval_secs: u64,

    #[serde(default = "default_max_bundle_size")]
    pub bundler_max_bundle_size: usize,

    #[serde(default = "default_rpc_timeout_secs")]
    pub bundler_rpc_timeout_secs: u64,
}

fn default_bundle_interval_secs() -> u64 {
    5
}

fn default_max_bundle_size() -> usize {
    10
}

fn default_rpc_timeout_secs() -> u64 {
    30
}
