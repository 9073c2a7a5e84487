use super::env::Env;
use super::parse::{parse_address, parse_addresses_csv, parse_hex_32, parse_hex_blob};
use super::types::BundlerConfig;
use alloy::signers::local::PrivateKeySigner;
use anyhow::{Context, Result};
use k256::ecdsa::SigningKey;
use std::time::Duration;

pub fn load_config() -> Result<BundlerConfig> {
    let env: Env = envy::from_env().context("load bundler env config")?;

    if env.bundler_eth_node_url.trim().is_empty() {
        anyhow::bail!("BUNDLER_ETH_NODE_URL must be set");
    }
    if env.bundler_private_key_hex.trim().is_empty() {
        anyhow::bail!("BUNDLER_PRIVATE_KEY_HEX must be set");
    }

    let bundler_private_key =
        parse_hex_32("BUNDLER_PRIVATE_KEY_HEX", &env.bundler_private_key_hex)?;
    SigningKey::from_slice(&bundler_private_key).context("invalid bundler private key")?;

    let bundler_address = parse_address("BUNDLER_ADDRESS", &env.bundler_address)?;
    let derived = PrivateKeySigner::from_slice(&bundler_private_key)
        .context("derive bundler signer")?
        .address();
    if derived != bundler_address {
        anyhow::bail!(
            "BUNDLER_ADDRESS {bundler_address} does not match the private key's address {derived}"
        );
    }

    let entrypoint = parse_address(
        "BUNDLER_ENTRYPOINT_ADDRESS",
        &env.bundler_entrypoint_address,
    )?;
    if entrypoint.is_zero() {
        anyhow::bail!("BUNDLER_ENTRYPOINT_ADDRESS must not be the zero address");
    }

    let whitelist_entity_storage_access = parse_addresses_csv(
        "BUNDLER_STORAGE_WHITELIST",
        &env.bundler_storage_whitelist,
    )?;

    let bundler_helper_byte_code = parse_hex_blob(
        "BUNDLER_HELPER_BYTECODE_HEX",
        &env.bundler_helper_bytecode_hex,
    )?;
    if !env.bundler_unsafe_mode && bundler_helper_byte_code.is_empty() {
        anyhow::bail!("BUNDLER_HELPER_BYTECODE_HEX must be set unless BUNDLER_UNSAFE_MODE=true");
    }

    Ok(BundlerConfig {
        ethereum_node_url: env.bundler_eth_node_url,
        bundler_private_key,
        bundler_address,
        entrypoint,
        chain_id: env.bundler_chain_id,
        is_legacy_mode: env.bundler_legacy_mode,
        is_send_raw_transaction_conditional: env.bundler_send_raw_conditional,
        is_unsafe: env.bundler_unsafe_mode,
        whitelist_entity_storage_access,
        bundler_helper_byte_code,
        bundle_interval: Duration::from_secs(env.bundler_bundle_interval_secs.max(1)),
        max_bundle_size: env.bundler_max_bundle_size.max(1),
        rpc_timeout: Duration::from_secs(env.bundler_rpc_timeout_secs.max(1)),
    })
}
