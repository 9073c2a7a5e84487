use alloy::primitives::{Address, Bytes};
use anyhow::{Context, Result};

pub(super) fn parse_address(label: &str, s: &str) -> Result<Address> {
    s.parse::<Address>()
        .with_context(|| format!("invalid {label}: {s}"))
}

pub(super) fn parse_hex_32(label: &str, s: &str) -> Result<[u8; 32]> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s).with_context(|| format!("invalid hex for {label}"))?;
    if bytes.len() != 32 {
        anyhow::bail!("{label} must be 32 bytes (got {})", bytes.len());
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

pub(super) fn parse_addresses_csv(label: &str, s: &str) -> Result<Vec<Address>> {
    let mut out = Vec::new();
    for raw in s.split(',') {
        let v = raw.trim();
        if v.is_empty() {
            continue;
        }
        out.push(parse_address(label, v)?);
    }
    Ok(out)
}

pub(super) fn parse_hex_blob(label: &str, s: &str) -> Result<Bytes> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Ok(Bytes::new());
    }
    let hex_str = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = hex::decode(hex_str).with_context(|| format!("invalid hex for {label}"))?;
    Ok(Bytes::from(bytes))
}
