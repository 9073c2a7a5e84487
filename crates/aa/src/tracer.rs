//! Parsing of the BundlerCollectorTracer output.
//!
//! The tracer (a JS program executed by the node's `debug_traceCall`) reports
//! one level per validation role plus the keccak preimages, the raw call
//! events and a debug step log. Everything address-shaped arrives as
//! lower-case hex; it is parsed into typed values here, at the boundary.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use alloy::primitives::{Address, B256, Bytes, U256, keccak256};
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::Value;

use crate::entity::EntityKind;

/// Raw tracer result, exactly as the node returns it.
#[derive(Debug, Clone, Deserialize)]
pub struct TracerOutput {
    #[serde(rename = "numberLevels")]
    pub number_levels: Vec<RawLevel>,
    #[serde(default)]
    pub keccak: Vec<String>,
    #[serde(default)]
    pub calls: Vec<RawCallEvent>,
    #[serde(default)]
    pub logs: Vec<Value>,
    #[serde(default)]
    pub debug: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawLevel {
    #[serde(default)]
    pub access: HashMap<String, RawSlotAccess>,
    #[serde(default)]
    pub opcodes: BTreeMap<String, u64>,
    #[serde(rename = "contractSize", default)]
    pub contract_size: HashMap<String, u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSlotAccess {
    #[serde(default)]
    pub reads: HashMap<String, Value>,
    #[serde(default)]
    pub writes: HashMap<String, Value>,
}

/// One entry of the tracer's `calls` array: either a frame being entered
/// (CALL/DELEGATECALL/STATICCALL/CREATE/CREATE2) or a frame ending
/// (RETURN/REVERT).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCallEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub gas: Option<u64>,
    #[serde(rename = "gasUsed", default)]
    pub gas_used: Option<u64>,
    #[serde(default)]
    pub data: Option<String>,
}

/// Storage touched by one validation level, keyed by contract.
#[derive(Debug, Clone, Default)]
pub struct SlotAccess {
    pub reads: BTreeSet<U256>,
    pub writes: BTreeSet<U256>,
}

impl SlotAccess {
    pub fn all_slots(&self) -> impl Iterator<Item = &U256> {
        self.reads.union(&self.writes)
    }
}

/// What one entity did during its validation level.
#[derive(Debug, Clone, Default)]
pub struct EntityData {
    pub access: BTreeMap<Address, SlotAccess>,
    pub opcodes: BTreeMap<String, u64>,
    pub contract_size: BTreeMap<Address, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallReturnType {
    Return,
    Revert,
}

/// A resolved stack frame from the flattened call list.
#[derive(Debug, Clone)]
pub struct Call {
    pub kind: String,
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub method: Option<String>,
    pub value: Option<String>,
    pub gas: Option<u64>,
    pub gas_used: Option<u64>,
    /// Return data as the tracer's hex string; length checks against it are
    /// in hex characters.
    pub data: String,
    pub return_type: CallReturnType,
}

/// Typed view over one traced `simulateValidation` run.
#[derive(Debug, Clone)]
pub struct TraceData {
    entity_data: [EntityData; 3],
    pub keccak: Vec<Bytes>,
    pub calls: Vec<Call>,
    pub logs: Vec<Value>,
    pub debug: Vec<Value>,
}

impl TraceData {
    pub fn from_output(out: TracerOutput) -> Result<Self> {
        if out.number_levels.len() != 3 {
            bail!(
                "tracer reported {} levels, expected factory/account/paymaster",
                out.number_levels.len()
            );
        }

        let mut levels = out.number_levels.into_iter();
        let entity_data = [
            parse_level(levels.next().unwrap())?,
            parse_level(levels.next().unwrap())?,
            parse_level(levels.next().unwrap())?,
        ];

        let keccak = out
            .keccak
            .iter()
            .map(|s| s.parse::<Bytes>().with_context(|| format!("keccak preimage {s}")))
            .collect::<Result<Vec<_>>>()?;

        let calls = flatten_calls(&out.calls);
        tracing::debug!(
            calls = calls.len(),
            keccak = keccak.len(),
            "parsed tracer output"
        );

        Ok(Self {
            entity_data,
            keccak,
            calls,
            logs: out.logs,
            debug: out.debug,
        })
    }

    pub fn entity(&self, kind: EntityKind) -> &EntityData {
        &self.entity_data[kind.wire_index()]
    }

    /// The top-level `simulateValidation` REVERT payload, carried by the
    /// penultimate debug entry. Its absence means the call did not revert,
    /// which breaks the simulation protocol.
    pub fn top_level_revert(&self) -> Result<&str> {
        let n = self.debug.len();
        if n < 2 {
            bail!("tracer debug log has {n} entries, missing the top-level revert");
        }
        self.debug[n - 2]
            .get("REVERT")
            .and_then(Value::as_str)
            .context("simulateValidation didn't revert!")
    }

    /// Last resolved call to `to` with the given 4-byte selector.
    pub fn find_call_to(&self, to: Address, selector: &str) -> Option<&Call> {
        self.calls
            .iter()
            .filter(|call| call.to == Some(to) && call.method.as_deref() == Some(selector))
            .next_back()
    }

    /// Contracts whose code size was observed, account level first, then
    /// factory and paymaster, deduplicated in that order.
    pub fn accessed_contracts(&self) -> Vec<Address> {
        let mut out = Vec::new();
        for kind in [EntityKind::Account, EntityKind::Factory, EntityKind::Paymaster] {
            for address in self.entity(kind).contract_size.keys() {
                if !out.contains(address) {
                    out.push(*address);
                }
            }
        }
        out
    }
}

fn parse_level(raw: RawLevel) -> Result<EntityData> {
    let mut access = BTreeMap::new();
    for (contract, slots) in raw.access {
        let contract = parse_trace_address(&contract)?;
        let mut parsed = SlotAccess::default();
        for slot in slots.reads.keys() {
            parsed.reads.insert(parse_slot(slot)?);
        }
        for slot in slots.writes.keys() {
            parsed.writes.insert(parse_slot(slot)?);
        }
        access.insert(contract, parsed);
    }

    let mut contract_size = BTreeMap::new();
    for (contract, size) in raw.contract_size {
        contract_size.insert(parse_trace_address(&contract)?, size);
    }

    Ok(EntityData {
        access,
        opcodes: raw.opcodes,
        contract_size,
    })
}

fn parse_trace_address(s: &str) -> Result<Address> {
    s.parse::<Address>().with_context(|| format!("trace address {s}"))
}

fn parse_slot(s: &str) -> Result<U256> {
    let hex = s.strip_prefix("0x").unwrap_or(s);
    U256::from_str_radix(hex, 16).with_context(|| format!("storage slot {s}"))
}

/// Resolve the tracer's enter/exit event stream into completed frames.
/// Enter events push; RETURN/REVERT pops the matching frame and emits it. A
/// pop on an empty stack is the outermost `validateUserOp` frame, which the
/// tracer never saw entered.
fn flatten_calls(events: &[RawCallEvent]) -> Vec<Call> {
    let mut stack: Vec<&RawCallEvent> = Vec::new();
    let mut out = Vec::new();

    for event in events {
        if event.kind != "RETURN" && event.kind != "REVERT" {
            stack.push(event);
            continue;
        }

        let return_type = if event.kind == "REVERT" {
            CallReturnType::Revert
        } else {
            CallReturnType::Return
        };

        let (kind, from, to, method, value, gas) = match stack.pop() {
            Some(top) => (
                top.kind.clone(),
                top.from.as_deref().and_then(|s| s.parse().ok()),
                top.to.as_deref().and_then(|s| s.parse().ok()),
                top.method.clone(),
                top.value.clone(),
                top.gas,
            ),
            None => (
                "top".to_string(),
                None,
                None,
                Some("validateUserOp".to_string()),
                None,
                None,
            ),
        };

        let return_data = event.data.clone().unwrap_or_default();
        let data = if kind == "CREATE" {
            format!("len={}", return_data.len())
        } else {
            return_data
        };

        out.push(Call {
            kind,
            from,
            to,
            method,
            value,
            gas,
            gas_used: event.gas_used,
            data,
            return_type,
        });
    }

    out
}

/// Slots associated with each entity: the keccak of every traced preimage
/// that embeds the entity's 32-byte left-padded address.
pub fn parse_entity_slots(entities: &[Address], keccak: &[Bytes]) -> HashMap<Address, Vec<B256>> {
    let mut slots: HashMap<Address, Vec<B256>> =
        entities.iter().map(|entity| (*entity, Vec::new())).collect();

    for preimage in keccak {
        for entity in entities {
            let padded = left_padded(*entity);
            if !contains_subslice(preimage, &padded) {
                continue;
            }
            let hash = keccak256(preimage);
            if let Some(list) = slots.get_mut(entity)
                && !list.contains(&hash)
            {
                list.push(hash);
            }
        }
    }

    slots
}

/// A slot belongs to an entity when it is the entity's own padded address or
/// lies within a mapping-entry window of an associated keccak output.
pub fn is_slot_associated(slot: U256, entity: Address, associated: &[B256]) -> bool {
    const SLOT_WINDOW: u64 = 18;

    if slot == U256::from_be_bytes(left_padded(entity)) {
        return true;
    }

    associated.iter().any(|root| {
        let root = U256::from_be_bytes(root.0);
        root.checked_add(U256::from(SLOT_WINDOW))
            .is_some_and(|end| slot >= root && slot < end)
    })
}

fn left_padded(address: Address) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[12..].copy_from_slice(address.as_slice());
    out
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.len() >= needle.len()
        && haystack.windows(needle.len()).any(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENDER: &str = "0xb856dbd4fa1a79a46d426f537455e7d3e79ab7c4";
    const PAYMASTER: &str = "0x8abb13360b87be5eeb1b98647a016add927a136c";

    fn fixture() -> TracerOutput {
        let json = format!(
            r#"{{
                "numberLevels": [
                    {{"access": {{}}, "opcodes": {{}}, "contractSize": {{}}}},
                    {{
                        "access": {{
                            "{SENDER}": {{
                                "reads": {{"0x0": "0x1"}},
                                "writes": {{"0x1": "0x2"}}
                            }}
                        }},
                        "opcodes": {{"CALL": 2, "SLOAD": 3}},
                        "contractSize": {{"{SENDER}": 120}}
                    }},
                    {{
                        "access": {{}},
                        "opcodes": {{"TIMESTAMP": 1}},
                        "contractSize": {{"{PAYMASTER}": 64}}
                    }}
                ],
                "keccak": ["0x000000000000000000000000{sender_tail}0000000000000000000000000000000000000000000000000000000000000003"],
                "calls": [
                    {{"type": "CALL", "from": "{SENDER}", "to": "{PAYMASTER}", "method": "0xf465c77e", "gas": 50000, "value": "0x0"}},
                    {{"type": "RETURN", "gasUsed": 1200, "data": "0xaa"}},
                    {{"type": "REVERT", "gasUsed": 9, "data": "0xdead"}}
                ],
                "logs": [],
                "debug": ["step", {{"REVERT": "0xe0cff05f"}}, "fault depth 1"]
            }}"#,
            sender_tail = &SENDER[2..],
        );
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn levels_map_to_entity_kinds() {
        let trace = TraceData::from_output(fixture()).unwrap();

        assert!(trace.entity(EntityKind::Factory).opcodes.is_empty());
        assert_eq!(trace.entity(EntityKind::Account).opcodes.get("SLOAD"), Some(&3));
        assert_eq!(
            trace.entity(EntityKind::Paymaster).opcodes.get("TIMESTAMP"),
            Some(&1)
        );

        let sender: Address = SENDER.parse().unwrap();
        let access = &trace.entity(EntityKind::Account).access[&sender];
        assert!(access.reads.contains(&U256::ZERO));
        assert!(access.writes.contains(&U256::from(1u64)));
        assert_eq!(access.all_slots().count(), 2);
    }

    #[test]
    fn wrong_level_count_is_rejected() {
        let mut out = fixture();
        out.number_levels.pop();
        let err = TraceData::from_output(out).unwrap_err().to_string();
        assert!(err.contains("expected factory/account/paymaster"));
    }

    #[test]
    fn flattening_resolves_frames_and_synthesizes_top() {
        let trace = TraceData::from_output(fixture()).unwrap();
        assert_eq!(trace.calls.len(), 2);

        let paymaster_call = &trace.calls[0];
        assert_eq!(paymaster_call.kind, "CALL");
        assert_eq!(paymaster_call.to, Some(PAYMASTER.parse().unwrap()));
        assert_eq!(paymaster_call.method.as_deref(), Some("0xf465c77e"));
        assert_eq!(paymaster_call.return_type, CallReturnType::Return);
        assert_eq!(paymaster_call.data, "0xaa");
        assert_eq!(paymaster_call.gas_used, Some(1200));

        // The trailing REVERT has no matching enter event: it is the
        // outermost validateUserOp frame.
        let top = &trace.calls[1];
        assert_eq!(top.kind, "top");
        assert_eq!(top.method.as_deref(), Some("validateUserOp"));
        assert_eq!(top.return_type, CallReturnType::Revert);
    }

    #[test]
    fn create_frames_report_only_return_length() {
        let events = vec![
            RawCallEvent {
                kind: "CREATE".to_string(),
                from: Some(SENDER.to_string()),
                ..Default::default()
            },
            RawCallEvent {
                kind: "RETURN".to_string(),
                data: Some("0x0011".to_string()),
                ..Default::default()
            },
        ];
        let calls = flatten_calls(&events);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].data, "len=6");
    }

    #[test]
    fn top_level_revert_comes_from_penultimate_debug_entry() {
        let trace = TraceData::from_output(fixture()).unwrap();
        assert_eq!(trace.top_level_revert().unwrap(), "0xe0cff05f");

        let mut out = fixture();
        out.debug = vec!["step".into(), Value::from("no revert here"), "fault".into()];
        let trace = TraceData::from_output(out).unwrap();
        let err = trace.top_level_revert().unwrap_err().to_string();
        assert!(err.contains("didn't revert"));
    }

    #[test]
    fn find_call_to_matches_target_and_selector() {
        let trace = TraceData::from_output(fixture()).unwrap();
        let paymaster: Address = PAYMASTER.parse().unwrap();
        assert!(trace.find_call_to(paymaster, "0xf465c77e").is_some());
        assert!(trace.find_call_to(paymaster, "0xdeadbeef").is_none());
        assert!(trace.find_call_to(SENDER.parse().unwrap(), "0xf465c77e").is_none());
    }

    #[test]
    fn accessed_contracts_orders_account_before_paymaster() {
        let trace = TraceData::from_output(fixture()).unwrap();
        assert_eq!(
            trace.accessed_contracts(),
            vec![SENDER.parse::<Address>().unwrap(), PAYMASTER.parse().unwrap()]
        );
    }

    #[test]
    fn entity_slots_come_from_matching_preimages() {
        let trace = TraceData::from_output(fixture()).unwrap();
        let sender: Address = SENDER.parse().unwrap();
        let paymaster: Address = PAYMASTER.parse().unwrap();

        let slots = parse_entity_slots(&[sender, paymaster], &trace.keccak);
        assert_eq!(slots[&sender].len(), 1);
        assert_eq!(slots[&sender][0], keccak256(&trace.keccak[0]));
        assert!(slots[&paymaster].is_empty());
    }

    #[test]
    fn slot_association_window_is_eighteen_slots() {
        let entity: Address = SENDER.parse().unwrap();
        let root = B256::from(U256::from(1000u64).to_be_bytes::<32>());

        assert!(is_slot_associated(U256::from(1000u64), entity, &[root]));
        assert!(is_slot_associated(U256::from(1017u64), entity, &[root]));
        assert!(!is_slot_associated(U256::from(1018u64), entity, &[root]));
        assert!(!is_slot_associated(U256::from(999u64), entity, &[root]));
    }

    #[test]
    fn padded_entity_address_is_always_associated() {
        let entity: Address = SENDER.parse().unwrap();
        let slot = U256::from_be_bytes(left_padded(entity));
        assert!(is_slot_associated(slot, entity, &[]));
    }
}
