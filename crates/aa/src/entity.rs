use alloy::primitives::U256;

use crate::contracts::IEntryPoint;

/// The three roles a contract can play during validation. The tracer reports
/// one level per role, in wire order factory=0, account=1, paymaster=2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Factory,
    Account,
    Paymaster,
}

impl EntityKind {
    pub const WIRE_ORDER: [EntityKind; 3] =
        [EntityKind::Factory, EntityKind::Account, EntityKind::Paymaster];

    pub fn wire_index(self) -> usize {
        match self {
            EntityKind::Factory => 0,
            EntityKind::Account => 1,
            EntityKind::Paymaster => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Factory => "factory",
            EntityKind::Account => "account",
            EntityKind::Paymaster => "paymaster",
        }
    }
}

/// Stake the EntryPoint reports for an entity during simulation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StakeInfo {
    pub stake: U256,
    pub unstake_delay_sec: U256,
}

impl StakeInfo {
    pub fn is_staked(&self) -> bool {
        self.stake > U256::from(1u64) && self.unstake_delay_sec > U256::from(1u64)
    }
}

impl From<IEntryPoint::StakeInfo> for StakeInfo {
    fn from(info: IEntryPoint::StakeInfo) -> Self {
        Self {
            stake: info.stake,
            unstake_delay_sec: info.unstakeDelaySec,
        }
    }
}

/// The `returnInfo` head of the `ValidationResult` revert payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReturnInfo {
    pub pre_op_gas: U256,
    pub prefund: U256,
    pub sig_failed: bool,
    pub valid_after: u64,
    pub valid_until: u64,
}

impl From<IEntryPoint::ReturnInfo> for ReturnInfo {
    fn from(info: IEntryPoint::ReturnInfo) -> Self {
        Self {
            pre_op_gas: info.preOpGas,
            prefund: info.prefund,
            sig_failed: info.sigFailed,
            valid_after: info.validAfter,
            valid_until: info.validUntil,
        }
    }
}
