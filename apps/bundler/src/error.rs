/// Why a UserOperation was refused. These surface to the RPC caller and are
/// never retried; transport failures and broken simulation invariants are
/// `Internal` and map to a generic server error instead.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("simulate validation: {0}")]
    SimulateValidation(String),

    #[error("opcode validation: {0}")]
    OpcodeValidation(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("invalid fields: {0}")]
    InvalidFields(String),

    #[error("expires shortly: {0}")]
    ExpiresShortly(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ValidationError {
    /// Stable kind tag for logs and the RPC facade.
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::SimulateValidation(_) => "SimulateValidation",
            ValidationError::OpcodeValidation(_) => "OpcodeValidation",
            ValidationError::InvalidSignature(_) => "InvalidSignature",
            ValidationError::InvalidFields(_) => "InvalidFields",
            ValidationError::ExpiresShortly(_) => "ExpiresShortly",
            ValidationError::Internal(_) => "Internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        let err = ValidationError::OpcodeValidation("paymaster uses banned opcode: GAS".into());
        assert_eq!(err.kind(), "OpcodeValidation");
        assert!(err.to_string().contains("banned opcode"));

        let err = ValidationError::from(anyhow::anyhow!("simulateValidation didn't revert!"));
        assert_eq!(err.kind(), "Internal");
    }
}
