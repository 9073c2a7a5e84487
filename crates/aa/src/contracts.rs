//! EntryPoint ABI surface consumed by the bundler core.
//!
//! `simulateValidation` and the `ValidationResult`/`FailedOp` errors are the
//! EntryPoint's simulation protocol: the call always reverts and the revert
//! payload is the result.

alloy::sol! {
    interface IEntryPoint {
        struct UserOperation {
            address sender;
            uint256 nonce;
            bytes initCode;
            bytes callData;
            uint256 callGasLimit;
            uint256 verificationGasLimit;
            uint256 preVerificationGas;
            uint256 maxFeePerGas;
            uint256 maxPriorityFeePerGas;
            bytes paymasterAndData;
            bytes signature;
        }

        struct ReturnInfo {
            uint256 preOpGas;
            uint256 prefund;
            bool sigFailed;
            uint64 validAfter;
            uint64 validUntil;
            bytes paymasterContext;
        }

        struct StakeInfo {
            uint256 stake;
            uint256 unstakeDelaySec;
        }

        function handleOps(UserOperation[] calldata ops, address payable beneficiary) external;

        function simulateValidation(UserOperation calldata userOp) external;

        error FailedOp(uint256 opIndex, string reason);

        error ValidationResult(
            ReturnInfo returnInfo,
            StakeInfo senderInfo,
            StakeInfo factoryInfo,
            StakeInfo paymasterInfo
        );
    }
}

/// Selector of `validatePaymasterUserOp`, looked up in the flattened call
/// stack to find the paymaster's validation frame.
pub const VALIDATE_PAYMASTER_USER_OP_SELECTOR: &str = "0xf465c77e";
