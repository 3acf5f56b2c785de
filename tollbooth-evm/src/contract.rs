//! Solidity interface definitions for on-chain interactions.
//!
//! Only the ABI surface the gateway actually touches is declared: the
//! ERC-3009 + ERC-20 subset of USDC-style tokens, and the EIP-712 message
//! struct of a transfer authorization.

use alloy_sol_types::sol;

sol! {
    /// Minimal ERC-3009 + ERC-20 interface for USDC-style tokens.
    ///
    /// Reference:
    /// - ERC-3009: <https://eips.ethereum.org/EIPS/eip-3009>
    #[allow(missing_docs)]
    #[allow(clippy::too_many_arguments)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface IEip3009 {
        function balanceOf(address account) external view returns (uint256);
        function transferWithAuthorization(
            address from,
            address to,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            uint8 v,
            bytes32 r,
            bytes32 s
        ) external;
    }
}

sol! {
    /// EIP-712 message of an ERC-3009 transfer authorization.
    ///
    /// Field order is part of the type hash and must not change.
    #[allow(missing_docs)]
    #[derive(Debug)]
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
}
