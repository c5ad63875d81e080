//! Chain access for the arena server.
//!
//! Everything above this crate talks to the chain through the [`ChainT`]
//! trait: receipt lookup, balance reads, nonce management, token transfers
//! and Transfer-event scans.  [`WrappedChain`] adds retry with provider
//! failover on top of any implementation.  Key custody and transaction
//! signing live behind the RPC endpoint; this crate never sees a private
//! key.

mod dummy;
mod error;
mod rpc;
mod verify;
mod wallet;
mod wrapped;

pub use dummy::DummyChain;
pub use error::{ChainError, ChainResult, ErrorKind};
pub use rpc::EthRpcChain;
pub use verify::{verify_deposit, DepositCheck, VerifiedDeposit, VerifyError};
pub use wallet::WalletRegistry;
pub use wrapped::WrappedChain;

use async_trait::async_trait;

use arena_core::types::{Address, Amount};

/// A decoded token transfer receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub tx_hash: String,
    pub status_ok: bool,
    pub block_number: u64,
    pub block_timestamp: u64,
    /// Transfer logs emitted by the expected token contract.
    pub transfers: Vec<TransferEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub tx_hash: String,
    pub block_number: u64,
    pub from: Address,
    pub to: Address,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendTokenParams {
    pub from: Address,
    pub to: Address,
    pub amount: Amount,
    /// Explicit nonce, taken once before any retry loop and reused across
    /// providers so a resend can never double-spend.
    pub nonce: u64,
    pub confirmations: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TransferQuery {
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub from_block: u64,
    pub to_block: u64,
}

#[async_trait]
pub trait ChainT: Send + Sync {
    async fn latest_block(&self) -> ChainResult<u64>;

    /// Receipt for a token payment, or `None` when the hash is unknown.
    async fn transfer_receipt(&self, tx_hash: &str) -> ChainResult<Option<TransferReceipt>>;

    async fn token_balance(&self, addr: &Address) -> ChainResult<Amount>;

    async fn native_balance(&self, addr: &Address) -> ChainResult<u64>;

    /// Next pending nonce for an account.
    async fn next_nonce(&self, addr: &Address) -> ChainResult<u64>;

    /// Submit a token transfer and wait for the requested confirmations.
    async fn send_token_transfer(&self, params: &SendTokenParams) -> ChainResult<String>;

    /// Scan Transfer events of the token contract in a block range.
    async fn token_transfers(&self, query: &TransferQuery) -> ChainResult<Vec<TransferEvent>>;

    /// Recover the signing wallet of a login message.
    async fn recover_signer(&self, message: &str, signature: &str) -> ChainResult<Address>;
}
