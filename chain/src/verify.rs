//! Deposit verification against a transfer receipt.

use thiserror::Error;

use arena_core::types::{Address, Amount};

use crate::error::ChainError;
use crate::ChainT;

#[derive(Debug, Clone)]
pub struct DepositCheck {
    pub tx_hash: String,
    pub expected_sender: Address,
    pub expected_recipient: Address,
    pub expected_amount: Amount,
    pub min_confirmations: u64,
    pub max_age_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedDeposit {
    pub block_number: u64,
    pub amount: Amount,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("transaction not found")]
    NotFound,

    #[error("transaction failed on chain")]
    StatusFailed,

    #[error("only {have} of {need} confirmations")]
    InsufficientConfirmations { have: u64, need: u64 },

    #[error("transaction is {age_secs}s old, max {max_secs}s")]
    TooOld { age_secs: u64, max_secs: u64 },

    #[error("no transfer matching sender, recipient and amount")]
    NoMatchingTransfer,

    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Verify a buy-in payment.
///
/// Requires a successful receipt with enough confirmations, a block no
/// older than `max_age_secs`, and a Transfer log with the exact sender,
/// recipient and amount.  The token has fixed integer semantics, so there
/// is no amount tolerance.
pub async fn verify_deposit(
    chain: &dyn ChainT,
    check: &DepositCheck,
    now_unix: u64,
) -> Result<VerifiedDeposit, VerifyError> {
    let receipt = chain
        .transfer_receipt(&check.tx_hash)
        .await?
        .ok_or(VerifyError::NotFound)?;

    if !receipt.status_ok {
        return Err(VerifyError::StatusFailed);
    }

    let latest = chain.latest_block().await?;
    let confirmations = latest.saturating_sub(receipt.block_number) + 1;
    if confirmations < check.min_confirmations {
        return Err(VerifyError::InsufficientConfirmations {
            have: confirmations,
            need: check.min_confirmations,
        });
    }

    let age_secs = now_unix.saturating_sub(receipt.block_timestamp);
    if age_secs > check.max_age_secs {
        return Err(VerifyError::TooOld {
            age_secs,
            max_secs: check.max_age_secs,
        });
    }

    let matched = receipt.transfers.iter().find(|t| {
        t.from == check.expected_sender
            && t.to == check.expected_recipient
            && t.amount == check.expected_amount
    });
    match matched {
        Some(transfer) => Ok(VerifiedDeposit {
            block_number: receipt.block_number,
            amount: transfer.amount,
        }),
        None => Err(VerifyError::NoMatchingTransfer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DummyChain, TransferEvent, TransferReceipt};

    fn addr(tail: u8) -> Address {
        Address::parse(&format!("0x{:040x}", tail)).unwrap()
    }

    fn check() -> DepositCheck {
        DepositCheck {
            tx_hash: format!("0x{}", "11".repeat(32)),
            expected_sender: addr(1),
            expected_recipient: addr(2),
            expected_amount: 1_000_000,
            min_confirmations: 3,
            max_age_secs: 3600,
        }
    }

    fn receipt(status_ok: bool, block: u64, timestamp: u64, amount: Amount) -> TransferReceipt {
        TransferReceipt {
            tx_hash: check().tx_hash,
            status_ok,
            block_number: block,
            block_timestamp: timestamp,
            transfers: vec![TransferEvent {
                tx_hash: check().tx_hash,
                block_number: block,
                from: addr(1),
                to: addr(2),
                amount,
            }],
        }
    }

    #[tokio::test]
    async fn accepts_exact_match() {
        let chain = DummyChain::default();
        chain.set_latest_block(110);
        chain.add_receipt(receipt(true, 100, 5000, 1_000_000));
        let verified = verify_deposit(&chain, &check(), 5100).await.unwrap();
        assert_eq!(verified.block_number, 100);
        assert_eq!(verified.amount, 1_000_000);
    }

    #[tokio::test]
    async fn rejects_unknown_hash() {
        let chain = DummyChain::default();
        chain.set_latest_block(110);
        let err = verify_deposit(&chain, &check(), 5100).await.unwrap_err();
        assert_eq!(err, VerifyError::NotFound);
    }

    #[tokio::test]
    async fn rejects_failed_status() {
        let chain = DummyChain::default();
        chain.set_latest_block(110);
        chain.add_receipt(receipt(false, 100, 5000, 1_000_000));
        let err = verify_deposit(&chain, &check(), 5100).await.unwrap_err();
        assert_eq!(err, VerifyError::StatusFailed);
    }

    #[tokio::test]
    async fn rejects_shallow_confirmations() {
        let chain = DummyChain::default();
        chain.set_latest_block(100);
        chain.add_receipt(receipt(true, 100, 5000, 1_000_000));
        let err = verify_deposit(&chain, &check(), 5100).await.unwrap_err();
        assert_eq!(
            err,
            VerifyError::InsufficientConfirmations { have: 1, need: 3 }
        );
    }

    #[tokio::test]
    async fn rejects_stale_block() {
        let chain = DummyChain::default();
        chain.set_latest_block(110);
        chain.add_receipt(receipt(true, 100, 1000, 1_000_000));
        let err = verify_deposit(&chain, &check(), 1000 + 3601).await.unwrap_err();
        assert!(matches!(err, VerifyError::TooOld { .. }));
    }

    #[tokio::test]
    async fn rejects_wrong_amount_without_tolerance() {
        let chain = DummyChain::default();
        chain.set_latest_block(110);
        chain.add_receipt(receipt(true, 100, 5000, 999_999));
        let err = verify_deposit(&chain, &check(), 5100).await.unwrap_err();
        assert_eq!(err, VerifyError::NoMatchingTransfer);
    }
}
