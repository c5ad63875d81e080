//! An in-memory chain for tests and local development.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use arena_core::types::{Address, Amount};

use crate::error::{ChainError, ChainResult};
use crate::{ChainT, SendTokenParams, TransferEvent, TransferQuery, TransferReceipt};

#[derive(Default)]
struct DummyState {
    latest_block: u64,
    receipts: HashMap<String, TransferReceipt>,
    token_balances: HashMap<String, Amount>,
    native_balances: HashMap<String, u64>,
    nonces: HashMap<String, u64>,
    transfers: Vec<TransferEvent>,
    sent: Vec<SendTokenParams>,
    queued_failures: Vec<ChainError>,
    sent_counter: u64,
}

/// Scriptable chain double.  Every accessor that mutates is `&self`; state
/// sits behind a mutex so tests can share the instance with the code under
/// test.
#[derive(Default)]
pub struct DummyChain {
    state: Mutex<DummyState>,
}

impl DummyChain {
    pub fn set_latest_block(&self, number: u64) {
        self.state.lock().unwrap().latest_block = number;
    }

    pub fn add_receipt(&self, receipt: TransferReceipt) {
        let mut state = self.state.lock().unwrap();
        state.receipts.insert(receipt.tx_hash.clone(), receipt);
    }

    pub fn set_token_balance(&self, addr: &Address, amount: Amount) {
        self.state
            .lock()
            .unwrap()
            .token_balances
            .insert(addr.as_str().to_string(), amount);
    }

    pub fn set_native_balance(&self, addr: &Address, amount: u64) {
        self.state
            .lock()
            .unwrap()
            .native_balances
            .insert(addr.as_str().to_string(), amount);
    }

    pub fn push_transfer(&self, event: TransferEvent) {
        self.state.lock().unwrap().transfers.push(event);
    }

    /// Queue `count` copies of `error`; each call consumes one before
    /// doing its work.
    pub fn fail_next(&self, count: usize, error: ChainError) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..count {
            state.queued_failures.push(error.clone());
        }
    }

    pub fn remaining_failures(&self) -> usize {
        self.state.lock().unwrap().queued_failures.len()
    }

    /// Transfers submitted through `send_token_transfer`, in order.
    pub fn sent_transfers(&self) -> Vec<SendTokenParams> {
        self.state.lock().unwrap().sent.clone()
    }

    fn take_failure(&self) -> Option<ChainError> {
        let mut state = self.state.lock().unwrap();
        if state.queued_failures.is_empty() {
            None
        } else {
            Some(state.queued_failures.remove(0))
        }
    }
}

#[async_trait]
impl ChainT for DummyChain {
    async fn latest_block(&self) -> ChainResult<u64> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        Ok(self.state.lock().unwrap().latest_block)
    }

    async fn transfer_receipt(&self, tx_hash: &str) -> ChainResult<Option<TransferReceipt>> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        Ok(self.state.lock().unwrap().receipts.get(tx_hash).cloned())
    }

    async fn token_balance(&self, addr: &Address) -> ChainResult<Amount> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        Ok(self
            .state
            .lock()
            .unwrap()
            .token_balances
            .get(addr.as_str())
            .copied()
            .unwrap_or_default())
    }

    async fn native_balance(&self, addr: &Address) -> ChainResult<u64> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        Ok(self
            .state
            .lock()
            .unwrap()
            .native_balances
            .get(addr.as_str())
            .copied()
            .unwrap_or_default())
    }

    async fn next_nonce(&self, addr: &Address) -> ChainResult<u64> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        Ok(self
            .state
            .lock()
            .unwrap()
            .nonces
            .get(addr.as_str())
            .copied()
            .unwrap_or_default())
    }

    async fn send_token_transfer(&self, params: &SendTokenParams) -> ChainResult<String> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let mut state = self.state.lock().unwrap();
        let from_balance = state
            .token_balances
            .get(params.from.as_str())
            .copied()
            .unwrap_or_default();
        if from_balance < params.amount {
            return Err(ChainError::InsufficientFunds(format!(
                "{} has {} < {}",
                params.from, from_balance, params.amount
            )));
        }
        state
            .token_balances
            .insert(params.from.as_str().to_string(), from_balance - params.amount);
        *state
            .token_balances
            .entry(params.to.as_str().to_string())
            .or_default() += params.amount;
        *state
            .nonces
            .entry(params.from.as_str().to_string())
            .or_default() = params.nonce + 1;

        state.sent_counter += 1;
        let tx_hash = format!("0x{:064x}", state.sent_counter);
        let block_number = state.latest_block;
        state.transfers.push(TransferEvent {
            tx_hash: tx_hash.clone(),
            block_number,
            from: params.from.clone(),
            to: params.to.clone(),
            amount: params.amount,
        });
        state.sent.push(params.clone());
        Ok(tx_hash)
    }

    async fn token_transfers(&self, query: &TransferQuery) -> ChainResult<Vec<TransferEvent>> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let state = self.state.lock().unwrap();
        Ok(state
            .transfers
            .iter()
            .filter(|t| t.block_number >= query.from_block && t.block_number <= query.to_block)
            .filter(|t| query.from.as_ref().map(|a| &t.from == a).unwrap_or(true))
            .filter(|t| query.to.as_ref().map(|a| &t.to == a).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn recover_signer(&self, message: &str, _signature: &str) -> ChainResult<Address> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        // Dev convention: the message itself names the wallet.
        Address::parse(message.trim())
            .map_err(|_| ChainError::MalformedResponse("unrecoverable message".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(tail: u8) -> Address {
        Address::parse(&format!("0x{:040x}", tail)).unwrap()
    }

    #[tokio::test]
    async fn send_moves_token_balances() {
        let chain = DummyChain::default();
        chain.set_token_balance(&addr(1), 3_000_000);
        let params = SendTokenParams {
            from: addr(1),
            to: addr(2),
            amount: 2_400_000,
            nonce: 0,
            confirmations: 3,
        };
        let tx_hash = chain.send_token_transfer(&params).await.unwrap();
        assert!(tx_hash.starts_with("0x"));
        assert_eq!(chain.token_balance(&addr(1)).await.unwrap(), 600_000);
        assert_eq!(chain.token_balance(&addr(2)).await.unwrap(), 2_400_000);
    }

    #[tokio::test]
    async fn send_fails_without_funds() {
        let chain = DummyChain::default();
        let params = SendTokenParams {
            from: addr(1),
            to: addr(2),
            amount: 100,
            nonce: 0,
            confirmations: 3,
        };
        let err = chain.send_token_transfer(&params).await.unwrap_err();
        assert!(matches!(err, ChainError::InsufficientFunds(_)));
    }

    #[tokio::test]
    async fn transfer_scan_filters_by_recipient_and_range() {
        let chain = DummyChain::default();
        chain.set_latest_block(50);
        chain.set_token_balance(&addr(1), 10_000_000);
        for _ in 0..2 {
            chain
                .send_token_transfer(&SendTokenParams {
                    from: addr(1),
                    to: addr(2),
                    amount: 1_000_000,
                    nonce: 0,
                    confirmations: 1,
                })
                .await
                .unwrap();
        }
        let found = chain
            .token_transfers(&TransferQuery {
                to: Some(addr(2)),
                from: None,
                from_block: 0,
                to_block: 100,
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        let none = chain
            .token_transfers(&TransferQuery {
                to: Some(addr(9)),
                from: None,
                from_block: 0,
                to_block: 100,
            })
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
