//! Wrapped chain, which supports retry and provider failover.
//!
//! Every call goes to the active provider.  Transient failures retry with
//! jittered exponential backoff and rotate to the next provider in the
//! configured list; permanent failures return immediately.  The final
//! error aggregates the attempt history so callers can raise one alert.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use rand::Rng;
use tracing::warn;

use arena_core::types::{Address, Amount};

use crate::error::{ChainError, ChainResult, ErrorKind};
use crate::{ChainT, SendTokenParams, TransferEvent, TransferQuery, TransferReceipt};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

pub struct WrappedChain {
    providers: Vec<Arc<dyn ChainT>>,
    active: AtomicUsize,
}

impl WrappedChain {
    /// `providers` is ordered: primary first, then fallbacks.
    pub fn new(providers: Vec<Arc<dyn ChainT>>) -> Self {
        assert!(!providers.is_empty(), "at least one provider required");
        Self {
            providers,
            active: AtomicUsize::new(0),
        }
    }

    fn provider(&self) -> Arc<dyn ChainT> {
        let index = self.active.load(Ordering::Relaxed) % self.providers.len();
        self.providers[index].clone()
    }

    fn rotate_provider(&self) {
        if self.providers.len() > 1 {
            self.active.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn with_retry<T>(
        &self,
        op: &str,
        call: impl Fn(Arc<dyn ChainT>) -> BoxFuture<'static, ChainResult<T>>,
    ) -> ChainResult<T> {
        let mut backoff = BACKOFF_BASE;
        let mut last: Option<ChainError> = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match call(self.provider()).await {
                Ok(value) => return Ok(value),
                Err(e) => match e.kind() {
                    ErrorKind::Transient => {
                        warn!(op, attempt, error = %e, "transient chain error, will retry");
                        last = Some(e);
                        self.rotate_provider();
                        if attempt < MAX_ATTEMPTS {
                            let jitter =
                                Duration::from_millis(rand::thread_rng().gen_range(0..250));
                            tokio::time::sleep((backoff + jitter).min(BACKOFF_CAP)).await;
                            backoff = (backoff * 2).min(BACKOFF_CAP);
                        }
                    }
                    ErrorKind::Permanent | ErrorKind::Unknown => return Err(e),
                },
            }
        }
        Err(ChainError::Exhausted {
            attempts: MAX_ATTEMPTS,
            last: last
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempts recorded".into()),
        })
    }
}

#[async_trait]
impl ChainT for WrappedChain {
    async fn latest_block(&self) -> ChainResult<u64> {
        self.with_retry("latest_block", |p| Box::pin(async move { p.latest_block().await }))
            .await
    }

    async fn transfer_receipt(&self, tx_hash: &str) -> ChainResult<Option<TransferReceipt>> {
        let tx_hash = tx_hash.to_string();
        self.with_retry("transfer_receipt", move |p| {
            let tx_hash = tx_hash.clone();
            Box::pin(async move { p.transfer_receipt(&tx_hash).await })
        })
        .await
    }

    async fn token_balance(&self, addr: &Address) -> ChainResult<Amount> {
        let addr = addr.clone();
        self.with_retry("token_balance", move |p| {
            let addr = addr.clone();
            Box::pin(async move { p.token_balance(&addr).await })
        })
        .await
    }

    async fn native_balance(&self, addr: &Address) -> ChainResult<u64> {
        let addr = addr.clone();
        self.with_retry("native_balance", move |p| {
            let addr = addr.clone();
            Box::pin(async move { p.native_balance(&addr).await })
        })
        .await
    }

    async fn next_nonce(&self, addr: &Address) -> ChainResult<u64> {
        let addr = addr.clone();
        self.with_retry("next_nonce", move |p| {
            let addr = addr.clone();
            Box::pin(async move { p.next_nonce(&addr).await })
        })
        .await
    }

    /// The nonce inside `params` was taken before this call and is reused
    /// verbatim on every retry and provider switch.
    async fn send_token_transfer(&self, params: &SendTokenParams) -> ChainResult<String> {
        let params = params.clone();
        self.with_retry("send_token_transfer", move |p| {
            let params = params.clone();
            Box::pin(async move { p.send_token_transfer(&params).await })
        })
        .await
    }

    async fn token_transfers(&self, query: &TransferQuery) -> ChainResult<Vec<TransferEvent>> {
        let query = query.clone();
        self.with_retry("token_transfers", move |p| {
            let query = query.clone();
            Box::pin(async move { p.token_transfers(&query).await })
        })
        .await
    }

    async fn recover_signer(&self, message: &str, signature: &str) -> ChainResult<Address> {
        let message = message.to_string();
        let signature = signature.to_string();
        self.with_retry("recover_signer", move |p| {
            let message = message.clone();
            let signature = signature.clone();
            Box::pin(async move { p.recover_signer(&message, &signature).await })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DummyChain;

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_and_recover() {
        let dummy = Arc::new(DummyChain::default());
        dummy.set_latest_block(100);
        dummy.fail_next(2, ChainError::Timeout("flaky".into()));
        let wrapped = WrappedChain::new(vec![dummy]);
        assert_eq!(wrapped.latest_block().await.unwrap(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_do_not_retry() {
        let dummy = Arc::new(DummyChain::default());
        dummy.set_latest_block(100);
        dummy.fail_next(1, ChainError::InsufficientFunds("broke".into()));
        let wrapped = WrappedChain::new(vec![dummy.clone()]);
        let err = wrapped.latest_block().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
        // The queued failure was consumed by the single attempt.
        assert_eq!(dummy.remaining_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_aggregates_attempts() {
        let dummy = Arc::new(DummyChain::default());
        dummy.set_latest_block(100);
        dummy.fail_next(10, ChainError::Timeout("down".into()));
        let wrapped = WrappedChain::new(vec![dummy]);
        let err = wrapped.latest_block().await.unwrap_err();
        match err {
            ChainError::Exhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected exhausted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failover_rotates_to_fallback_provider() {
        let primary = Arc::new(DummyChain::default());
        primary.fail_next(10, ChainError::Timeout("down".into()));
        let fallback = Arc::new(DummyChain::default());
        fallback.set_latest_block(777);
        let wrapped = WrappedChain::new(vec![primary, fallback]);
        assert_eq!(wrapped.latest_block().await.unwrap(), 777);
    }
}
