//! Deferred queue for non-critical storage operations.
//!
//! Bounded at 100 entries, drained every five seconds.  User, match,
//! payout and refund writes never come through here.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use arena_storage::Store;

use crate::component::{CloseReason, Component, ComponentEnv, ConsumerPorts};
use crate::frame::{DeferredOp, EventFrame};

const DRAIN_INTERVAL: Duration = Duration::from_secs(5);
const MAX_PENDING: usize = 100;
const PAYOUT_ATTEMPT_RETENTION_DAYS: i64 = 30;

pub struct DeferredQueueContext {
    pub store: Arc<Store>,
    /// Exposed through /api/health.
    pub pending: Arc<AtomicUsize>,
}

pub struct DeferredQueue {}

#[async_trait]
impl Component<DeferredQueueContext> for DeferredQueue {
    fn name() -> &'static str {
        "Deferred Queue"
    }

    async fn run(
        mut ports: ConsumerPorts,
        ctx: DeferredQueueContext,
        env: ComponentEnv,
    ) -> CloseReason {
        let mut ticker = tokio::time::interval(DRAIN_INTERVAL);
        let mut pending: Vec<DeferredOp> = Vec::new();
        loop {
            tokio::select! {
                maybe = ports.recv() => match maybe {
                    Some(EventFrame::Defer(op)) => {
                        pending.push(op);
                        ctx.pending.store(pending.len(), Ordering::Relaxed);
                        if pending.len() >= MAX_PENDING {
                            drain(&ctx, &mut pending, &env).await;
                        }
                    }
                    Some(EventFrame::Shutdown) | None => {
                        drain(&ctx, &mut pending, &env).await;
                        break;
                    }
                    _ => {}
                },
                _ = ticker.tick() => {
                    drain(&ctx, &mut pending, &env).await;
                }
            }
        }
        CloseReason::Complete
    }
}

async fn drain(ctx: &DeferredQueueContext, pending: &mut Vec<DeferredOp>, env: &ComponentEnv) {
    for op in pending.drain(..) {
        let result = match &op {
            DeferredOp::PaidWallet { wallet, at } => ctx.store.upsert_paid_wallet(wallet, *at).await,
            DeferredOp::MatchEvent(event) => ctx.store.append_match_event(event).await,
            DeferredOp::ExpirePayoutAttempts => {
                let cutoff = chrono::Utc::now() - chrono::Duration::days(PAYOUT_ATTEMPT_RETENTION_DAYS);
                ctx.store
                    .expire_successful_payout_attempts(cutoff)
                    .await
                    .map(|_| ())
            }
        };
        if let Err(e) = result {
            warn!("{} Deferred op dropped ({}): {}", env.log_prefix, op, e);
        }
    }
    ctx.pending.store(0, Ordering::Relaxed);
}
