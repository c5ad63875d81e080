//! Stall detection: a running match whose tick loop stops advancing is
//! voided with `game_loop_stalled`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use arena_core::types::MatchStatus;
use arena_server::component::{
    CloseReason, Component, ComponentEnv, ConsumerPorts, HealthMonitor, HealthMonitorContext,
};
use arena_server::frame::{EventFrame, MatchVerdict, SignalFrame};
use arena_server::match_manager::{now_ms, MatchHandle, MatchManager, MatchShared};

/// Stand-in for a match runner that never ticks.
struct Wedged {}

#[async_trait]
impl Component<()> for Wedged {
    fn name() -> &'static str {
        "Wedged"
    }

    async fn run(mut ports: ConsumerPorts, _ctx: (), _env: ComponentEnv) -> CloseReason {
        while let Some(frame) = ports.recv().await {
            if matches!(frame, EventFrame::Shutdown) {
                break;
            }
        }
        CloseReason::Complete
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_match_is_voided_within_the_sweep() {
    let matches = Arc::new(MatchManager::default());
    let match_id = Uuid::new_v4();
    // Last successful tick far in the past.
    let shared = Arc::new(MatchShared::new(
        MatchStatus::Running,
        now_ms().saturating_sub(10_000),
    ));
    matches
        .insert(MatchHandle {
            match_id,
            lobby_id: 1,
            players: vec![],
            shared: shared.clone(),
            ports: Wedged::start((), ComponentEnv::new("[wedged]")),
        })
        .await;

    let (signal_tx, mut signal_rx) = mpsc::channel(8);
    let monitor = HealthMonitor::start(
        HealthMonitorContext {
            matches: matches.clone(),
            signal_tx,
        },
        ComponentEnv::new("[health]"),
    );

    match signal_rx.recv().await {
        Some(SignalFrame::MatchEnded {
            match_id: ended, verdict, ..
        }) => {
            assert_eq!(ended, match_id);
            assert_eq!(
                verdict,
                MatchVerdict::Void {
                    reason: "game_loop_stalled".into()
                }
            );
        }
        other => panic!("expected MatchEnded, got {:?}", other),
    }
    assert_eq!(shared.status(), MatchStatus::Ending);

    // A healthy match is left alone: no second signal for the same one.
    monitor.send(EventFrame::Shutdown).await;
    assert!(signal_rx.recv().await.is_none());
}
