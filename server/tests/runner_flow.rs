//! Runner lifecycle: countdown into the tick loop, abort handling and
//! the restart path.

use std::sync::Arc;

use arena_core::types::{Address, MatchStatus, TxHash};
use arena_physics::PhysicsConfig;
use arena_server::component::{Component, ComponentEnv};
use arena_server::connection::{ConnectionTable, MatchBroadcaster};
use arena_server::frame::{EventFrame, MatchVerdict, SignalFrame};
use arena_server::match_manager::{now_ms, MatchShared};
use arena_server::match_runner::{MatchRunner, MatchRunnerContext};
use arena_server::match_state::{LiveMatch, NewLivePlayer, TickSettings};
use arena_storage::{NewMatch, NewMatchPlayer, Store};
use tokio::sync::mpsc;
use uuid::Uuid;

struct Harness {
    store: Arc<Store>,
    shared: Arc<MatchShared>,
    ports: arena_server::component::PortsHandle,
    signal_rx: mpsc::Receiver<SignalFrame>,
    match_id: Uuid,
}

async fn start_runner() -> Harness {
    let store = Arc::new(Store::try_new_mem().unwrap());
    store
        .ensure_lobby(1, &Address::from_raw("0xlobby"), "enc")
        .await
        .unwrap();

    let physics = PhysicsConfig::default();
    let mut entrants = Vec::new();
    for tail in 1..=3u8 {
        let wallet = Address::parse(&format!("0x{:040x}", tail)).unwrap();
        let user = store.get_or_create_user(&wallet).await.unwrap();
        store
            .insert_lobby_player(1, user.id, &TxHash::new(format!("0xdev_{}", tail)), 600)
            .await
            .unwrap();
        entrants.push(NewLivePlayer {
            user_id: user.id,
            wallet,
            is_bot: false,
            connected: true,
        });
    }

    let match_id = Uuid::new_v4();
    let live = LiveMatch::new(match_id, 1, 4242, entrants, &physics);
    store
        .create_match(
            &NewMatch {
                id: match_id,
                lobby_id: 1,
                rng_seed: 4242,
                buy_in: 1_000_000,
            },
            &live
                .players
                .iter()
                .map(|p| NewMatchPlayer {
                    user_id: p.user_id,
                    role: p.body.role,
                    spawn_x: p.body.pos.x,
                    spawn_y: p.body.pos.y,
                })
                .collect::<Vec<_>>(),
        )
        .await
        .unwrap();

    let shared = Arc::new(MatchShared::new(MatchStatus::Countdown, now_ms()));
    let (signal_tx, signal_rx) = mpsc::channel(8);
    let (deferred_tx, mut deferred_rx) = mpsc::channel(100);
    // Drain deferred ops so the channel never fills.
    tokio::spawn(async move { while deferred_rx.recv().await.is_some() {} });

    let ctx = MatchRunnerContext {
        live,
        physics,
        settings: TickSettings {
            grace_ticks: 900,
            snapshot_rate: 30,
            hearts_to_win: 2,
            freeze_ticks: 90,
        },
        countdown_secs: 3,
        persistence_interval: 5,
        store: store.clone(),
        broadcaster: MatchBroadcaster::new(Arc::new(ConnectionTable::default()), vec![]),
        shared: shared.clone(),
        signal_tx,
        deferred_tx,
    };
    let ports = MatchRunner::start(ctx, ComponentEnv::new("[match:test]"));
    Harness {
        store,
        shared,
        ports,
        signal_rx,
        match_id,
    }
}

#[tokio::test(start_paused = true)]
async fn countdown_enters_running_and_ticks_advance() {
    let mut h = start_runner().await;

    // Past the 3 s countdown and a second of simulation.
    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    assert_eq!(h.shared.status(), MatchStatus::Running);
    assert!(h.shared.tick() > 0);

    let row = h.store.get_match(h.match_id).await.unwrap().unwrap();
    assert_eq!(row.status, MatchStatus::Running);
    assert!(row.running_at.is_some());

    // The periodic snapshot reached the store.
    let state = h.store.get_match_state(h.match_id).await.unwrap().unwrap();
    assert!(state.tick > 0);

    // Abort from outside; the runner reports a void verdict.
    h.ports
        .send(EventFrame::AbortMatch {
            reason: "admin_reset".into(),
        })
        .await;
    match h.signal_rx.recv().await {
        Some(SignalFrame::MatchEnded {
            match_id, verdict, ..
        }) => {
            assert_eq!(match_id, h.match_id);
            assert_eq!(
                verdict,
                MatchVerdict::Void {
                    reason: "admin_reset".into()
                }
            );
        }
        other => panic!("expected MatchEnded, got {:?}", other),
    }
    assert_eq!(h.shared.status(), MatchStatus::Ending);
}

#[tokio::test(start_paused = true)]
async fn abort_during_countdown_voids_without_running() {
    let mut h = start_runner().await;
    h.ports
        .send(EventFrame::AbortMatch {
            reason: "admin_reset".into(),
        })
        .await;
    match h.signal_rx.recv().await {
        Some(SignalFrame::MatchEnded { verdict, .. }) => {
            assert_eq!(
                verdict,
                MatchVerdict::Void {
                    reason: "admin_reset".into()
                }
            );
        }
        other => panic!("expected MatchEnded, got {:?}", other),
    }
    // The match never reached running.
    let row = h.store.get_match(h.match_id).await.unwrap().unwrap();
    assert_eq!(row.status, MatchStatus::Countdown);
}

#[tokio::test(start_paused = true)]
async fn shutdown_persists_state_and_defers_settlement_to_recovery() {
    let mut h = start_runner().await;
    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    assert_eq!(h.shared.status(), MatchStatus::Running);

    h.ports.send(EventFrame::Shutdown).await;
    // The runner stops without signaling settlement.
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    assert!(h.signal_rx.try_recv().is_err());
    assert_eq!(h.shared.status(), MatchStatus::Ending);

    // Recovery material: row still running, snapshot persisted.
    let row = h.store.get_match(h.match_id).await.unwrap().unwrap();
    assert_eq!(row.status, MatchStatus::Running);
    let state = h.store.get_match_state(h.match_id).await.unwrap().unwrap();
    assert!(state.tick > 0);
    assert!(!h
        .store
        .interrupted_matches()
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(start_paused = true)]
async fn disconnect_grace_eliminates_and_match_resolves() {
    let mut h = start_runner().await;
    tokio::time::sleep(std::time::Duration::from_secs(4)).await;

    let players = h.store.match_players(h.match_id).await.unwrap();
    // Two players drop and never return; grace runs out for both, the
    // remaining one wins by default.
    for player in players.iter().take(2) {
        h.ports
            .send(EventFrame::PlayerDisconnected {
                user_id: player.user_id,
            })
            .await;
    }
    tokio::time::sleep(std::time::Duration::from_secs(35)).await;

    match h.signal_rx.recv().await {
        Some(SignalFrame::MatchEnded { verdict, .. }) => match verdict {
            MatchVerdict::Winner { user_id, reason } => {
                assert_eq!(reason, "last_standing");
                assert_eq!(user_id, players[2].user_id);
            }
            other => panic!("expected winner, got {:?}", other),
        },
        other => panic!("expected MatchEnded, got {:?}", other),
    }
}
