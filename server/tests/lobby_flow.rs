//! Lobby joins with on-chain verification, the duplicate-admit barrier,
//! match-start signaling and timeout refunds.

use std::sync::Arc;

use arena_chain::{ChainT, DummyChain, TransferEvent, TransferReceipt, WalletRegistry};
use arena_core::error::Error;
use arena_core::types::{Address, LobbyStatus, TxHash, User};
use arena_server::alerts::AlertSink;
use arena_server::connection::ConnectionTable;
use arena_server::frame::SignalFrame;
use arena_server::lobby::{JoinOptions, LobbyCoordinator};
use arena_server::settlement::Settlement;
use arena_storage::Store;
use tokio::sync::mpsc;

const BUY_IN: u64 = 1_000_000;
const WINNER_PAYOUT: u64 = 2_400_000;

struct Harness {
    store: Arc<Store>,
    chain: Arc<DummyChain>,
    wallets: Arc<WalletRegistry>,
    lobby: LobbyCoordinator,
    signal_rx: mpsc::Receiver<SignalFrame>,
    _deferred_rx: mpsc::Receiver<arena_server::frame::EventFrame>,
}

async fn harness(timeout_secs: u64) -> Harness {
    let store = Arc::new(Store::try_new_mem().unwrap());
    let chain = Arc::new(DummyChain::default());
    chain.set_latest_block(100);
    let wallets = Arc::new(WalletRegistry::derive("seed", "enc", "mnemonic", 2));
    let connections = Arc::new(ConnectionTable::default());
    let alerts = Arc::new(AlertSink::new(vec![]));
    let settlement = Arc::new(Settlement::new(
        store.clone(),
        chain.clone(),
        wallets.clone(),
        alerts,
        connections.clone(),
        BUY_IN,
        WINNER_PAYOUT,
        3,
    ));
    let (signal_tx, signal_rx) = mpsc::channel(8);
    let (deferred_tx, deferred_rx) = mpsc::channel(100);
    let lobby = LobbyCoordinator::new(
        store.clone(),
        chain.clone(),
        wallets.clone(),
        connections,
        settlement,
        signal_tx,
        deferred_tx,
        2,
        BUY_IN,
        3,
        3600,
        timeout_secs,
    );
    lobby.ensure_lobbies().await.unwrap();
    Harness {
        store,
        chain,
        wallets,
        lobby,
        signal_rx,
        _deferred_rx: deferred_rx,
    }
}

async fn user(h: &Harness, tail: u8) -> User {
    let wallet = Address::parse(&format!("0x{:040x}", tail)).unwrap();
    h.store.get_or_create_user(&wallet).await.unwrap()
}

fn paid_receipt(h: &Harness, sender: &Address, tail: u8) -> TxHash {
    let tx_hash = format!("0x{:064x}", tail);
    h.chain.add_receipt(TransferReceipt {
        tx_hash: tx_hash.clone(),
        status_ok: true,
        block_number: 95,
        block_timestamp: chrono::Utc::now().timestamp() as u64,
        transfers: vec![TransferEvent {
            tx_hash: tx_hash.clone(),
            block_number: 95,
            from: sender.clone(),
            to: h.wallets.lobby_address(1).unwrap().clone(),
            amount: BUY_IN,
        }],
    });
    TxHash::new(tx_hash)
}

#[tokio::test]
async fn verified_joins_fill_the_lobby_and_signal_start() {
    let mut h = harness(600).await;
    for tail in 1..=3u8 {
        let user = user(&h, tail).await;
        let tx = paid_receipt(&h, &user.wallet, tail);
        let summary = h
            .lobby
            .join(&user, 1, tx, JoinOptions::public())
            .await
            .unwrap();
        assert_eq!(summary.player_count, tail);
    }
    assert_eq!(
        h.store.get_lobby(1).await.unwrap().unwrap().status,
        LobbyStatus::Ready
    );
    match h.signal_rx.recv().await {
        Some(SignalFrame::StartMatch { lobby_id }) => assert_eq!(lobby_id, 1),
        other => panic!("expected StartMatch, got {:?}", other),
    }
}

#[tokio::test]
async fn unverifiable_payment_is_rejected() {
    let h = harness(600).await;
    let user = user(&h, 1).await;
    // No receipt exists for this hash.
    let err = h
        .lobby
        .join(
            &user,
            1,
            TxHash::new(format!("0x{:064x}", 99u8)),
            JoinOptions::public(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.user_code(), 2005);
    assert!(h.store.active_players(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_tx_hash_admits_exactly_one() {
    let h = harness(600).await;
    let alice = user(&h, 1).await;
    let mallory = user(&h, 2).await;
    let tx = paid_receipt(&h, &alice.wallet, 7);

    h.lobby
        .join(&alice, 1, tx.clone(), JoinOptions::public())
        .await
        .unwrap();
    // Same hash, different caller, different lobby: still rejected.
    let err = h
        .lobby
        .join(&mallory, 2, tx, JoinOptions::deposit_monitor())
        .await
        .unwrap_err();
    assert_eq!(err, Error::DuplicateTxHash);
    assert_eq!(err.user_code(), 2005);
}

#[tokio::test]
async fn deposit_monitor_admit_skips_verification() {
    let h = harness(600).await;
    let user = user(&h, 3).await;
    // No receipt programmed; the Transfer event already proved payment.
    let summary = h
        .lobby
        .join(
            &user,
            1,
            TxHash::new(format!("0x{:064x}", 55u8)),
            JoinOptions::deposit_monitor(),
        )
        .await
        .unwrap();
    assert_eq!(summary.player_count, 1);
}

#[tokio::test]
async fn timeout_refund_flow() {
    let h = harness(0).await;
    h.chain
        .set_token_balance(h.wallets.lobby_address(2).unwrap(), BUY_IN);

    let alice = user(&h, 1).await;
    let tx = TxHash::new(format!("0x{:064x}", 11u8));
    h.chain.add_receipt(TransferReceipt {
        tx_hash: tx.as_str().to_string(),
        status_ok: true,
        block_number: 95,
        block_timestamp: chrono::Utc::now().timestamp() as u64,
        transfers: vec![TransferEvent {
            tx_hash: tx.as_str().to_string(),
            block_number: 95,
            from: alice.wallet.clone(),
            to: h.wallets.lobby_address(2).unwrap().clone(),
            amount: BUY_IN,
        }],
    });
    h.lobby
        .join(&alice, 2, tx, JoinOptions::public())
        .await
        .unwrap();

    // timeout_secs = 0: the refund window is already open.
    let refunds = h.lobby.request_refund(alice.id).await.unwrap();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].amount, BUY_IN);
    assert_eq!(h.chain.token_balance(&alice.wallet).await.unwrap(), BUY_IN);
    assert_eq!(
        h.store.get_lobby(2).await.unwrap().unwrap().status,
        LobbyStatus::Empty
    );

    // A second request finds no live stake.
    let err = h.lobby.request_refund(alice.id).await.unwrap_err();
    assert_eq!(err.user_code(), 2006);
}

#[tokio::test]
async fn refund_unavailable_before_timeout() {
    let h = harness(600).await;
    let alice = user(&h, 1).await;
    let tx = paid_receipt(&h, &alice.wallet, 21);
    h.lobby
        .join(&alice, 1, tx, JoinOptions::public())
        .await
        .unwrap();
    let err = h.lobby.request_refund(alice.id).await.unwrap_err();
    assert_eq!(err, Error::RefundNotAvailable);
}
