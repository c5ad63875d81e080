//! Crash recovery: reconciliation against the chain decides between
//! finishing with the found payout and voiding with refunds.

use std::sync::Arc;

use arena_chain::{ChainT, DummyChain, TransferEvent, WalletRegistry};
use arena_core::types::{Address, LobbyStatus, MatchStatus, TxHash, UserId};
use arena_physics::Role;
use arena_server::alerts::AlertSink;
use arena_server::connection::ConnectionTable;
use arena_server::recovery::{recover_interrupted_matches, RecoveryContext};
use arena_server::settlement::Settlement;
use arena_storage::{NewMatch, NewMatchPlayer, Store};
use uuid::Uuid;

const BUY_IN: u64 = 1_000_000;
const WINNER_PAYOUT: u64 = 2_400_000;

struct Harness {
    ctx: RecoveryContext,
    chain: Arc<DummyChain>,
    store: Arc<Store>,
    users: Vec<UserId>,
    user_wallets: Vec<Address>,
    match_id: Uuid,
    lobby_wallet: Address,
}

async fn interrupted_match() -> Harness {
    let store = Arc::new(Store::try_new_mem().unwrap());
    let chain = Arc::new(DummyChain::default());
    chain.set_latest_block(500);
    let wallets = Arc::new(WalletRegistry::derive("seed", "enc", "mnemonic", 2));
    let lobby_wallet = wallets.lobby_address(1).unwrap().clone();

    store
        .ensure_lobby(1, &lobby_wallet, "enc-1")
        .await
        .unwrap();

    let mut users = Vec::new();
    let mut user_wallets = Vec::new();
    for tail in 1..=3u8 {
        let wallet = Address::parse(&format!("0x{:040x}", tail)).unwrap();
        let user = store.get_or_create_user(&wallet).await.unwrap();
        store
            .insert_lobby_player(1, user.id, &TxHash::new(format!("0xdev_{}", tail)), 600)
            .await
            .unwrap();
        users.push(user.id);
        user_wallets.push(wallet);
    }

    let match_id = Uuid::new_v4();
    let players: Vec<NewMatchPlayer> = users
        .iter()
        .zip(Role::ALL)
        .map(|(user_id, role)| NewMatchPlayer {
            user_id: *user_id,
            role,
            spawn_x: 300.0,
            spawn_y: 300.0,
        })
        .collect();
    store
        .create_match(
            &NewMatch {
                id: match_id,
                lobby_id: 1,
                rng_seed: 42,
                buy_in: BUY_IN,
            },
            &players,
        )
        .await
        .unwrap();
    store.set_match_running(match_id).await.unwrap();
    store
        .save_match_state(match_id, 412, MatchStatus::Running, r#"{"tick":412}"#)
        .await
        .unwrap();

    let settlement = Arc::new(Settlement::new(
        store.clone(),
        chain.clone(),
        wallets.clone(),
        Arc::new(AlertSink::new(vec![])),
        Arc::new(ConnectionTable::default()),
        BUY_IN,
        WINNER_PAYOUT,
        3,
    ));

    let ctx = RecoveryContext {
        store: store.clone(),
        chain: chain.clone(),
        wallets,
        alerts: Arc::new(AlertSink::new(vec![])),
        settlement,
        winner_payout: WINNER_PAYOUT,
        lookback_blocks: 5000,
    };
    Harness {
        ctx,
        chain,
        store,
        users,
        user_wallets,
        match_id,
        lobby_wallet,
    }
}

#[tokio::test]
async fn crash_without_payout_voids_and_refunds() {
    let h = interrupted_match().await;
    h.chain.set_token_balance(&h.lobby_wallet, 3 * BUY_IN);

    let recovered = recover_interrupted_matches(&h.ctx).await.unwrap();
    assert_eq!(recovered, 1);

    let row = h.store.get_match(h.match_id).await.unwrap().unwrap();
    assert_eq!(row.status, MatchStatus::Void);
    for wallet in &h.user_wallets {
        assert_eq!(h.chain.token_balance(wallet).await.unwrap(), BUY_IN);
    }
    assert!(h.store.get_match_state(h.match_id).await.unwrap().is_none());
    assert_eq!(
        h.store.get_lobby(1).await.unwrap().unwrap().status,
        LobbyStatus::Empty
    );
}

#[tokio::test]
async fn payout_found_on_chain_finishes_without_refunds() {
    let h = interrupted_match().await;
    h.chain.set_token_balance(&h.lobby_wallet, 3 * BUY_IN - WINNER_PAYOUT);
    // The previous process sent the payout but died before persisting it.
    h.chain.push_transfer(TransferEvent {
        tx_hash: format!("0x{}", "cd".repeat(32)),
        block_number: 498,
        from: h.lobby_wallet.clone(),
        to: h.user_wallets[2].clone(),
        amount: WINNER_PAYOUT,
    });

    let recovered = recover_interrupted_matches(&h.ctx).await.unwrap();
    assert_eq!(recovered, 1);

    let row = h.store.get_match(h.match_id).await.unwrap().unwrap();
    assert_eq!(row.status, MatchStatus::Finished);
    assert_eq!(row.winner_id, Some(h.users[2]));
    assert_eq!(
        row.payout_tx_hash.as_deref(),
        Some(format!("0x{}", "cd".repeat(32)).as_str())
    );

    // No refunds were issued and the stakes are consumed.
    assert!(h.chain.sent_transfers().is_empty());
    assert!(h.store.active_players(1).await.unwrap().is_empty());
    assert_eq!(
        h.store.get_lobby(1).await.unwrap().unwrap().status,
        LobbyStatus::Empty
    );
    assert!(h.store.get_match_state(h.match_id).await.unwrap().is_none());
}

#[tokio::test]
async fn recovery_is_idempotent() {
    let h = interrupted_match().await;
    h.chain.set_token_balance(&h.lobby_wallet, 3 * BUY_IN);

    assert_eq!(recover_interrupted_matches(&h.ctx).await.unwrap(), 1);
    let sent_after_first = h.chain.sent_transfers().len();
    let row_after_first = h.store.get_match(h.match_id).await.unwrap().unwrap();

    // A second pass finds nothing interrupted and changes nothing.
    assert_eq!(recover_interrupted_matches(&h.ctx).await.unwrap(), 0);
    assert_eq!(h.chain.sent_transfers().len(), sent_after_first);
    let row_after_second = h.store.get_match(h.match_id).await.unwrap().unwrap();
    assert_eq!(row_after_first, row_after_second);
}
