//! Player statistics and paid-wallet tracking.
//!
//! Streaks are computed inside the upsert statement so concurrent match
//! settlements cannot race a read-modify-write.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use arena_core::error::Result;
use arena_core::types::{Address, Amount, PaidWallet, PlayerStats};

use crate::{map_err, Store};

#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub wallet: Address,
    pub won: bool,
    pub earnings: Amount,
    pub spent: Amount,
    pub at: DateTime<Utc>,
}

pub(crate) fn apply_match_outcome(conn: &Connection, outcome: &MatchOutcome) -> Result<()> {
    let win = if outcome.won { 1i64 } else { 0i64 };
    conn.execute(
        "INSERT INTO player_stats (wallet, matches_played, wins, losses, total_earnings,
                                   total_spent, current_win_streak, best_win_streak,
                                   first_match_at, last_match_at)
         VALUES (?1, 1, ?2, 1 - ?2, ?3, ?4, ?2, ?2, ?5, ?5)
         ON CONFLICT(wallet) DO UPDATE SET
           matches_played = matches_played + 1,
           wins = wins + ?2,
           losses = losses + (1 - ?2),
           total_earnings = total_earnings + ?3,
           total_spent = total_spent + ?4,
           current_win_streak = CASE WHEN ?2 = 1 THEN current_win_streak + 1 ELSE 0 END,
           best_win_streak = MAX(best_win_streak,
                                 CASE WHEN ?2 = 1 THEN current_win_streak + 1 ELSE 0 END),
           last_match_at = ?5",
        params![
            outcome.wallet.as_str(),
            win,
            outcome.earnings as i64,
            outcome.spent as i64,
            outcome.at
        ],
    )
    .map_err(map_err)?;
    Ok(())
}

fn row_to_stats(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlayerStats> {
    Ok(PlayerStats {
        wallet: Address::from_raw(row.get::<_, String>(0)?),
        matches_played: row.get::<_, i64>(1)? as u64,
        wins: row.get::<_, i64>(2)? as u64,
        losses: row.get::<_, i64>(3)? as u64,
        total_earnings: row.get::<_, i64>(4)? as u64,
        total_spent: row.get::<_, i64>(5)? as u64,
        current_win_streak: row.get::<_, i64>(6)? as u64,
        best_win_streak: row.get::<_, i64>(7)? as u64,
        first_match_at: row.get(8)?,
        last_match_at: row.get(9)?,
    })
}

impl Store {
    pub async fn record_match_outcome(&self, outcome: &MatchOutcome) -> Result<()> {
        let outcome = outcome.clone();
        self.with_conn(move |conn| apply_match_outcome(conn, &outcome))
            .await
    }

    pub async fn get_player_stats(&self, wallet: &Address) -> Result<Option<PlayerStats>> {
        let wallet = wallet.clone();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT wallet, matches_played, wins, losses, total_earnings, total_spent,
                        current_win_streak, best_win_streak, first_match_at, last_match_at
                 FROM player_stats WHERE wallet = ?1",
                params![wallet.as_str()],
                row_to_stats,
            )
            .optional()
            .map_err(map_err)
        })
        .await
    }

    /// Recompute a wallet's stats row from finished-match history.  Must
    /// yield the same row as incremental `record_match_outcome` calls over
    /// the same history.
    pub async fn rebuild_player_stats(&self, wallet: &Address) -> Result<Option<PlayerStats>> {
        let wallet = wallet.clone();
        self.with_txn(move |txn| {
            let mut stmt = txn
                .prepare(
                    "SELECT m.ended_at, COALESCE(m.winner_id = u.id, 0) AS won, m.payout_amount, m.buy_in
                     FROM matches m
                     JOIN match_players mp ON mp.match_id = m.id
                     JOIN users u ON u.id = mp.user_id
                     WHERE u.wallet = ?1 AND m.status = 'finished'
                     ORDER BY m.ended_at",
                )
                .map_err(map_err)?;
            let history = stmt
                .query_map(params![wallet.as_str()], |row| {
                    Ok((
                        row.get::<_, DateTime<Utc>>(0)?,
                        row.get::<_, bool>(1)?,
                        row.get::<_, Option<i64>>(2)?.unwrap_or(0) as u64,
                        row.get::<_, i64>(3)? as u64,
                    ))
                })
                .map_err(map_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(map_err)?;

            if history.is_empty() {
                return Ok(None);
            }

            let mut stats = PlayerStats {
                wallet: wallet.clone(),
                matches_played: 0,
                wins: 0,
                losses: 0,
                total_earnings: 0,
                total_spent: 0,
                current_win_streak: 0,
                best_win_streak: 0,
                first_match_at: history[0].0,
                last_match_at: history[0].0,
            };
            for (at, won, payout, buy_in) in &history {
                stats.matches_played += 1;
                stats.total_spent += buy_in;
                stats.last_match_at = *at;
                if *won {
                    stats.wins += 1;
                    stats.total_earnings += payout;
                    stats.current_win_streak += 1;
                    stats.best_win_streak = stats.best_win_streak.max(stats.current_win_streak);
                } else {
                    stats.losses += 1;
                    stats.current_win_streak = 0;
                }
            }

            txn.execute(
                "INSERT INTO player_stats (wallet, matches_played, wins, losses, total_earnings,
                                           total_spent, current_win_streak, best_win_streak,
                                           first_match_at, last_match_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(wallet) DO UPDATE SET
                   matches_played = excluded.matches_played,
                   wins = excluded.wins,
                   losses = excluded.losses,
                   total_earnings = excluded.total_earnings,
                   total_spent = excluded.total_spent,
                   current_win_streak = excluded.current_win_streak,
                   best_win_streak = excluded.best_win_streak,
                   first_match_at = excluded.first_match_at,
                   last_match_at = excluded.last_match_at",
                params![
                    stats.wallet.as_str(),
                    stats.matches_played as i64,
                    stats.wins as i64,
                    stats.losses as i64,
                    stats.total_earnings as i64,
                    stats.total_spent as i64,
                    stats.current_win_streak as i64,
                    stats.best_win_streak as i64,
                    stats.first_match_at,
                    stats.last_match_at
                ],
            )
            .map_err(map_err)?;
            Ok(Some(stats))
        })
        .await
    }

    /// Upsert on every successful paid join.
    pub async fn upsert_paid_wallet(&self, wallet: &Address, at: DateTime<Utc>) -> Result<()> {
        let wallet = wallet.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO paid_wallets (wallet, first_payment_at, total_payments, last_payment_at)
                 VALUES (?1, ?2, 1, ?2)
                 ON CONFLICT(wallet) DO UPDATE SET
                   total_payments = total_payments + 1,
                   last_payment_at = ?2",
                params![wallet.as_str(), at],
            )
            .map_err(map_err)?;
            Ok(())
        })
        .await
    }

    pub async fn get_paid_wallet(&self, wallet: &Address) -> Result<Option<PaidWallet>> {
        let wallet = wallet.clone();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT wallet, first_payment_at, total_payments, last_payment_at
                 FROM paid_wallets WHERE wallet = ?1",
                params![wallet.as_str()],
                |row| {
                    Ok(PaidWallet {
                        wallet: Address::from_raw(row.get::<_, String>(0)?),
                        first_payment_at: row.get(1)?,
                        total_payments: row.get::<_, i64>(2)? as u64,
                        last_payment_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(map_err)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet(tail: u8) -> Address {
        Address::parse(&format!("0x{:040x}", tail)).unwrap()
    }

    fn outcome(wallet_tail: u8, won: bool, at: DateTime<Utc>) -> MatchOutcome {
        MatchOutcome {
            wallet: wallet(wallet_tail),
            won,
            earnings: if won { 2_400_000 } else { 0 },
            spent: 1_000_000,
            at,
        }
    }

    #[tokio::test]
    async fn streaks_accumulate_and_reset() {
        let store = Store::try_new_mem().unwrap();
        let t0 = Utc::now();
        for (won, offset) in [(true, 0), (true, 1), (false, 2), (true, 3)] {
            store
                .record_match_outcome(&outcome(1, won, t0 + chrono::Duration::seconds(offset)))
                .await
                .unwrap();
        }
        let stats = store.get_player_stats(&wallet(1)).await.unwrap().unwrap();
        assert_eq!(stats.matches_played, 4);
        assert_eq!(stats.wins, 3);
        assert_eq!(stats.losses, 1);
        assert_eq!(stats.current_win_streak, 1);
        assert_eq!(stats.best_win_streak, 2);
        assert_eq!(stats.total_earnings, 3 * 2_400_000);
        assert_eq!(stats.total_spent, 4 * 1_000_000);
    }

    #[tokio::test]
    async fn rebuild_equals_incrementally_recorded_history() {
        use arena_core::types::TxHash;
        use arena_physics::Role;
        use uuid::Uuid;

        let store = Store::try_new_mem().unwrap();
        store
            .ensure_lobby(1, &wallet(9), "enc")
            .await
            .unwrap();
        let mut users = Vec::new();
        for tail in 1..=3u8 {
            users.push(store.get_or_create_user(&wallet(tail)).await.unwrap());
        }

        // Two finished matches, winners alternating.  The pause keeps
        // ended_at ordering unambiguous for the rebuild.
        for (round, winner_index) in [(0u8, 0usize), (1, 1)] {
            if round > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
            for (i, user) in users.iter().enumerate() {
                store
                    .insert_lobby_player(
                        1,
                        user.id,
                        &TxHash::new(format!("0xdev_r{}_{}", round, i)),
                        600,
                    )
                    .await
                    .unwrap();
            }
            let match_id = Uuid::new_v4();
            let players: Vec<crate::NewMatchPlayer> = users
                .iter()
                .zip(Role::ALL)
                .map(|(user, role)| crate::NewMatchPlayer {
                    user_id: user.id,
                    role,
                    spawn_x: 100.0,
                    spawn_y: 100.0,
                })
                .collect();
            store
                .create_match(
                    &crate::NewMatch {
                        id: match_id,
                        lobby_id: 1,
                        rng_seed: round as u64,
                        buy_in: 1_000_000,
                    },
                    &players,
                )
                .await
                .unwrap();
            store.set_match_running(match_id).await.unwrap();
            let now = Utc::now();
            let outcomes: Vec<MatchOutcome> = users
                .iter()
                .enumerate()
                .map(|(i, user)| MatchOutcome {
                    wallet: user.wallet.clone(),
                    won: i == winner_index,
                    earnings: if i == winner_index { 2_400_000 } else { 0 },
                    spent: 1_000_000,
                    at: now,
                })
                .collect();
            store
                .finish_match(
                    match_id,
                    1,
                    users[winner_index].id,
                    2_400_000,
                    &format!("0xpayout_{}", round),
                    "last_standing",
                    &outcomes,
                    &[],
                )
                .await
                .unwrap();
        }

        for user in &users {
            let incremental = store.get_player_stats(&user.wallet).await.unwrap().unwrap();
            let rebuilt = store
                .rebuild_player_stats(&user.wallet)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(rebuilt.matches_played, incremental.matches_played);
            assert_eq!(rebuilt.wins, incremental.wins);
            assert_eq!(rebuilt.losses, incremental.losses);
            assert_eq!(rebuilt.total_earnings, incremental.total_earnings);
            assert_eq!(rebuilt.total_spent, incremental.total_spent);
            assert_eq!(rebuilt.current_win_streak, incremental.current_win_streak);
            assert_eq!(rebuilt.best_win_streak, incremental.best_win_streak);
        }
    }

    #[tokio::test]
    async fn paid_wallet_counts_payments() {
        let store = Store::try_new_mem().unwrap();
        let t0 = Utc::now();
        store.upsert_paid_wallet(&wallet(1), t0).await.unwrap();
        store
            .upsert_paid_wallet(&wallet(1), t0 + chrono::Duration::seconds(5))
            .await
            .unwrap();
        let paid = store.get_paid_wallet(&wallet(1)).await.unwrap().unwrap();
        assert_eq!(paid.total_payments, 2);
        assert_eq!(paid.first_payment_at, t0);
        assert!(paid.last_payment_at > t0);
    }
}
