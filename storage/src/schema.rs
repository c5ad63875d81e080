//! Table definitions.

use rusqlite::Connection;

use arena_core::error::Result;

use crate::map_err;

pub fn init_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
           id TEXT PRIMARY KEY,
           wallet TEXT NOT NULL UNIQUE,
           display_name TEXT,
           created_at TEXT NOT NULL
         );

         CREATE TABLE IF NOT EXISTS sessions (
           id TEXT PRIMARY KEY,
           user_id TEXT NOT NULL REFERENCES users(id),
           token TEXT NOT NULL UNIQUE,
           expires_at TEXT NOT NULL
         );

         CREATE TABLE IF NOT EXISTS lobbies (
           id INTEGER PRIMARY KEY,
           status TEXT NOT NULL DEFAULT 'empty',
           deposit_address TEXT NOT NULL,
           encrypted_deposit_key TEXT NOT NULL,
           first_join_at TEXT,
           timeout_at TEXT,
           current_match_id TEXT
         );

         CREATE TABLE IF NOT EXISTS lobby_players (
           id TEXT PRIMARY KEY,
           lobby_id INTEGER NOT NULL REFERENCES lobbies(id),
           user_id TEXT NOT NULL REFERENCES users(id),
           payment_tx_hash TEXT NOT NULL UNIQUE,
           joined_at TEXT NOT NULL,
           refunded_at TEXT,
           refund_reason TEXT,
           refund_tx_hash TEXT
         );
         CREATE INDEX IF NOT EXISTS idx_lobby_players_lobby
           ON lobby_players(lobby_id) WHERE refunded_at IS NULL;
         CREATE INDEX IF NOT EXISTS idx_lobby_players_user
           ON lobby_players(user_id) WHERE refunded_at IS NULL;

         CREATE TABLE IF NOT EXISTS matches (
           id TEXT PRIMARY KEY,
           lobby_id INTEGER NOT NULL REFERENCES lobbies(id),
           status TEXT NOT NULL,
           rng_seed INTEGER NOT NULL,
           buy_in INTEGER NOT NULL,
           countdown_at TEXT NOT NULL,
           running_at TEXT,
           ended_at TEXT,
           end_reason TEXT,
           winner_id TEXT,
           payout_amount INTEGER,
           payout_tx_hash TEXT
         );
         CREATE INDEX IF NOT EXISTS idx_matches_status ON matches(status);

         CREATE TABLE IF NOT EXISTS match_players (
           match_id TEXT NOT NULL REFERENCES matches(id),
           user_id TEXT NOT NULL REFERENCES users(id),
           role TEXT NOT NULL,
           spawn_x REAL NOT NULL,
           spawn_y REAL NOT NULL,
           eliminated_at TEXT,
           eliminated_by TEXT,
           final_x REAL,
           final_y REAL,
           PRIMARY KEY (match_id, user_id)
         );

         CREATE TABLE IF NOT EXISTS match_events (
           id INTEGER PRIMARY KEY AUTOINCREMENT,
           match_id TEXT NOT NULL REFERENCES matches(id),
           tick INTEGER NOT NULL,
           event_type TEXT NOT NULL,
           payload TEXT NOT NULL,
           created_at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_match_events_match ON match_events(match_id);

         CREATE TABLE IF NOT EXISTS match_state (
           match_id TEXT PRIMARY KEY REFERENCES matches(id),
           version INTEGER NOT NULL,
           tick INTEGER NOT NULL,
           status TEXT NOT NULL,
           state_json TEXT NOT NULL,
           updated_at TEXT NOT NULL
         );

         CREATE TABLE IF NOT EXISTS payout_attempts (
           id TEXT PRIMARY KEY,
           match_id TEXT NOT NULL,
           lobby_id INTEGER NOT NULL,
           recipient TEXT NOT NULL,
           amount INTEGER NOT NULL,
           attempt_number INTEGER NOT NULL,
           status TEXT NOT NULL,
           source_wallet TEXT NOT NULL,
           tx_hash TEXT,
           error TEXT,
           error_type TEXT,
           created_at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_payout_attempts_match ON payout_attempts(match_id);

         CREATE TABLE IF NOT EXISTS player_stats (
           wallet TEXT PRIMARY KEY,
           matches_played INTEGER NOT NULL DEFAULT 0,
           wins INTEGER NOT NULL DEFAULT 0,
           losses INTEGER NOT NULL DEFAULT 0,
           total_earnings INTEGER NOT NULL DEFAULT 0,
           total_spent INTEGER NOT NULL DEFAULT 0,
           current_win_streak INTEGER NOT NULL DEFAULT 0,
           best_win_streak INTEGER NOT NULL DEFAULT 0,
           first_match_at TEXT NOT NULL,
           last_match_at TEXT NOT NULL
         );

         CREATE TABLE IF NOT EXISTS paid_wallets (
           wallet TEXT PRIMARY KEY,
           first_payment_at TEXT NOT NULL,
           total_payments INTEGER NOT NULL DEFAULT 0,
           last_payment_at TEXT NOT NULL
         );",
    )
    .map_err(map_err)
}
