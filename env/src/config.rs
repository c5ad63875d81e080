use std::collections::HashMap;
use std::str::FromStr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required variable(s): {0}")]
    MissingRequired(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone)]
pub struct NetConfig {
    pub public_port: u16,
    pub admin_port: u16,
    pub max_connections_per_ip: usize,
    pub ping_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct GameConfig {
    pub lobby_count: u32,
    pub arena_width: f64,
    pub arena_height: f64,
    pub tick_rate: u32,
    pub player_radius: f64,
    pub max_speed: f64,
    pub countdown_secs: u64,
    pub reconnect_grace_secs: u64,
    pub lobby_timeout_secs: u64,
    pub snapshot_rate: u32,
    pub persistence_interval_ticks: u64,
    pub showdown_hearts_to_win: u8,
    pub showdown_freeze_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub rpc_fallback_urls: Vec<String>,
    pub token_address: String,
    pub min_confirmations: u64,
    pub max_tx_age_secs: u64,
    pub reconcile_lookback_blocks: u64,
    pub low_gas_threshold: u64,
}

#[derive(Debug, Clone)]
pub struct WalletConfig {
    pub buy_in: u64,
    pub winner_payout: u64,
    pub treasury_cut: u64,
    pub lobby_wallet_seed: String,
    pub wallet_encryption_key: String,
    pub treasury_mnemonic: String,
}

#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub webhook_urls: Vec<String>,
    pub sentry_dsn: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub database_path: String,
    pub backup_dir: String,
    pub wal_checkpoint_mins: u64,
    pub log_dir: String,
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub net: NetConfig,
    pub game: GameConfig,
    pub chain: ChainConfig,
    pub wallet: WalletConfig,
    pub alert: AlertConfig,
    pub storage: StorageConfig,
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_lookup(&vars)
    }

    /// Build from an explicit variable map; `from_env` delegates here and
    /// tests feed maps directly.
    pub fn from_lookup(vars: &HashMap<String, String>) -> Result<Config, ConfigError> {
        let mut missing: Vec<&str> = Vec::new();
        for key in [
            "ARENA_RPC_URL",
            "ARENA_TOKEN_ADDRESS",
            "ARENA_LOBBY_WALLET_SEED",
            "ARENA_WALLET_ENC_KEY",
            "ARENA_TREASURY_MNEMONIC",
        ] {
            if vars.get(key).map(|v| v.trim().is_empty()).unwrap_or(true) {
                missing.push(key);
            }
        }
        if !missing.is_empty() {
            return Err(ConfigError::MissingRequired(missing.join(", ")));
        }

        Ok(Config {
            net: NetConfig {
                public_port: parse_or(vars, "ARENA_PUBLIC_PORT", 8080)?,
                admin_port: parse_or(vars, "ARENA_ADMIN_PORT", 8081)?,
                max_connections_per_ip: parse_or(vars, "ARENA_MAX_CONNECTIONS_PER_IP", 3)?,
                ping_interval_secs: parse_or(vars, "ARENA_PING_INTERVAL_SECS", 5)?,
            },
            game: GameConfig {
                lobby_count: parse_or(vars, "ARENA_LOBBY_COUNT", 4)?,
                arena_width: parse_or(vars, "ARENA_ARENA_WIDTH", 1600.0)?,
                arena_height: parse_or(vars, "ARENA_ARENA_HEIGHT", 900.0)?,
                tick_rate: parse_or(vars, "ARENA_TICK_RATE", 30)?,
                player_radius: parse_or(vars, "ARENA_PLAYER_RADIUS", 22.0)?,
                max_speed: parse_or(vars, "ARENA_MAX_SPEED", 450.0)?,
                countdown_secs: parse_or(vars, "ARENA_COUNTDOWN_SECS", 3)?,
                reconnect_grace_secs: parse_or(vars, "ARENA_RECONNECT_GRACE_SECS", 30)?,
                lobby_timeout_secs: parse_or(vars, "ARENA_LOBBY_TIMEOUT_SECS", 600)?,
                snapshot_rate: parse_or(vars, "ARENA_SNAPSHOT_RATE", 30)?,
                persistence_interval_ticks: parse_or(vars, "ARENA_PERSISTENCE_INTERVAL", 5)?,
                showdown_hearts_to_win: parse_or(vars, "ARENA_SHOWDOWN_HEARTS_TO_WIN", 2)?,
                showdown_freeze_secs: parse_or(vars, "ARENA_SHOWDOWN_FREEZE_SECS", 3)?,
            },
            chain: ChainConfig {
                rpc_url: required(vars, "ARENA_RPC_URL"),
                rpc_fallback_urls: list(vars, "ARENA_RPC_FALLBACK_URLS"),
                token_address: required(vars, "ARENA_TOKEN_ADDRESS"),
                min_confirmations: parse_or(vars, "ARENA_MIN_CONFIRMATIONS", 3)?,
                max_tx_age_secs: parse_or(vars, "ARENA_MAX_TX_AGE_SECS", 3600)?,
                reconcile_lookback_blocks: parse_or(vars, "ARENA_RECONCILE_LOOKBACK_BLOCKS", 5000)?,
                low_gas_threshold: parse_or(vars, "ARENA_LOW_GAS_THRESHOLD", 10_000_000)?,
            },
            wallet: WalletConfig {
                buy_in: parse_or(vars, "ARENA_BUY_IN", 1_000_000)?,
                winner_payout: parse_or(vars, "ARENA_WINNER_PAYOUT", 2_400_000)?,
                treasury_cut: parse_or(vars, "ARENA_TREASURY_CUT", 600_000)?,
                lobby_wallet_seed: required(vars, "ARENA_LOBBY_WALLET_SEED"),
                wallet_encryption_key: required(vars, "ARENA_WALLET_ENC_KEY"),
                treasury_mnemonic: required(vars, "ARENA_TREASURY_MNEMONIC"),
            },
            alert: AlertConfig {
                webhook_urls: list(vars, "ARENA_ALERT_WEBHOOK_URLS"),
                sentry_dsn: vars.get("ARENA_SENTRY_DSN").cloned().filter(|v| !v.is_empty()),
            },
            storage: StorageConfig {
                database_path: or(vars, "ARENA_DATABASE_PATH", "arena.db"),
                backup_dir: or(vars, "ARENA_BACKUP_DIR", "backups"),
                wal_checkpoint_mins: parse_or(vars, "ARENA_WAL_CHECKPOINT_MINS", 5)?,
                log_dir: or(vars, "ARENA_LOG_DIR", "logs"),
                log_level: or(vars, "ARENA_LOG_LEVEL", "info"),
            },
        })
    }
}

fn required(vars: &HashMap<String, String>, key: &str) -> String {
    // Presence was checked up front.
    vars.get(key).cloned().unwrap_or_default()
}

fn or(vars: &HashMap<String, String>, key: &str, default: &str) -> String {
    match vars.get(key) {
        Some(v) if !v.trim().is_empty() => v.clone(),
        _ => default.to_string(),
    }
}

fn list(vars: &HashMap<String, String>, key: &str) -> Vec<String> {
    vars.get(key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_or<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
{
    match vars.get(key) {
        Some(v) if !v.trim().is_empty() => {
            v.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: v.clone(),
            })
        }
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<String, String> {
        [
            ("ARENA_RPC_URL", "http://localhost:8545"),
            ("ARENA_TOKEN_ADDRESS", "0x00000000000000000000000000000000000000aa"),
            ("ARENA_LOBBY_WALLET_SEED", "test seed"),
            ("ARENA_WALLET_ENC_KEY", "test key"),
            ("ARENA_TREASURY_MNEMONIC", "test mnemonic"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn defaults_apply() {
        let config = Config::from_lookup(&base_vars()).unwrap();
        assert_eq!(config.net.public_port, 8080);
        assert_eq!(config.net.admin_port, 8081);
        assert_eq!(config.game.tick_rate, 30);
        assert_eq!(config.game.lobby_timeout_secs, 600);
        assert_eq!(config.wallet.buy_in, 1_000_000);
        assert_eq!(config.wallet.winner_payout, 2_400_000);
        assert_eq!(config.chain.min_confirmations, 3);
        assert!(config.chain.rpc_fallback_urls.is_empty());
    }

    #[test]
    fn missing_secrets_are_reported_together() {
        let mut vars = base_vars();
        vars.remove("ARENA_LOBBY_WALLET_SEED");
        vars.insert("ARENA_TREASURY_MNEMONIC".into(), "".into());
        let err = Config::from_lookup(&vars).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("ARENA_LOBBY_WALLET_SEED"));
        assert!(msg.contains("ARENA_TREASURY_MNEMONIC"));
    }

    #[test]
    fn fallback_urls_parse_as_list() {
        let mut vars = base_vars();
        vars.insert(
            "ARENA_RPC_FALLBACK_URLS".into(),
            "http://a:1, http://b:2 ,".into(),
        );
        let config = Config::from_lookup(&vars).unwrap();
        assert_eq!(config.chain.rpc_fallback_urls, vec!["http://a:1", "http://b:2"]);
    }

    #[test]
    fn invalid_number_is_an_error() {
        let mut vars = base_vars();
        vars.insert("ARENA_TICK_RATE".into(), "fast".into());
        assert!(Config::from_lookup(&vars).is_err());
    }
}
