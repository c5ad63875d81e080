//! Configuration of the application.
//!
//! Everything comes from environment variables prefixed `ARENA_`.  Missing
//! required secrets are a startup fault: the process reports them all and
//! exits with code 1.

mod config;

pub use config::{
    AlertConfig, ChainConfig, Config, ConfigError, GameConfig, NetConfig, StorageConfig,
    WalletConfig,
};
