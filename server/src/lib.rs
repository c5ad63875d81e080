pub mod alerts;
pub mod auth;
pub mod bots;
pub mod component;
pub mod connection;
pub mod context;
pub mod frame;
pub mod gateway;
pub mod http;
pub mod lobby;
pub mod match_manager;
pub mod match_runner;
pub mod match_state;
pub mod rate_limit;
pub mod recovery;
pub mod session;
pub mod settlement;
