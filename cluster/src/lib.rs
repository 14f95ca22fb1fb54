pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod raft;
pub mod server;
pub mod supervisor;
pub mod topology;
pub mod transport;
