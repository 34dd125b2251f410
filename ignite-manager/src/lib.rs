//! Server lifecycle manager: tracks running `ProtocolHandler`s, persists
//! the `started` flag, and drives the offline sweeper.
pub mod manager;
pub mod sweeper;

pub use manager::ServerManager;
pub use sweeper::spawn_offline_sweeper;
