//! Data model, persistent store, repositories, allocator, and lease
//! state machine for ignite's DHCP + PXE dispatch engine.
pub mod allocator;
pub mod error;
pub mod metrics;
pub mod model;
pub mod repo;
pub mod state_machine;
pub mod store;

pub use error::{IgniteError, Result};
pub use model::{
    BootMenu, Ipmi, IpmiInput, Lease, LeaseState, MacAddr, Server, ServerOptions, Source,
    StateTransition, TemplateType,
};
pub use repo::{KvLeaseRepo, KvServerRepo, LeaseRepository, MemLeaseRepo, MemServerRepo, ServerRepository};
pub use store::Db;
