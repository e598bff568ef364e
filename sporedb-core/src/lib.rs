//! SporeDB core: a decentralized, byzantine-fault-tolerant key-value store.
//!
//! Nodes form an overlay (the "mycelium") in which transactions ("spores")
//! are proposed, endorsed by a quorum of policy-approved peers and committed
//! to a local durable store. Every spore and every endorsement is signed,
//! and a web of trust governs which identities are accepted.

pub mod config;
pub mod logging;
pub mod shutdown;

pub mod core_version;
pub mod core_encoding;
pub mod core_store;
pub mod core_keyring;
pub mod core_consensus;
pub mod core_myc;

pub use config::NodeConfig;
pub use core_consensus::{Engine, EngineMessage, Spore, Operation, OpCode};
pub use core_keyring::{KeyRing, TrustLevel};
pub use core_myc::{Mycelium, MyceliumConfig};
pub use core_store::{SharedStore, SledStore};
pub use core_version::Version;
pub use logging::{init_logging, LogConfig, LogLevel};
pub use shutdown::ShutdownCoordinator;
