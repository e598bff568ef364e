//! Consensus and data processing engine.
//!
//! Exposes the spore lifecycle state machine, the policy model deciding
//! which concurrent operations may coexist, and the typed operations
//! executed against stored values.

mod engine;
mod error;
mod operation;
mod policy;
mod spore;
mod value;

#[cfg(test)]
mod tests;

pub use engine::{Engine, EngineMessage};
pub use error::ConsensusError;
pub use operation::{OpCode, Operation};
pub use policy::{
    load_policies, CompiledPolicy, Endorser, KeySelector, OperationSpec, Policy,
    INTERNAL_KEY_PREFIX, POLICY_SIZE_KEY_PREFIX,
};
pub use spore::{Catalog, Endorsement, RecoverRequest, Spore};
pub use value::Value;
