//! Typed mutations and their commutativity rules.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core_encoding::Float;

use super::error::ConsensusError;
use super::value::Value;

/// Operation codes understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpCode {
    /// Replace the value.
    Set,
    /// Append raw bytes to the value.
    Concat,
    /// Add a decimal to the value.
    Add,
    /// Multiply the value by a decimal.
    Mul,
    /// Insert an element into a set.
    SAdd,
    /// Remove an element from a set.
    SRem,
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpCode::Set => "SET",
            OpCode::Concat => "CONCAT",
            OpCode::Add => "ADD",
            OpCode::Mul => "MUL",
            OpCode::SAdd => "SADD",
            OpCode::SRem => "SREM",
        };
        write!(f, "{name}")
    }
}

/// A single deterministic mutation of one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub key: String,
    pub op: OpCode,
    pub data: Vec<u8>,
}

impl Operation {
    pub fn new(key: &str, op: OpCode, data: &[u8]) -> Self {
        Operation {
            key: key.to_string(),
            op,
            data: data.to_vec(),
        }
    }

    /// Whether two operations cannot be executed in parallel.
    ///
    /// Operations on different keys always commute. On the same key, the
    /// commutative pairs are: identical SET/SET, ADD/ADD, MUL/MUL,
    /// SADD/SADD, SREM/SREM, and SADD/SREM over distinct elements.
    pub fn conflicts_with(&self, other: &Operation) -> bool {
        if self.key != other.key {
            return false;
        }

        match (self.op, other.op) {
            (OpCode::Set, OpCode::Set) => self.data != other.data,
            (OpCode::Add, OpCode::Add) => false,
            (OpCode::Mul, OpCode::Mul) => false,
            (OpCode::SAdd, OpCode::SAdd) => false,
            (OpCode::SRem, OpCode::SRem) => false,
            (OpCode::SAdd, OpCode::SRem) | (OpCode::SRem, OpCode::SAdd) => {
                self.data == other.data
            }
            _ => true,
        }
    }

    /// Run the operation against the current value, in place.
    ///
    /// The raw bytes of the value stay canonical for the next operation.
    pub fn exec(&self, current: &mut Value) -> Result<(), ConsensusError> {
        match self.op {
            OpCode::Set => {
                current.replace(self.data.clone());
            }
            OpCode::Concat => {
                current.concat(&self.data);
            }
            OpCode::Add | OpCode::Mul => {
                let operand = Float::from_bytes(&self.data)?;
                let stored = current.float()?;
                let result = if self.op == OpCode::Add {
                    operand.add(stored)
                } else {
                    operand.mul(stored)
                };
                current.store_float(result);
            }
            OpCode::SAdd => {
                current.set()?.add(&self.data)?;
                current.sync_set();
            }
            OpCode::SRem => {
                current.set()?.remove(&self.data)?;
                current.sync_set();
            }
        }
        Ok(())
    }
}
