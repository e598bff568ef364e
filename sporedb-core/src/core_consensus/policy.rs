//! Per-namespace rules governing operations and endorsements.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::error::ConsensusError;
use super::operation::{OpCode, Operation};

/// Keys reserved for engine bookkeeping.
pub const INTERNAL_KEY_PREFIX: &str = "__internal";

/// Prefix of the per-policy usage counters.
pub const POLICY_SIZE_KEY_PREFIX: &str = "__internal/size";

/// An identity allowed to endorse spores under a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endorser {
    /// Raw Ed25519 public key.
    #[serde(with = "base64_bytes")]
    pub public: Vec<u8>,
    /// Free-form display comment.
    #[serde(default)]
    pub comment: String,
}

/// Key selector of an operation spec: a literal name or a regular
/// expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySelector {
    Name(String),
    Pattern(String),
}

/// One key-pattern rule of a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSpec {
    pub key: KeySelector,
    /// Allowed operation codes. Empty allows everything.
    #[serde(default)]
    pub allowed_operations: Vec<OpCode>,
}

impl OperationSpec {
    fn check_op(&self, operation: &Operation) -> Result<(), ConsensusError> {
        if self.allowed_operations.is_empty() {
            return Ok(()); // everything is allowed
        }

        if self.allowed_operations.contains(&operation.op) {
            return Ok(());
        }

        Err(ConsensusError::OpNotAllowed)
    }
}

/// Per-namespace policy, loaded from JSON at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub uuid: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub endorsers: Vec<Endorser>,
    /// Minimum endorsement count to apply. Zero applies immediately
    /// without consensus, one is local-only.
    #[serde(default)]
    pub quorum: u64,
    pub specs: Vec<OperationSpec>,
    /// Maximum simulated size of one operation result, zero = unlimited.
    #[serde(default)]
    pub max_op_size: u64,
    /// Maximum total size usable under this policy, zero = unlimited.
    #[serde(default)]
    pub max_size: u64,
    /// Window after a spore's deadline during which its re-application is
    /// still refused.
    #[serde(default, with = "humantime_serde")]
    pub grace_period: Duration,
}

impl Policy {
    /// A basic allow-everything policy for testing and development.
    pub fn none() -> Policy {
        Policy {
            uuid: "none".to_string(),
            comment: "Allows everything on every key. Should only be used for testing purposes."
                .to_string(),
            endorsers: Vec::new(),
            quorum: 0,
            specs: vec![OperationSpec {
                key: KeySelector::Pattern(".*".to_string()),
                allowed_operations: Vec::new(),
            }],
            max_op_size: 0,
            max_size: 0,
            grace_period: Duration::ZERO,
        }
    }

    /// The endorser entry matching the provided public key, byte-exact.
    pub fn endorser_for(&self, public: &[u8]) -> Option<&Endorser> {
        self.endorsers.iter().find(|e| e.public == public)
    }

    /// The store key of this policy's usage counter.
    pub fn usage_key(&self) -> String {
        format!("{}/{}", POLICY_SIZE_KEY_PREFIX, self.uuid)
    }

    /// Compile the key selectors for evaluation.
    pub fn compile(self) -> Result<CompiledPolicy, ConsensusError> {
        let mut matchers = Vec::with_capacity(self.specs.len());

        for spec in &self.specs {
            let matcher = match &spec.key {
                KeySelector::Name(name) => {
                    if name.is_empty() {
                        return Err(ConsensusError::InvalidPolicySpec(
                            "empty key name".to_string(),
                        ));
                    }
                    KeyMatcher::Exact(name.clone())
                }
                KeySelector::Pattern(pattern) => KeyMatcher::Regex(
                    Regex::new(pattern)
                        .map_err(|e| ConsensusError::InvalidPolicySpec(e.to_string()))?,
                ),
            };
            matchers.push(matcher);
        }

        Ok(CompiledPolicy {
            policy: self,
            matchers,
        })
    }
}

enum KeyMatcher {
    Exact(String),
    Regex(Regex),
}

impl KeyMatcher {
    fn matches(&self, key: &str) -> bool {
        match self {
            KeyMatcher::Exact(name) => name == key,
            KeyMatcher::Regex(regex) => regex.is_match(key),
        }
    }
}

/// A policy with its key selectors compiled, ready for evaluation.
pub struct CompiledPolicy {
    pub policy: Policy,
    matchers: Vec<KeyMatcher>,
}

impl CompiledPolicy {
    /// Check one operation given the byte length of its simulation.
    pub fn check_operation(
        &self,
        operation: &Operation,
        simulated_len: u64,
    ) -> Result<(), ConsensusError> {
        if operation.key.starts_with(INTERNAL_KEY_PREFIX) {
            return Err(ConsensusError::OpSystemKey);
        }

        if self.policy.max_op_size > 0 && simulated_len > self.policy.max_op_size {
            return Err(ConsensusError::OpTooLarge);
        }

        let mut valid = false;
        for (i, spec) in self.policy.specs.iter().enumerate() {
            if self.matchers[i].matches(&operation.key) {
                spec.check_op(operation)?;
                valid = true;
            }
        }

        if !valid {
            return Err(ConsensusError::OpDisabledKey);
        }
        Ok(())
    }
}

/// Load every `*.json` policy of a directory.
pub fn load_policies(dir: &Path) -> Result<Vec<Policy>, ConsensusError> {
    let mut policies = Vec::new();

    let entries = std::fs::read_dir(dir)
        .map_err(|e| ConsensusError::InvalidPolicySpec(format!("{}: {e}", dir.display())))?;

    for entry in entries {
        let entry =
            entry.map_err(|e| ConsensusError::InvalidPolicySpec(e.to_string()))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        let raw = std::fs::read_to_string(&path)
            .map_err(|e| ConsensusError::InvalidPolicySpec(format!("{}: {e}", path.display())))?;
        let policy: Policy = serde_json::from_str(&raw)
            .map_err(|e| ConsensusError::InvalidPolicySpec(format!("{}: {e}", path.display())))?;
        policies.push(policy);
    }

    Ok(policies)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn restricted_policy() -> CompiledPolicy {
        Policy {
            uuid: "bank".to_string(),
            comment: String::new(),
            endorsers: Vec::new(),
            quorum: 2,
            specs: vec![
                OperationSpec {
                    key: KeySelector::Name("balance".to_string()),
                    allowed_operations: vec![OpCode::Add],
                },
                OperationSpec {
                    key: KeySelector::Pattern("^member/".to_string()),
                    allowed_operations: vec![OpCode::SAdd, OpCode::SRem],
                },
            ],
            max_op_size: 64,
            max_size: 0,
            grace_period: Duration::ZERO,
        }
        .compile()
        .unwrap()
    }

    #[test]
    fn test_allowed_operation_passes() {
        let policy = restricted_policy();
        let op = Operation::new("balance", OpCode::Add, b"5");
        assert!(policy.check_operation(&op, 10).is_ok());
    }

    #[test]
    fn test_disallowed_operation_rejected() {
        let policy = restricted_policy();
        let op = Operation::new("balance", OpCode::Set, b"5");
        assert!(matches!(
            policy.check_operation(&op, 10),
            Err(ConsensusError::OpNotAllowed)
        ));
    }

    #[test]
    fn test_unmatched_key_rejected() {
        let policy = restricted_policy();
        let op = Operation::new("other", OpCode::Add, b"5");
        assert!(matches!(
            policy.check_operation(&op, 10),
            Err(ConsensusError::OpDisabledKey)
        ));
    }

    #[test]
    fn test_pattern_selector() {
        let policy = restricted_policy();
        let op = Operation::new("member/alice", OpCode::SAdd, b"x");
        assert!(policy.check_operation(&op, 10).is_ok());

        let op = Operation::new("member/alice", OpCode::Concat, b"x");
        assert!(matches!(
            policy.check_operation(&op, 10),
            Err(ConsensusError::OpNotAllowed)
        ));
    }

    #[test]
    fn test_internal_key_reserved() {
        let policy = Policy::none().compile().unwrap();
        let op = Operation::new("__internal/size/none", OpCode::Set, b"0");
        assert!(matches!(
            policy.check_operation(&op, 1),
            Err(ConsensusError::OpSystemKey)
        ));
    }

    #[test]
    fn test_op_size_quota() {
        let policy = restricted_policy();
        let op = Operation::new("balance", OpCode::Add, b"5");
        assert!(matches!(
            policy.check_operation(&op, 65),
            Err(ConsensusError::OpTooLarge)
        ));
        assert!(policy.check_operation(&op, 64).is_ok());
    }

    #[test]
    fn test_none_policy_allows_everything() {
        let policy = Policy::none().compile().unwrap();
        for code in [
            OpCode::Set,
            OpCode::Concat,
            OpCode::Add,
            OpCode::Mul,
            OpCode::SAdd,
            OpCode::SRem,
        ] {
            let op = Operation::new("any-key", code, b"data");
            assert!(policy.check_operation(&op, 1 << 20).is_ok());
        }
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let policy = Policy {
            specs: vec![OperationSpec {
                key: KeySelector::Pattern("([invalid".to_string()),
                allowed_operations: Vec::new(),
            }],
            ..Policy::none()
        };
        assert!(policy.compile().is_err());
    }

    #[test]
    fn test_endorser_membership_is_byte_exact() {
        let mut policy = Policy::none();
        policy.endorsers.push(Endorser {
            public: vec![1u8; 32],
            comment: "alice".to_string(),
        });

        assert!(policy.endorser_for(&[1u8; 32]).is_some());
        assert!(policy.endorser_for(&[2u8; 32]).is_none());
    }

    #[test]
    fn test_policy_json_round_trip() {
        let policy = Policy {
            uuid: "demo".to_string(),
            comment: "demo policy".to_string(),
            endorsers: vec![Endorser {
                public: vec![7u8; 32],
                comment: "bob".to_string(),
            }],
            quorum: 2,
            specs: vec![OperationSpec {
                key: KeySelector::Name("counter".to_string()),
                allowed_operations: vec![OpCode::Add, OpCode::Mul],
            }],
            max_op_size: 128,
            max_size: 4096,
            grace_period: Duration::from_secs(10),
        };

        let json = serde_json::to_string_pretty(&policy).unwrap();
        let parsed: Policy = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, policy);
    }

    #[test]
    fn test_load_policies_directory() {
        let dir = tempfile::tempdir().unwrap();
        let policy = Policy::none();
        std::fs::write(
            dir.path().join("none.json"),
            serde_json::to_string(&policy).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "not a policy").unwrap();

        let loaded = load_policies(dir.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].uuid, "none");
    }
}
