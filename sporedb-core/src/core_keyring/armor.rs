//! Armored block encoding for keyring files.
//!
//! Keyring material is stored as a sequence of text blocks, each carrying
//! a type, optional headers and a base64 payload:
//!
//! ```text
//! -----BEGIN SPOREDB PUBLIC KEY-----
//! identity: alice
//! trust: high
//!
//! eyJwdWJsaWMiOiAi...
//! -----END SPOREDB PUBLIC KEY-----
//! ```

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use super::KeyRingError;

pub const PUBLIC_BLOCK_TYPE: &str = "SPOREDB PUBLIC KEY";
pub const PRIVATE_BLOCK_TYPE: &str = "SPOREDB PRIVATE KEY";

const LINE_WIDTH: usize = 64;

/// One armored block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub block_type: String,
    pub headers: Vec<(String, String)>,
    pub data: Vec<u8>,
}

impl Block {
    pub fn new(block_type: &str, data: Vec<u8>) -> Self {
        Block {
            block_type: block_type.to_string(),
            headers: Vec::new(),
            data,
        }
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.push((key.to_string(), value.to_string()));
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Render the block as armored text.
    pub fn encode(&self) -> String {
        let mut out = format!("-----BEGIN {}-----\n", self.block_type);

        for (key, value) in &self.headers {
            out.push_str(&format!("{key}: {value}\n"));
        }
        if !self.headers.is_empty() {
            out.push('\n');
        }

        let payload = BASE64.encode(&self.data);
        for chunk in payload.as_bytes().chunks(LINE_WIDTH) {
            out.push_str(std::str::from_utf8(chunk).expect("base64 is ascii"));
            out.push('\n');
        }

        out.push_str(&format!("-----END {}-----\n", self.block_type));
        out
    }
}

/// Decode the first block of the input, returning it together with the
/// remaining text. Returns `Ok(None)` when no block remains.
pub fn decode_block(input: &str) -> Result<Option<(Block, &str)>, KeyRingError> {
    let begin = match input.find("-----BEGIN ") {
        Some(pos) => pos,
        None => return Ok(None),
    };

    let after_begin = &input[begin + "-----BEGIN ".len()..];
    let type_end = after_begin
        .find("-----")
        .ok_or_else(|| KeyRingError::Armor("unterminated BEGIN line".to_string()))?;
    let block_type = after_begin[..type_end].to_string();

    let body_start = after_begin[type_end..]
        .find('\n')
        .map(|p| type_end + p + 1)
        .ok_or_else(|| KeyRingError::Armor("missing block body".to_string()))?;
    let body = &after_begin[body_start..];

    let end_marker = format!("-----END {}-----", block_type);
    let end = body
        .find(&end_marker)
        .ok_or_else(|| KeyRingError::Armor(format!("missing {end_marker}")))?;

    let mut headers = Vec::new();
    let mut payload = String::new();

    for line in body[..end].lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once(": ") {
            if payload.is_empty() {
                headers.push((key.to_string(), value.to_string()));
                continue;
            }
        }
        payload.push_str(line);
    }

    let data = BASE64
        .decode(payload.trim())
        .map_err(|e| KeyRingError::Armor(format!("invalid base64 payload: {e}")))?;

    let rest = &body[end + end_marker.len()..];
    Ok(Some((
        Block {
            block_type,
            headers,
            data,
        },
        rest,
    )))
}
