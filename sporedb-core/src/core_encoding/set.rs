//! Hash sets with a deterministic byte layout.

use std::collections::HashMap;

use super::{bytes_to_u64, u64_to_bytes, EncodingError};

/// A hash set with a canonical binary form.
///
/// The marshalled layout is `[length u64 LE || element]*` in insertion
/// order. Each element's byte offset is kept in an index map, giving O(1)
/// membership and insertion and O(n) deletion.
///
/// Not thread-safe; values are confined to a single transaction.
#[derive(Debug, Clone, Default)]
pub struct Set {
    elements: HashMap<Vec<u8>, usize>,
    raw: Vec<u8>,
}

impl Set {
    pub fn new() -> Self {
        Set::default()
    }

    /// Parse a canonical representation, validating its framing.
    pub fn from_bytes(data: &[u8]) -> Result<Self, EncodingError> {
        let mut elements = HashMap::new();
        let len = data.len();

        let mut i = 0;
        while i < len {
            if i + 8 > len {
                return Err(EncodingError::InvalidSet);
            }

            let element_len = bytes_to_u64(&data[i..i + 8]) as usize;
            if i + 8 + element_len > len {
                return Err(EncodingError::InvalidSet);
            }

            elements.insert(data[i + 8..i + 8 + element_len].to_vec(), i);
            i += 8 + element_len;
        }

        Ok(Set {
            elements,
            raw: data.to_vec(),
        })
    }

    /// The exact raw buffer, without any re-sort.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.raw.clone()
    }

    /// O(1) membership check. Empty elements are never members.
    pub fn contains(&self, element: &[u8]) -> bool {
        if element.is_empty() {
            return false;
        }
        self.elements.contains_key(element)
    }

    /// Insert an element. Returns whether it was actually inserted;
    /// duplicates are silently ignored.
    pub fn add(&mut self, element: &[u8]) -> Result<bool, EncodingError> {
        if element.is_empty() {
            return Err(EncodingError::EmptyElement);
        }

        if self.elements.contains_key(element) {
            return Ok(false);
        }

        self.elements.insert(element.to_vec(), self.raw.len());
        self.raw.extend_from_slice(&u64_to_bytes(element.len() as u64));
        self.raw.extend_from_slice(element);
        Ok(true)
    }

    /// Remove an element, shifting the offsets of everything stored after
    /// it. Returns whether it was present.
    pub fn remove(&mut self, element: &[u8]) -> Result<bool, EncodingError> {
        if element.is_empty() {
            return Err(EncodingError::EmptyElement);
        }

        let record_len = element.len() + 8;
        let offset = match self.elements.remove(element) {
            Some(offset) => offset,
            None => return Ok(false),
        };

        self.raw.drain(offset..offset + record_len);

        for position in self.elements.values_mut() {
            if *position > offset {
                *position -= record_len;
            }
        }

        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Enumerate the elements in marshalled (insertion) order.
    pub fn elements(&self) -> Vec<&[u8]> {
        let mut ordered: Vec<(&usize, &Vec<u8>)> =
            self.elements.iter().map(|(e, p)| (p, e)).collect();
        ordered.sort_by_key(|(p, _)| **p);
        ordered.into_iter().map(|(_, e)| e.as_slice()).collect()
    }
}
