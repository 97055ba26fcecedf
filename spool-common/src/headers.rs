//! Request header set
//!
//! Values are stored percent-encoded and exposed decoded. Only RFC 3986
//! unreserved characters are left literal, so any printable value survives
//! the trip into a raw header line.
//!
//! The set keeps a dirty flag instead of rebuilding the engine's header list on
//! every change; the list handed to the engine is only replaced when a transfer
//! starts.

use std::collections::BTreeMap;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};

/// Characters escaped in header values (everything except unreserved)
const HEADER_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Header name to raw (encoded) value, ordered by name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: BTreeMap<String, String>,
    dirty: bool,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoded value of a header
    pub fn get(&self, name: &str) -> Option<String> {
        self.entries
            .get(name)
            .map(|raw| percent_decode_str(raw).decode_utf8_lossy().into_owned())
    }

    /// Set a header from a plain value, percent-encoding it
    pub fn set(&mut self, name: &str, value: &str) {
        let encoded = utf8_percent_encode(value, HEADER_VALUE).to_string();
        self.set_raw(name, &encoded);
    }

    /// Raw value exactly as it will appear in the header line
    pub fn get_raw(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    /// Set an already-encoded value
    pub fn set_raw(&mut self, name: &str, encoded: &str) {
        self.entries.insert(name.to_string(), encoded.to_string());
        self.dirty = true;
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Remove a header; removing an absent header changes nothing
    pub fn remove(&mut self, name: &str) -> bool {
        let removed = self.entries.remove(name).is_some();
        if removed {
            self.dirty = true;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the header list must be rebuilt before the next start
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Force a rebuild of the header list at the next start
    pub fn touch(&mut self) {
        self.dirty = true;
    }

    /// Header lines in engine format, ordered by name
    pub fn to_lines(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(name, value)| format!("{name}: {value}"))
            .collect()
    }

    /// Build the header lines if the set changed since the last call
    ///
    /// Returns `None` when the previously built list is still current.
    pub fn take_lines(&mut self) -> Option<Vec<String>> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(self.to_lines())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
