//! Document model.
//!
//! A document is an opaque data payload plus the indexed structure derived
//! from it: terms (with within-document positions and frequency) and value
//! slots. Documents serialise to bytes for WAL records and the replication
//! wire.

use meridian_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-term posting data inside one document.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TermEntry {
    /// Within-document positions of the term.
    pub positions: Vec<u32>,
    /// Within-document frequency.
    pub wdf: u32,
}

/// A single indexed document.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Document {
    data: Vec<u8>,
    terms: BTreeMap<String, TermEntry>,
    values: BTreeMap<u32, Vec<u8>>,
}

impl Document {
    /// Create an empty document.
    pub fn new() -> Self {
        Document::default()
    }

    /// Create a document with the given data payload.
    pub fn with_data(data: impl Into<Vec<u8>>) -> Self {
        Document {
            data: data.into(),
            ..Document::default()
        }
    }

    /// Opaque data payload.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Replace the data payload.
    pub fn set_data(&mut self, data: impl Into<Vec<u8>>) {
        self.data = data.into();
    }

    /// Add a term occurrence without a position.
    pub fn add_term(&mut self, term: impl Into<String>) {
        let entry = self.terms.entry(term.into()).or_default();
        entry.wdf += 1;
    }

    /// Add a term occurrence at a position.
    pub fn add_posting(&mut self, term: impl Into<String>, position: u32) {
        let entry = self.terms.entry(term.into()).or_default();
        entry.wdf += 1;
        match entry.positions.binary_search(&position) {
            Ok(_) => {}
            Err(idx) => entry.positions.insert(idx, position),
        }
    }

    /// Iterate the document's terms in order.
    pub fn terms(&self) -> impl Iterator<Item = (&str, &TermEntry)> {
        self.terms.iter().map(|(t, e)| (t.as_str(), e))
    }

    /// Posting entry for a term, if present.
    pub fn term_entry(&self, term: &str) -> Option<&TermEntry> {
        self.terms.get(term)
    }

    /// Total term occurrences (the document length).
    pub fn length(&self) -> u32 {
        self.terms.values().map(|e| e.wdf).sum()
    }

    /// Set a value slot.
    pub fn set_value(&mut self, slot: u32, value: impl Into<Vec<u8>>) {
        self.values.insert(slot, value.into());
    }

    /// Read a value slot.
    pub fn value(&self, slot: u32) -> Option<&[u8]> {
        self.values.get(&slot).map(|v| v.as_slice())
    }

    /// Serialise to bytes for WAL/wire transport.
    pub fn serialise(&self) -> Vec<u8> {
        bincode::serialize(self).expect("document serialisation is infallible")
    }

    /// Reconstruct from serialised bytes.
    pub fn unserialise(bytes: &[u8]) -> Result<Document> {
        bincode::deserialize(bytes).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document() {
        let doc = Document::new();
        assert!(doc.data().is_empty());
        assert_eq!(doc.length(), 0);
        assert_eq!(doc.terms().count(), 0);
    }

    #[test]
    fn test_terms_and_length() {
        let mut doc = Document::with_data("hello world");
        doc.add_posting("hello", 1);
        doc.add_posting("world", 2);
        doc.add_term("world");

        assert_eq!(doc.length(), 3);
        assert_eq!(doc.term_entry("hello").unwrap().positions, vec![1]);
        assert_eq!(doc.term_entry("world").unwrap().wdf, 2);
    }

    #[test]
    fn test_positions_sorted_and_deduped() {
        let mut doc = Document::new();
        doc.add_posting("t", 5);
        doc.add_posting("t", 2);
        doc.add_posting("t", 5);

        assert_eq!(doc.term_entry("t").unwrap().positions, vec![2, 5]);
        assert_eq!(doc.term_entry("t").unwrap().wdf, 3);
    }

    #[test]
    fn test_values() {
        let mut doc = Document::new();
        doc.set_value(0, b"sortkey".to_vec());
        assert_eq!(doc.value(0), Some(&b"sortkey"[..]));
        assert_eq!(doc.value(1), None);
    }

    #[test]
    fn test_serialise_roundtrip() {
        let mut doc = Document::with_data("payload");
        doc.add_posting("alpha", 1);
        doc.set_value(3, b"v".to_vec());

        let bytes = doc.serialise();
        let back = Document::unserialise(&bytes).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_unserialise_garbage() {
        assert!(Document::unserialise(&[0xff, 0xfe, 0xfd]).is_err());
    }
}
