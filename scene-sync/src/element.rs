//! Scene elements and element sets.
//!
//! An [`Element`] is the unit of shared content. The sync engine only looks
//! at three fields:
//!
//! ```text
//! ┌────────────┬──────────────┬───────────────┬──────────────────────┐
//! │ id         │ version      │ versionNonce  │ ...opaque payload    │
//! │ stable key │ monotonic    │ random, fresh │ preserved verbatim   │
//! └────────────┴──────────────┴───────────────┴──────────────────────┘
//! ```
//!
//! Everything else (shape, coordinates, styling) travels in `fields`
//! and is never interpreted here.

use std::collections::btree_map::{self, BTreeMap};
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Stable element identifier, unique within a room.
pub type ElementId = String;

/// A single drawable element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    pub id: ElementId,
    /// Incremented by whichever party mutates the element.
    pub version: u64,
    /// Tiebreaker drawn fresh on every mutation.
    pub version_nonce: u32,
    /// Payload fields, opaque to the engine.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Element {
    /// Create a new element at version 1 with a fresh nonce.
    pub fn new(id: impl Into<ElementId>) -> Self {
        Self {
            id: id.into(),
            version: 1,
            version_nonce: rand::random(),
            fields: Map::new(),
        }
    }

    /// Create with an explicit version and nonce (for replay and testing).
    pub fn with_version(id: impl Into<ElementId>, version: u64, version_nonce: u32) -> Self {
        Self {
            id: id.into(),
            version,
            version_nonce,
            fields: Map::new(),
        }
    }

    /// Builder-style payload setter. Does not bump the version.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Mark the element as mutated: next version, fresh nonce.
    pub fn bump(&mut self) {
        self.version += 1;
        self.version_nonce = rand::random();
    }

    /// Set a payload field and bump, in one step.
    pub fn update(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
        self.bump();
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// An ordered set of elements keyed by identifier.
///
/// On the wire this is a JSON array of elements. When an incoming array
/// repeats an identifier, the later entry replaces the earlier one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Element>", into = "Vec<Element>")]
pub struct ElementSet {
    elements: BTreeMap<ElementId, Element>,
}

impl ElementSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_elements(elements: impl IntoIterator<Item = Element>) -> Self {
        elements.into_iter().collect()
    }

    /// Insert or replace by identifier. Returns the replaced element.
    pub fn insert(&mut self, element: Element) -> Option<Element> {
        self.elements.insert(element.id.clone(), element)
    }

    pub fn get(&self, id: &str) -> Option<&Element> {
        self.elements.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Element> {
        self.elements.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Element> {
        self.elements.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.elements.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Iterate elements in identifier order.
    pub fn iter(&self) -> btree_map::Values<'_, ElementId, Element> {
        self.elements.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ElementId> {
        self.elements.keys()
    }

    /// Identifier → version map, as used for diff tracking.
    pub fn versions(&self) -> HashMap<ElementId, u64> {
        self.elements
            .values()
            .map(|e| (e.id.clone(), e.version))
            .collect()
    }

    pub fn into_vec(self) -> Vec<Element> {
        self.elements.into_values().collect()
    }
}

impl From<Vec<Element>> for ElementSet {
    fn from(elements: Vec<Element>) -> Self {
        elements.into_iter().collect()
    }
}

impl From<ElementSet> for Vec<Element> {
    fn from(set: ElementSet) -> Self {
        set.into_vec()
    }
}

impl FromIterator<Element> for ElementSet {
    fn from_iter<I: IntoIterator<Item = Element>>(iter: I) -> Self {
        let mut set = ElementSet::new();
        for element in iter {
            set.insert(element);
        }
        set
    }
}

impl IntoIterator for ElementSet {
    type Item = Element;
    type IntoIter = btree_map::IntoValues<ElementId, Element>;

    fn into_iter(self) -> Self::IntoIter {
        self.elements.into_values()
    }
}

impl<'a> IntoIterator for &'a ElementSet {
    type Item = &'a Element;
    type IntoIter = btree_map::Values<'a, ElementId, Element>;

    fn into_iter(self) -> Self::IntoIter {
        self.elements.values()
    }
}
