//! Property lists
//!
//! Used for node properties, transaction properties and revision
//! properties. Values are arbitrary bytes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Property value
pub type PropertyValue = Vec<u8>;

/// Name-ordered property list
///
/// Ordering makes the serialized form deterministic, so identical lists
/// deduplicate to one representation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySet {
    #[serde(default)]
    properties: BTreeMap<String, PropertyValue>,
}

impl PropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// Property value as UTF-8, if it is valid UTF-8
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.insert(name.into(), value.into());
    }

    /// Set or, with `None`, remove a property
    pub fn apply(&mut self, name: &str, value: Option<&[u8]>) {
        match value {
            Some(value) => self.set(name, value.to_vec()),
            None => {
                self.remove(name);
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<PropertyValue> {
        self.properties.remove(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.properties.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.properties.iter()
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Well-known property names
pub mod svn_props {
    /// Revision author
    pub const AUTHOR: &str = "svn:author";

    /// Revision log message
    pub const LOG: &str = "svn:log";

    /// Revision timestamp (RFC 3339, microseconds, UTC)
    pub const DATE: &str = "svn:date";

    pub const EXECUTABLE: &str = "svn:executable";

    pub const MIME_TYPE: &str = "svn:mime-type";

    pub const NEEDS_LOCK: &str = "svn:needs-lock";

    pub const MERGE_INFO: &str = "svn:mergeinfo";

    /// Value for svn:executable
    pub const EXECUTABLE_VALUE: &str = "*";

    pub fn is_svn_property(name: &str) -> bool {
        name.starts_with("svn:")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_set_basic_operations() {
        let mut props = PropertySet::new();
        assert!(props.get("test").is_none());

        props.set("test", b"value".to_vec());
        assert_eq!(props.get("test"), Some(&b"value".to_vec()));
        assert_eq!(props.get_str("test"), Some("value"));

        assert_eq!(props.remove("test"), Some(b"value".to_vec()));
        assert!(!props.contains("test"));
    }

    #[test]
    fn test_apply_sets_and_removes() {
        let mut props = PropertySet::new();
        props.apply("p", Some(b"1"));
        assert!(props.contains("p"));
        props.apply("p", None);
        assert!(props.is_empty());
    }

    #[test]
    fn test_identical_lists_serialize_identically() {
        let mut a = PropertySet::new();
        a.set("z", b"1".to_vec());
        a.set("a", b"2".to_vec());
        let mut b = PropertySet::new();
        b.set("a", b"2".to_vec());
        b.set("z", b"1".to_vec());
        assert_eq!(a.to_bytes().unwrap(), b.to_bytes().unwrap());
        assert_eq!(PropertySet::from_bytes(&a.to_bytes().unwrap()).unwrap(), b);
    }

    #[test]
    fn test_empty_property_value() {
        let mut props = PropertySet::new();
        props.set("empty", Vec::new());
        assert_eq!(props.get_str("empty"), Some(""));
        assert!(props.contains("empty"));
    }

    #[test]
    fn test_svn_standard_properties() {
        use svn_props::*;
        assert!(is_svn_property(LOG));
        assert!(is_svn_property(EXECUTABLE));
        assert!(!is_svn_property("custom:myprop"));
        assert_eq!(EXECUTABLE_VALUE, "*");
    }
}
