//! Generic hierarchical document node used for session load/save.
//!
//! The engine only reads and writes `Element` trees; how a session stores
//! them on disk is up to the caller. The type is serde-serializable so any
//! serde format can carry it.

use crate::error::{MidiError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn with_attr(mut self, key: &str, value: &str) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }

    pub fn set_attr(&mut self, key: &str, value: &str) {
        self.attributes.insert(key.to_string(), value.to_string());
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Parses an attribute; absent is `Ok(None)`, unparsable is an error
    pub fn attr_parse<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.attr(key) {
            Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
                MidiError::ConfigurationError(format!(
                    "invalid value '{}' for '{}' in <{}>",
                    raw, key, self.name
                ))
            }),
            None => Ok(None),
        }
    }

    pub fn push(&mut self, child: Element) {
        self.children.push(child);
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|child| child.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |child| child.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_parse() {
        let element = Element::new("bus")
            .with_attr("channel", "9")
            .with_attr("passthru", "maybe");
        assert_eq!(element.attr_parse::<u8>("channel").unwrap(), Some(9));
        assert_eq!(element.attr_parse::<u8>("missing").unwrap(), None);
        assert!(element.attr_parse::<bool>("passthru").is_err());
    }

    #[test]
    fn test_children_named() {
        let mut root = Element::new("buses");
        root.push(Element::new("bus").with_attr("name", "a"));
        root.push(Element::new("other"));
        root.push(Element::new("bus").with_attr("name", "b"));
        let names: Vec<_> = root
            .children_named("bus")
            .filter_map(|bus| bus.attr("name"))
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
