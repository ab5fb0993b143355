//! Namespaced object keys.
//!
//! A key is the string `namespace/name`, or just `name` for objects that
//! live outside any namespace. Work queues carry keys, never objects.

use std::fmt;
use std::str::FromStr;

use crate::error::KeyError;
use crate::meta::ObjectMeta;

/// Identity of an object inside the cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    /// Namespace, empty for cluster-scoped objects.
    pub namespace: String,

    /// Object name, never empty.
    pub name: String,
}

impl ObjectKey {
    /// Creates a key from its parts.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Derives the key of an object from its metadata.
    pub fn from_meta(meta: &ObjectMeta) -> Result<Self, KeyError> {
        if meta.name.is_empty() {
            return Err(KeyError::MissingName);
        }
        Ok(Self::new(meta.namespace.clone(), meta.name.clone()))
    }

    /// Splits a `namespace/name` string.
    ///
    /// `name` alone is accepted as a cluster-scoped key. More than one `/`
    /// or an empty name is rejected.
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        let mut parts = s.split('/');
        let (namespace, name) = match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) => ("", name),
            (Some(namespace), Some(name), None) => (namespace, name),
            _ => return Err(KeyError::Malformed(s.to_string())),
        };

        if name.is_empty() {
            return Err(KeyError::Malformed(s.to_string()));
        }

        Ok(Self::new(namespace, name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for ObjectKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("ns/foo", "ns", "foo")]
    #[case("foo", "", "foo")]
    #[case("/foo", "", "foo")]
    fn test_parse_valid(#[case] input: &str, #[case] namespace: &str, #[case] name: &str) {
        let key = ObjectKey::parse(input).unwrap();
        assert_eq!(key.namespace, namespace);
        assert_eq!(key.name, name);
    }

    #[rstest]
    #[case("")]
    #[case("ns/")]
    #[case("a/b/c")]
    fn test_parse_malformed(#[case] input: &str) {
        let err = ObjectKey::parse(input).unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn test_display_omits_empty_namespace() {
        assert_eq!(ObjectKey::new("", "foo").to_string(), "foo");
        assert_eq!(ObjectKey::new("ns", "foo").to_string(), "ns/foo");
    }

    #[test]
    fn test_from_meta_requires_name() {
        let meta = ObjectMeta {
            namespace: "ns".to_string(),
            ..Default::default()
        };
        assert_eq!(ObjectKey::from_meta(&meta), Err(KeyError::MissingName));
    }
}
