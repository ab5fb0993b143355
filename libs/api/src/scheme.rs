//! Explicit type registry.
//!
//! A [`Scheme`] is filled once at process start by calling each API
//! group's `add_to_scheme`, then shared read-only. Encoding stamps
//! `apiVersion`/`kind` onto the payload; decoding checks them.

use std::collections::HashSet;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SchemeError;
use crate::meta::{ObjectList, Resource};

/// Fully qualified type name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GroupVersionKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// `group/version`, or `version` for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

/// Registry of known object types.
#[derive(Debug, Clone, Default)]
pub struct Scheme {
    known: HashSet<GroupVersionKind>,
}

impl Scheme {
    /// Creates an empty scheme.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T`. Registering twice is a no-op.
    pub fn add_known_type<T: Resource>(&mut self) {
        self.known.insert(T::gvk());
    }

    /// Returns true if `T` has been registered.
    pub fn is_registered<T: Resource>(&self) -> bool {
        self.known.contains(&T::gvk())
    }

    /// Returns true if the scheme knows `api_version`/`kind`.
    pub fn recognizes(&self, api_version: &str, kind: &str) -> bool {
        self.known
            .iter()
            .any(|gvk| gvk.kind == kind && gvk.api_version() == api_version)
    }

    /// Serializes `obj` and stamps its type.
    pub fn encode<T: Resource + Serialize>(
        &self,
        obj: &T,
    ) -> Result<serde_json::Value, SchemeError> {
        self.ensure_registered::<T>()?;

        let mut value = serde_json::to_value(obj)?;
        let map = value.as_object_mut().ok_or(SchemeError::NotAnObject)?;
        map.insert("apiVersion".to_string(), T::api_version().into());
        map.insert("kind".to_string(), T::KIND.into());
        Ok(value)
    }

    /// Deserializes a single object of type `T`.
    ///
    /// List items are often served without `apiVersion`/`kind`; when present
    /// they must name `T`.
    pub fn decode<T: Resource + DeserializeOwned>(
        &self,
        value: serde_json::Value,
    ) -> Result<T, SchemeError> {
        self.ensure_registered::<T>()?;

        let map = value.as_object().ok_or(SchemeError::NotAnObject)?;
        let api_version = map.get("apiVersion").and_then(|v| v.as_str());
        let kind = map.get("kind").and_then(|v| v.as_str());

        if let (Some(api_version), Some(kind)) = (api_version, kind) {
            if api_version != T::api_version() || kind != T::KIND {
                return Err(SchemeError::KindMismatch {
                    expected: T::gvk().to_string(),
                    actual: format!("{api_version}, Kind={kind}"),
                });
            }
        }

        Ok(serde_json::from_value(value)?)
    }

    /// Deserializes a list of `T`.
    pub fn decode_list<T: Resource + DeserializeOwned>(
        &self,
        value: serde_json::Value,
    ) -> Result<ObjectList<T>, SchemeError> {
        self.ensure_registered::<T>()?;

        let resource_version = value
            .pointer("/metadata/resourceVersion")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let items = match value.get("items") {
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .cloned()
                .map(|item| self.decode::<T>(item))
                .collect::<Result<Vec<_>, _>>()?,
            Some(serde_json::Value::Null) | None => Vec::new(),
            Some(_) => return Err(SchemeError::NotAnObject),
        };

        Ok(ObjectList::new(resource_version, items))
    }

    fn ensure_registered<T: Resource>(&self) -> Result<(), SchemeError> {
        if self.is_registered::<T>() {
            Ok(())
        } else {
            Err(SchemeError::NotRegistered {
                api_version: T::api_version(),
                kind: T::KIND.to_string(),
            })
        }
    }
}
