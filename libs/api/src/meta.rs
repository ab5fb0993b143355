//! Object metadata, ownership and lists.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheme::GroupVersionKind;

/// Metadata carried by every stored object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    /// Server-assigned unique id; survives renames, differs across recreations.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,

    /// Opaque version string, changes on every write.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

/// Back-reference from a dependent object to its owner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,

    /// Marks the managing controller. At most one reference may set it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,
}

/// A registered, stored object type.
///
/// Implemented through [`crate::define_resource!`].
pub trait Resource {
    const GROUP: &'static str;
    const VERSION: &'static str;
    const KIND: &'static str;
    /// Lowercase plural used in REST paths.
    const PLURAL: &'static str;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Group, version and kind of this type.
    fn gvk() -> GroupVersionKind {
        GroupVersionKind::new(Self::GROUP, Self::VERSION, Self::KIND)
    }

    /// `group/version`, or just `version` for the core group.
    fn api_version() -> String {
        Self::gvk().api_version()
    }
}

/// Builds a controller owner reference pointing at `owner`.
pub fn controller_ref<T: Resource>(owner: &T) -> OwnerReference {
    let meta = owner.meta();
    OwnerReference {
        api_version: T::api_version(),
        kind: T::KIND.to_string(),
        name: meta.name.clone(),
        uid: meta.uid.clone(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Returns the owner reference flagged as controller, if any.
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .iter()
        .find(|r| r.controller == Some(true))
}

/// Checks whether `owner` is the controller of `obj`.
///
/// Identity is the owner's uid: a recreated owner with the same name does
/// not adopt the previous owner's dependents.
pub fn is_controlled_by<O: Resource, T: Resource>(obj: &T, owner: &O) -> bool {
    let uid = &owner.meta().uid;
    !uid.is_empty() && controller_of(obj.meta()).is_some_and(|r| &r.uid == uid)
}

/// List metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMeta {
    #[serde(default)]
    pub resource_version: String,
}

/// A consistent snapshot of a collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectList<T> {
    #[serde(default)]
    pub metadata: ListMeta,

    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

impl<T> ObjectList<T> {
    pub fn new(resource_version: impl Into<String>, items: Vec<T>) -> Self {
        Self {
            metadata: ListMeta {
                resource_version: resource_version.into(),
            },
            items,
        }
    }
}
