//! Macros for declaring resource types.

/// Implements [`crate::Resource`] for a struct with a `metadata` field.
///
/// This generates:
/// - The `GROUP`, `VERSION`, `KIND` and `PLURAL` constants
/// - `meta()` / `meta_mut()` accessors over `metadata`
///
/// # Example
///
/// ```ignore
/// define_resource!(Task, group = "taskrun.dev", version = "v1", kind = "Task", plural = "tasks");
/// define_resource!(Pod, group = "", version = "v1", kind = "Pod", plural = "pods");
/// ```
#[macro_export]
macro_rules! define_resource {
    (
        $name:ident,
        group = $group:literal,
        version = $version:literal,
        kind = $kind:literal,
        plural = $plural:literal
    ) => {
        impl $crate::Resource for $name {
            const GROUP: &'static str = $group;
            const VERSION: &'static str = $version;
            const KIND: &'static str = $kind;
            const PLURAL: &'static str = $plural;

            fn meta(&self) -> &$crate::ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut $crate::ObjectMeta {
                &mut self.metadata
            }
        }
    };
}
