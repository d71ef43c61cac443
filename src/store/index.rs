//! Secondary field indexes over stored objects.

use kube::core::{ApiResource, DynamicObject};
use std::fmt;

/// Extracts an index value from an object of one resource
#[derive(Clone)]
pub struct FieldIndexer {
    pub resource: ApiResource,
    pub field: &'static str,
    pub extract: fn(&DynamicObject) -> Option<String>,
}

impl fmt::Debug for FieldIndexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldIndexer")
            .field("group", &self.resource.group)
            .field("plural", &self.resource.plural)
            .field("field", &self.field)
            .finish_non_exhaustive()
    }
}

impl FieldIndexer {
    pub fn new(
        resource: ApiResource,
        field: &'static str,
        extract: fn(&DynamicObject) -> Option<String>,
    ) -> Self {
        Self {
            resource,
            field,
            extract,
        }
    }

    pub fn applies_to(&self, resource: &ApiResource) -> bool {
        same_resource(&self.resource, resource)
    }
}

/// Two API resources name the same collection when group and plural agree
pub(crate) fn same_resource(a: &ApiResource, b: &ApiResource) -> bool {
    a.group == b.group && a.plural == b.plural
}

/// Exact-match filter on an indexed field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSelector {
    pub field: String,
    pub value: String,
}

impl FieldSelector {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// The set of indexers a store maintains
#[derive(Debug, Clone, Default)]
pub struct IndexRegistry {
    indexers: Vec<FieldIndexer>,
}

impl IndexRegistry {
    pub fn new(indexers: Vec<FieldIndexer>) -> Self {
        Self { indexers }
    }

    pub fn for_resource<'a>(
        &'a self,
        resource: &'a ApiResource,
    ) -> impl Iterator<Item = &'a FieldIndexer> + 'a {
        self.indexers.iter().filter(move |i| i.applies_to(resource))
    }

    pub fn get<'a>(&'a self, resource: &'a ApiResource, field: &str) -> Option<&'a FieldIndexer> {
        self.for_resource(resource).find(|i| i.field == field)
    }

    /// Whether `obj` matches `selector` according to the registered indexer
    pub fn matches(&self, resource: &ApiResource, selector: &FieldSelector, obj: &DynamicObject) -> bool {
        self.get(resource, &selector.field)
            .and_then(|indexer| (indexer.extract)(obj))
            .is_some_and(|value| value == selector.value)
    }
}
