//! Typed access on top of the dynamic [`ObjectStore`].
//!
//! Converts between [`DynamicObject`] and statically typed resources (the
//! controller's CRDs and `k8s-openapi` types such as `Secret`).

use super::{FieldSelector, ObjectStore, StoreResult};
use async_trait::async_trait;
use kube::core::{ApiResource, DynamicObject, TypeMeta};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// API resource descriptor of a statically typed resource
pub fn api_resource<K: Resource<DynamicType = ()>>() -> ApiResource {
    ApiResource::erase::<K>(&())
}

fn type_meta<K: Resource<DynamicType = ()>>() -> TypeMeta {
    TypeMeta {
        api_version: K::api_version(&()).into_owned(),
        kind: K::kind(&()).into_owned(),
    }
}

/// Convert a typed resource into a dynamic object
pub fn to_dynamic<K>(obj: &K) -> StoreResult<DynamicObject>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let mut dynamic: DynamicObject = serde_json::from_value(serde_json::to_value(obj)?)?;
    if dynamic.types.is_none() {
        dynamic.types = Some(type_meta::<K>());
    }
    Ok(dynamic)
}

/// Convert a dynamic object into a typed resource
///
/// Missing type information is filled in from `K`.
pub fn from_dynamic<K>(mut obj: DynamicObject) -> StoreResult<K>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    if obj.types.is_none() {
        obj.types = Some(type_meta::<K>());
    }
    Ok(serde_json::from_value(serde_json::to_value(&obj)?)?)
}

/// Typed variants of the [`ObjectStore`] operations
#[async_trait]
pub trait TypedStoreExt {
    async fn get_typed<K>(&self, namespace: Option<&str>, name: &str) -> StoreResult<Option<K>>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned + Send + 'static;

    async fn list_typed<K>(
        &self,
        namespace: Option<&str>,
        selector: Option<&FieldSelector>,
    ) -> StoreResult<Vec<K>>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned + Send + 'static;

    async fn create_typed<K>(&self, obj: &K) -> StoreResult<K>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Send + Sync + 'static;

    async fn update_typed<K>(&self, obj: &K) -> StoreResult<K>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Send + Sync + 'static;

    async fn update_status_typed<K>(&self, obj: &K) -> StoreResult<K>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Send + Sync + 'static;

    async fn delete_typed<K>(&self, namespace: Option<&str>, name: &str) -> StoreResult<()>
    where
        K: Resource<DynamicType = ()> + Send + 'static;
}

#[async_trait]
impl<S> TypedStoreExt for S
where
    S: ObjectStore + ?Sized,
{
    async fn get_typed<K>(&self, namespace: Option<&str>, name: &str) -> StoreResult<Option<K>>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned + Send + 'static,
    {
        let resource = api_resource::<K>();
        match self.get(&resource, namespace, name).await? {
            Some(obj) => Ok(Some(from_dynamic(obj)?)),
            None => Ok(None),
        }
    }

    async fn list_typed<K>(
        &self,
        namespace: Option<&str>,
        selector: Option<&FieldSelector>,
    ) -> StoreResult<Vec<K>>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned + Send + 'static,
    {
        let resource = api_resource::<K>();
        self.list(&resource, namespace, selector)
            .await?
            .into_iter()
            .map(from_dynamic)
            .collect()
    }

    async fn create_typed<K>(&self, obj: &K) -> StoreResult<K>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let resource = api_resource::<K>();
        let created = self.create(&resource, to_dynamic(obj)?).await?;
        from_dynamic(created)
    }

    async fn update_typed<K>(&self, obj: &K) -> StoreResult<K>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let resource = api_resource::<K>();
        let updated = self.update(&resource, to_dynamic(obj)?).await?;
        from_dynamic(updated)
    }

    async fn update_status_typed<K>(&self, obj: &K) -> StoreResult<K>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let resource = api_resource::<K>();
        let updated = self.update_status(&resource, to_dynamic(obj)?).await?;
        from_dynamic(updated)
    }

    async fn delete_typed<K>(&self, namespace: Option<&str>, name: &str) -> StoreResult<()>
    where
        K: Resource<DynamicType = ()> + Send + 'static,
    {
        let resource = api_resource::<K>();
        self.delete(&resource, namespace, name).await
    }
}
