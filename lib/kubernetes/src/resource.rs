use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Describes a kind of Kubernetes resource well enough to build its API paths.
///
/// Unlike typed clients, nothing here is known at compile time, the console
/// watches whatever resource type a view asks for, including custom resources.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ApiResource {
    /// The group of the resource, or the empty string for the core group.
    #[serde(default)]
    pub group: String,

    /// The version of the resource.
    pub version: String,

    /// The kind of the resource, e.g. `Deployment`.
    #[serde(default)]
    pub kind: String,

    /// The plural of this resource, which is used to construct URLS
    pub plural: String,
}

impl ApiResource {
    pub fn new(group: &str, version: &str, kind: &str, plural: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
        }
    }

    /// `group/version`, or just the version for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Creates a url path for http requests for this resource
    pub fn url_path(&self, namespace: Option<&str>) -> String {
        let prefix = if self.group.is_empty() { "api" } else { "apis" };
        let api_version = self.api_version();
        let namespace = match namespace {
            Some(namespace) if !namespace.is_empty() => format!("namespaces/{namespace}/"),
            _ => String::new(),
        };
        let plural = &self.plural;

        format!("/{prefix}/{api_version}/{namespace}{plural}")
    }
}

/// The subset of `ObjectMeta` the console relies on. Unknown fields are
/// ignored, every field is optional because bookmarks and partial objects
/// carry next to nothing.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// UID is the unique in time and space value for this object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    /// An opaque value that represents the internal version of this object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<String>,
}

impl ObjectMeta {
    /// The name, if present and non-empty.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref().filter(|name| !name.is_empty())
    }

    /// The uid, if present and non-empty.
    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref().filter(|uid| !uid.is_empty())
    }
}

/// An object of any resource type. `metadata` is decoded, everything else
/// (`apiVersion`, `kind`, `spec`, `status`, ...) is kept as raw JSON.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct DynamicObject {
    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl DynamicObject {
    pub fn new(name: &str) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: Map::new(),
        }
    }

    pub fn with_uid(mut self, uid: &str) -> Self {
        self.metadata.uid = Some(uid.to_string());
        self
    }

    pub fn with_resource_version(mut self, resource_version: &str) -> Self {
        self.metadata.resource_version = Some(resource_version.to_string());
        self
    }
}

/// ListMeta describes metadata that synthetic resources must have.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMeta {
    /// continue may be set if the user set a limit on the number of items returned.
    #[serde(default, rename = "continue")]
    pub continue_token: Option<String>,

    /// The resource version of the collection, watches resume from here.
    #[serde(default)]
    pub resource_version: Option<String>,
}

/// A generic Kubernetes object list
///
/// This is used instead of a full struct for `DeploymentList`, `PodList`, etc.
#[derive(Deserialize)]
pub struct ObjectList<T> {
    /// ListMeta - only really used for its `resourceVersion`
    #[serde(default)]
    pub metadata: ListMeta,

    /// These items we are actually interested in.
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_path() {
        let pods = ApiResource::new("", "v1", "Pod", "pods");
        assert_eq!(pods.url_path(None), "/api/v1/pods");
        assert_eq!(pods.url_path(Some("ci")), "/api/v1/namespaces/ci/pods");
        assert_eq!(pods.url_path(Some("")), "/api/v1/pods");

        let pipelines = ApiResource::new("tekton.dev", "v1", "Pipeline", "pipelines");
        assert_eq!(
            pipelines.url_path(Some("ci")),
            "/apis/tekton.dev/v1/namespaces/ci/pipelines"
        );
    }

    #[test]
    fn decode_dynamic_object() {
        let text = r#"{
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "web",
                "namespace": "ci",
                "uid": "2c1e",
                "resourceVersion": "42",
                "labels": {"app": "web"}
            },
            "spec": {"replicas": 2}
        }"#;

        let obj = serde_json::from_str::<DynamicObject>(text).unwrap();
        assert_eq!(obj.metadata.name(), Some("web"));
        assert_eq!(obj.metadata.uid(), Some("2c1e"));
        assert_eq!(obj.metadata.resource_version.as_deref(), Some("42"));
        assert_eq!(obj.metadata.labels.get("app").map(String::as_str), Some("web"));
        assert_eq!(obj.data["kind"], "Deployment");
        assert_eq!(obj.data["spec"]["replicas"], 2);
    }

    #[test]
    fn empty_name_is_absent() {
        let obj = serde_json::from_str::<DynamicObject>(r#"{"metadata": {"name": ""}}"#).unwrap();
        assert_eq!(obj.metadata.name(), None);

        let obj = serde_json::from_str::<DynamicObject>("{}").unwrap();
        assert_eq!(obj.metadata.uid(), None);
    }
}
