use std::collections::BTreeMap;
use std::fmt;

use kubernetes::ApiResource;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("serialize query descriptor failed, {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Canonical identity of a watch target.
///
/// Built from the JSON form of a descriptor with object keys sorted at every
/// level, so descriptors that only differ in field or map insertion order
/// collide. Array order is significant.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RegistryKey(String);

impl RegistryKey {
    pub fn from_descriptor<T: Serialize + ?Sized>(descriptor: &T) -> Result<Self, KeyError> {
        let value = serde_json::to_value(descriptor)?;
        Ok(Self::from_value(&value))
    }

    pub fn from_value(value: &Value) -> Self {
        let mut buf = String::new();
        encode(value, &mut buf);
        RegistryKey(buf)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn encode(value: &Value, buf: &mut String) {
    match value {
        Value::Object(map) => {
            let mut fields = map.iter().collect::<Vec<_>>();
            fields.sort_unstable_by(|a, b| a.0.cmp(b.0));

            buf.push('{');
            for (index, (name, value)) in fields.into_iter().enumerate() {
                if index > 0 {
                    buf.push(',');
                }
                // Display of a JSON string value takes care of escaping
                buf.push_str(&Value::String(name.clone()).to_string());
                buf.push(':');
                encode(value, buf);
            }
            buf.push('}');
        }
        Value::Array(items) => {
            buf.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    buf.push(',');
                }
                encode(item, buf);
            }
            buf.push(']');
        }
        scalar => buf.push_str(&scalar.to_string()),
    }
}

/// Describes what a view wants to watch: a resource type in a cluster,
/// optionally narrowed to a namespace, a label selector or one object.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct QueryKey {
    pub cluster: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    pub resource: ApiResource,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Set for single object watches only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl QueryKey {
    pub fn new(cluster: impl Into<String>, resource: ApiResource) -> Self {
        Self {
            cluster: cluster.into(),
            resource,
            ..Default::default()
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn registry_key(&self) -> RegistryKey {
        let mut resource = Map::new();
        resource.insert("group".into(), Value::from(self.resource.group.as_str()));
        resource.insert("version".into(), Value::from(self.resource.version.as_str()));
        resource.insert("kind".into(), Value::from(self.resource.kind.as_str()));
        resource.insert("plural".into(), Value::from(self.resource.plural.as_str()));

        let mut descriptor = Map::new();
        descriptor.insert("cluster".into(), Value::from(self.cluster.as_str()));
        descriptor.insert("resource".into(), Value::Object(resource));
        if let Some(namespace) = &self.namespace {
            descriptor.insert("namespace".into(), Value::from(namespace.as_str()));
        }
        if !self.labels.is_empty() {
            let labels = self
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                .collect::<Map<_, _>>();
            descriptor.insert("labels".into(), Value::Object(labels));
        }
        if let Some(name) = &self.name {
            descriptor.insert("name".into(), Value::from(name.as_str()));
        }

        RegistryKey::from_value(&Value::Object(descriptor))
    }

    /// Renders `labels` as an equality based label selector, `None` if there
    /// are no labels.
    pub fn label_selector(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }

        let selector = self
            .labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");

        Some(selector)
    }
}
