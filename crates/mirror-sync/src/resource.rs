//! Uniform resource snapshots
//!
//! The watcher and reconciler operate on [`ResourceItem`], a point-in-time
//! snapshot that hides the ConfigMap/Secret split behind one payload shape.
//! The kind is only consulted when selecting which collection to query.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};

/// The resource kinds the sidecar can mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    /// Cluster configuration object
    ConfigMap,
    /// Cluster secret
    Secret,
}

impl ResourceKind {
    /// Lowercase name as used in configuration and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfigMap => "configmap",
            Self::Secret => "secret",
        }
    }

    /// Parses the `RESOURCE` setting into the kinds to mirror.
    ///
    /// Accepts `configmap`, `secret`, or `both`; anything else is `None`.
    #[must_use]
    pub fn parse_selection(value: &str) -> Option<Vec<Self>> {
        match value {
            "configmap" => Some(vec![Self::ConfigMap]),
            "secret" => Some(vec![Self::Secret]),
            "both" => Some(vec![Self::Secret, Self::ConfigMap]),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a mirrored resource: (kind, namespace, name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId {
    /// Resource kind
    pub kind: ResourceKind,
    /// Namespace the resource lives in
    pub namespace: String,
    /// Resource name
    pub name: String,
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Point-in-time snapshot of one matching resource.
///
/// Superseded by later versions of the same identity; never persisted.
#[derive(Debug, Clone)]
pub struct ResourceItem {
    /// Resource identity
    pub id: ResourceId,
    /// Version token observed with this snapshot
    pub resource_version: Option<String>,
    /// Labels the item matched the selector with
    pub labels: BTreeMap<String, String>,
    /// Annotations (consulted for the folder override)
    pub annotations: BTreeMap<String, String>,
    /// Payload: data key to opaque bytes
    pub data: BTreeMap<String, Vec<u8>>,
}

impl ResourceItem {
    /// Builds a snapshot from a ConfigMap, merging `data` and `binary_data`.
    ///
    /// Returns `None` when the object carries no name.
    #[must_use]
    pub fn from_config_map(cm: ConfigMap) -> Option<Self> {
        let name = cm.metadata.name?;
        let mut data: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        if let Some(text) = cm.data {
            for (key, value) in text {
                data.insert(key, value.into_bytes());
            }
        }
        if let Some(binary) = cm.binary_data {
            for (key, value) in binary {
                data.insert(key, value.0);
            }
        }
        Some(Self {
            id: ResourceId {
                kind: ResourceKind::ConfigMap,
                namespace: cm.metadata.namespace.unwrap_or_default(),
                name,
            },
            resource_version: cm.metadata.resource_version,
            labels: cm.metadata.labels.unwrap_or_default(),
            annotations: cm.metadata.annotations.unwrap_or_default(),
            data,
        })
    }

    /// Builds a snapshot from a Secret, merging `data` and `string_data`.
    ///
    /// `ByteString` values arrive already decoded from their wire encoding.
    /// Returns `None` when the object carries no name.
    #[must_use]
    pub fn from_secret(secret: Secret) -> Option<Self> {
        let name = secret.metadata.name?;
        let mut data: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        if let Some(binary) = secret.data {
            for (key, value) in binary {
                data.insert(key, value.0);
            }
        }
        if let Some(text) = secret.string_data {
            for (key, value) in text {
                data.insert(key, value.into_bytes());
            }
        }
        Some(Self {
            id: ResourceId {
                kind: ResourceKind::Secret,
                namespace: secret.metadata.namespace.unwrap_or_default(),
                name,
            },
            resource_version: secret.metadata.resource_version,
            labels: secret.metadata.labels.unwrap_or_default(),
            annotations: secret.metadata.annotations.unwrap_or_default(),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn meta(name: &str, namespace: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            resource_version: Some("42".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_config_map_merges_text_and_binary_data() {
        let cm = ConfigMap {
            metadata: meta("cm1", "ns1"),
            data: Some(BTreeMap::from([("a.json".to_string(), "1".to_string())])),
            binary_data: Some(BTreeMap::from([(
                "blob".to_string(),
                ByteString(vec![0xde, 0xad]),
            )])),
            ..Default::default()
        };
        let item = ResourceItem::from_config_map(cm).unwrap();
        assert_eq!(item.id.kind, ResourceKind::ConfigMap);
        assert_eq!(item.id.to_string(), "configmap/ns1/cm1");
        assert_eq!(item.resource_version.as_deref(), Some("42"));
        assert_eq!(item.data.get("a.json").unwrap(), b"1");
        assert_eq!(item.data.get("blob").unwrap(), &[0xde, 0xad]);
    }

    #[test]
    fn test_secret_data_wins_over_string_data_key_order() {
        let secret = Secret {
            metadata: meta("s1", "ns1"),
            data: Some(BTreeMap::from([(
                "token".to_string(),
                ByteString(b"binary".to_vec()),
            )])),
            string_data: Some(BTreeMap::from([(
                "token".to_string(),
                "text".to_string(),
            )])),
            ..Default::default()
        };
        let item = ResourceItem::from_secret(secret).unwrap();
        // string_data is applied last, matching the server-side merge direction
        assert_eq!(item.data.get("token").unwrap(), b"text");
    }

    #[test]
    fn test_nameless_object_is_skipped() {
        let cm = ConfigMap::default();
        assert!(ResourceItem::from_config_map(cm).is_none());
    }

    #[test]
    fn test_parse_selection() {
        assert_eq!(
            ResourceKind::parse_selection("configmap"),
            Some(vec![ResourceKind::ConfigMap])
        );
        assert_eq!(
            ResourceKind::parse_selection("both"),
            Some(vec![ResourceKind::Secret, ResourceKind::ConfigMap])
        );
        assert_eq!(ResourceKind::parse_selection("deployment"), None);
    }
}
