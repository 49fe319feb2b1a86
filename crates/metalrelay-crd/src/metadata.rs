//! Common metadata types for resources

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Kubernetes-style object metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Resource name (empty when the store should generate one)
    #[serde(default)]
    pub name: String,

    /// Prefix for a store-generated name, used when `name` is empty
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,

    /// Namespace (optional, defaults to "default")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Unique identifier, assigned by the store on create
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uuid>,

    /// Resource version for optimistic concurrency
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,

    /// Labels for organizing and selecting resources
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,

    /// Creation timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

impl ObjectMeta {
    /// Create new metadata with just a name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Create new metadata with name and namespace
    pub fn with_namespace(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    /// Create metadata whose name is generated by the store from a prefix
    pub fn generated(prefix: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            generate_name: Some(prefix.into()),
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Namespace, or "default" when unset
    pub fn namespace_or_default(&self) -> &str {
        self.namespace.as_deref().unwrap_or("default")
    }
}

/// Type metadata for resource objects
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypeMeta {
    /// API version (e.g., "metalrelay.dev/v1")
    pub api_version: String,

    /// Kind (e.g., "Subnet", "IpReservation", "Endpoint")
    pub kind: String,
}

impl TypeMeta {
    fn of(kind: &str) -> Self {
        Self {
            api_version: crate::API_VERSION.to_string(),
            kind: kind.to_string(),
        }
    }

    /// Create type metadata for Subnet
    pub fn subnet() -> Self {
        Self::of("Subnet")
    }

    /// Create type metadata for IpReservation
    pub fn ip_reservation() -> Self {
        Self::of("IpReservation")
    }

    /// Create type metadata for Endpoint
    pub fn endpoint() -> Self {
        Self::of("Endpoint")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_meta_new() {
        let meta = ObjectMeta::new("test-subnet");
        assert_eq!(meta.name, "test-subnet");
        assert!(meta.namespace.is_none());
        assert_eq!(meta.namespace_or_default(), "default");
        assert!(meta.labels.is_empty());
    }

    #[test]
    fn test_object_meta_generated() {
        let meta = ObjectMeta::generated("compute-", "metal");
        assert!(meta.name.is_empty());
        assert_eq!(meta.generate_name.as_deref(), Some("compute-"));
        assert_eq!(meta.namespace_or_default(), "metal");
    }

    #[test]
    fn test_object_meta_with_labels() {
        let meta = ObjectMeta::new("test")
            .with_label("env", "prod")
            .with_label("tier", "oob");

        assert_eq!(meta.labels.get("env"), Some(&"prod".to_string()));
        assert_eq!(meta.labels.get("tier"), Some(&"oob".to_string()));
    }

    #[test]
    fn test_type_meta_kinds() {
        assert_eq!(TypeMeta::subnet().kind, "Subnet");
        assert_eq!(TypeMeta::ip_reservation().kind, "IpReservation");
        assert_eq!(TypeMeta::endpoint().api_version, "metalrelay.dev/v1");
    }

    #[test]
    fn test_object_meta_serialization() {
        let meta = ObjectMeta::with_namespace("rack-1", "default").with_label("oob", "true");

        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"namespace\":\"default\""));
        assert!(!json.contains("generateName"));
        let parsed: ObjectMeta = serde_json::from_str(&json).unwrap();

        assert_eq!(meta, parsed);
    }
}
