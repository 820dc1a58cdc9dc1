//! Typed repository resources and the content hash used for drift detection.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::repository::error::RepositoryError;

/// Default API version written to new resource files.
pub const API_VERSION: &str = "infrasync.io/v1";

/// Annotation carrying the content hash of the desired resource.
pub const SOURCE_HASH_ANNOTATION: &str = "infrasync.io/source-hash";

/// Annotation carrying the commit the resource was applied from.
pub const COMMIT_REF_ANNOTATION: &str = "infrasync.io/commit-ref";

/// The kind of a repository resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Settings,
    Box,
    CoreBox,
    Mstore,
    Estore,
    Dictionary,
    Link,
    UiFile,
}

impl ResourceKind {
    /// Directory holding resources of this kind, relative to the clone root.
    /// Several kinds may share one directory. `Settings` lives at the root.
    pub fn directory(&self) -> &'static str {
        match self {
            ResourceKind::Settings => "",
            ResourceKind::Box => "boxes",
            ResourceKind::CoreBox | ResourceKind::Mstore | ResourceKind::Estore => "core",
            ResourceKind::Dictionary => "dictionaries",
            ResourceKind::Link => "links",
            ResourceKind::UiFile => "ui-files",
        }
    }

    /// Whether the cluster holds a live counterpart of this kind.
    pub fn is_managed(&self) -> bool {
        !matches!(self, ResourceKind::Settings | ResourceKind::UiFile)
    }

    pub fn all() -> &'static [ResourceKind] {
        &[
            ResourceKind::Settings,
            ResourceKind::Box,
            ResourceKind::CoreBox,
            ResourceKind::Mstore,
            ResourceKind::Estore,
            ResourceKind::Dictionary,
            ResourceKind::Link,
            ResourceKind::UiFile,
        ]
    }

    /// Kinds the reconciliation engine creates, replaces and deletes.
    pub fn managed() -> &'static [ResourceKind] {
        &[
            ResourceKind::Box,
            ResourceKind::CoreBox,
            ResourceKind::Mstore,
            ResourceKind::Estore,
            ResourceKind::Dictionary,
            ResourceKind::Link,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Settings => "Settings",
            ResourceKind::Box => "Box",
            ResourceKind::CoreBox => "CoreBox",
            ResourceKind::Mstore => "Mstore",
            ResourceKind::Estore => "Estore",
            ResourceKind::Dictionary => "Dictionary",
            ResourceKind::Link => "Link",
            ResourceKind::UiFile => "UiFile",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = RepositoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::all()
            .iter()
            .copied()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| RepositoryError::UnknownKind(s.to_string()))
    }
}

/// Resource metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            annotations: BTreeMap::new(),
        }
    }
}

/// On-disk document layout of a resource file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ResourceDocument {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    pub kind: ResourceKind,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: Value,
}

fn default_api_version() -> String {
    API_VERSION.to_string()
}

/// A desired-state resource read from a tenant branch.
///
/// The spec is carried as an opaque structured value; its schema depends on
/// the kind and is only interpreted by kind-specific consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryResource {
    pub api_version: String,
    pub kind: ResourceKind,
    pub metadata: ObjectMeta,
    pub spec: Value,
    hash: String,
}

impl RepositoryResource {
    pub fn new(kind: ResourceKind, name: impl Into<String>, spec: Value) -> Self {
        let metadata = ObjectMeta::new(name);
        let hash = content_hash(kind, &metadata.name, &spec);
        Self {
            api_version: API_VERSION.to_string(),
            kind,
            metadata,
            spec,
            hash,
        }
    }

    pub(crate) fn from_document(doc: ResourceDocument) -> Self {
        let hash = content_hash(doc.kind, &doc.metadata.name, &doc.spec);
        Self {
            api_version: doc.api_version,
            kind: doc.kind,
            metadata: doc.metadata,
            spec: doc.spec,
            hash,
        }
    }

    pub(crate) fn to_document(&self) -> ResourceDocument {
        ResourceDocument {
            api_version: self.api_version.clone(),
            kind: self.kind,
            metadata: self.metadata.clone(),
            spec: self.spec.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Digest of the canonical `{kind, name, spec}` rendering.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Commit the resource was last applied from, if annotated.
    pub fn commit_ref(&self) -> Option<&str> {
        self.metadata
            .annotations
            .get(COMMIT_REF_ANNOTATION)
            .map(String::as_str)
    }

    pub fn set_commit_ref(&mut self, commit_ref: impl Into<String>) {
        self.metadata
            .annotations
            .insert(COMMIT_REF_ANNOTATION.to_string(), commit_ref.into());
    }
}

/// Identity of a resource inside a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub namespace: String,
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.namespace, self.kind, self.name)
    }
}

/// Computes the content hash of a resource.
///
/// The input is the canonical JSON of `{"kind", "name", "spec"}`: object keys
/// sorted bytewise at every level and no whitespace. Annotations are not part
/// of the hash.
pub fn content_hash(kind: ResourceKind, name: &str, spec: &Value) -> String {
    let mut doc = serde_json::Map::new();
    doc.insert("kind".to_string(), Value::String(kind.to_string()));
    doc.insert("name".to_string(), Value::String(name.to_string()));
    doc.insert("spec".to_string(), spec.clone());

    let mut canonical = String::new();
    write_canonical(&Value::Object(doc), &mut canonical);

    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_ignores_key_order() {
        let a: Value = serde_yaml::from_str("image: app\nport: 8080\nenv: {b: 2, a: 1}\n").unwrap();
        let b: Value = serde_yaml::from_str("env:\n  a: 1\n  b: 2\nport: 8080\nimage: app\n").unwrap();
        assert_eq!(
            content_hash(ResourceKind::Box, "boxA", &a),
            content_hash(ResourceKind::Box, "boxA", &b)
        );
    }

    #[test]
    fn test_hash_depends_on_kind_name_and_spec() {
        let spec = json!({"image": "app"});
        let base = content_hash(ResourceKind::Box, "boxA", &spec);
        assert_ne!(base, content_hash(ResourceKind::CoreBox, "boxA", &spec));
        assert_ne!(base, content_hash(ResourceKind::Box, "boxB", &spec));
        assert_ne!(
            base,
            content_hash(ResourceKind::Box, "boxA", &json!({"image": "app2"}))
        );
        assert_eq!(base.len(), 64);
    }

    #[test]
    fn test_hash_is_pinned() {
        // sha256 of {"kind":"Box","name":"a","spec":{}}
        let hash = content_hash(ResourceKind::Box, "a", &json!({}));
        let expected = hex::encode(Sha256::digest(br#"{"kind":"Box","name":"a","spec":{}}"#));
        assert_eq!(hash, expected);
    }

    #[test]
    fn test_commit_annotation_does_not_change_hash() {
        let mut resource = RepositoryResource::new(ResourceKind::Link, "l1", json!({"a": 1}));
        let before = resource.hash().to_string();
        resource.set_commit_ref("abc123");
        assert_eq!(resource.commit_ref(), Some("abc123"));
        assert_eq!(resource.hash(), before);
    }

    #[test]
    fn test_kind_directories() {
        assert_eq!(ResourceKind::Box.directory(), "boxes");
        assert_eq!(ResourceKind::Mstore.directory(), ResourceKind::CoreBox.directory());
        assert!(!ResourceKind::UiFile.is_managed());
        assert!(ResourceKind::managed().iter().all(|k| k.is_managed()));
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("corebox".parse::<ResourceKind>().unwrap(), ResourceKind::CoreBox);
        assert!("Pod".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn test_resource_key_display() {
        let key = ResourceKey::new("ns-alpha", ResourceKind::Box, "boxA");
        assert_eq!(key.to_string(), "ns-alpha:Box/boxA");
    }
}
