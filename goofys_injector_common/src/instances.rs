//! The MinIO instances we know how to mount.

use std::fs;

use crate::prelude::*;

/// A single storage backend eligible for injection.
///
/// The instances file is shared with other services, so it may carry keys we
/// don't care about (`classification`, `serviceUrl`, ...). We ignore them.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Name of the instance. This is also the Vault mount holding its
    /// credentials.
    pub name: String,
    /// The URL pods use to reach the instance.
    pub external_url: String,
    /// Short name, used for the mount directory.
    pub short: String,
}

impl Instance {
    /// Our name, in a form which is legal in a Kubernetes volume name.
    pub fn volume_name(&self) -> String {
        self.name.replace('_', "-")
    }
}

/// Every instance we inject, in the order we inject them. This is loaded once
/// at startup and never changes afterwards.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct InstanceRegistry {
    instances: Vec<Instance>,
}

impl InstanceRegistry {
    /// Create a registry from a list of instances.
    pub fn new(instances: Vec<Instance>) -> Self {
        InstanceRegistry { instances }
    }

    /// Load a registry from a JSON file containing an array of instances.
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("could not read {}", path.display()))?;
        let registry = Self::from_json(&json)
            .with_context(|| format!("could not parse {}", path.display()))?;
        info!(
            path = %path.display(),
            count = registry.len(),
            "loaded storage instances"
        );
        Ok(registry)
    }

    /// Parse a registry from JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        let registry: InstanceRegistry = serde_json::from_str(json)?;
        for instance in registry.iter() {
            if instance.name.is_empty() || instance.short.is_empty() {
                return Err(format_err!(
                    "storage instance {:?} needs both a name and a short name",
                    instance
                ));
            }
        }
        Ok(registry)
    }

    /// Iterate over our instances.
    pub fn iter(&self) -> impl Iterator<Item = &Instance> {
        self.instances.iter()
    }

    /// How many instances do we have?
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Do we have no instances at all?
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[test]
fn parse_instances_file() {
    let json = r#"
[
  {
    "name": "minio_standard",
    "classification": "unclassified",
    "serviceUrl": "http://minio.minio-standard-system:443",
    "externalUrl": "https://minio-standard.example.ca",
    "short": "standard"
  },
  {
    "name": "minio_premium",
    "classification": "unclassified",
    "serviceUrl": "http://minio.minio-premium-system:443",
    "externalUrl": "https://minio-premium.example.ca",
    "short": "premium"
  }
]"#;

    let registry = InstanceRegistry::from_json(json).expect("parse error");
    assert_eq!(registry.len(), 2);
    let first = registry.iter().next().unwrap();
    assert_eq!(first.name, "minio_standard");
    assert_eq!(first.external_url, "https://minio-standard.example.ca");
    assert_eq!(first.short, "standard");
    assert_eq!(first.volume_name(), "minio-standard");
}

#[test]
fn reject_instances_without_short_name() {
    let json = r#"[{"name": "minio_standard", "externalUrl": "https://x", "short": ""}]"#;
    assert!(InstanceRegistry::from_json(json).is_err());
}
