//! Building the JSON Patch operations which attach storage to a pod.
//!
//! Every mount we inject becomes exactly two operations: one adding a
//! FlexVolume to `/spec/volumes`, and one adding a matching `VolumeMount` to a
//! container. Kubernetes applies patch operations in order, so the volume must
//! always come first.

use json_patch::{AddOperation, Patch, PatchOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::{FlexVolumeSource, Volume, VolumeMount};

use crate::prelude::*;
use crate::vault::Credential;

/// The legacy FlexVolume driver, which needs credentials in its options.
pub const GOOFYS_DRIVER: &str = "informaticslab/goofys-flex-volume";

/// The FlexVolume driver which fetches credentials from Vault itself.
pub const BOATHOUSE_DRIVER: &str = "statcan.gc.ca/boathouse";

/// The S3 region we tell every driver to use. MinIO ignores it, but the
/// drivers insist on having one.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Owner of the mounted files, matching the notebook user.
pub const OWNER_UID: &str = "1000";

/// Group of the mounted files.
pub const OWNER_GID: &str = "100";

/// How long `boathouse` may keep the credentials it fetches.
pub const VAULT_TTL: &str = "24h";

/// Name of the bucket every profile shares.
pub const SHARED_BUCKET: &str = "shared";

/// A single JSON Patch operation. We only ever add things.
#[derive(Clone, Debug, PartialEq)]
pub enum PatchOp {
    /// Append a volume to `/spec/volumes`.
    AddVolume(Volume),
    /// Append a volume mount to the container at `container_index`.
    AddVolumeMount {
        /// Index into `/spec/containers`.
        container_index: usize,
        /// The mount to add.
        mount: VolumeMount,
    },
}

impl PatchOp {
    /// The JSON Pointer this operation appends to.
    pub fn pointer(&self) -> PointerBuf {
        match self {
            PatchOp::AddVolume(_) => PointerBuf::from_tokens(["spec", "volumes", "-"]),
            PatchOp::AddVolumeMount {
                container_index, ..
            } => {
                let index = container_index.to_string();
                PointerBuf::from_tokens(["spec", "containers", index.as_str(), "volumeMounts", "-"])
            }
        }
    }

    /// `pointer` as a string.
    pub fn path(&self) -> String {
        self.pointer().to_string()
    }

    /// The name of the volume this operation adds or refers to.
    pub fn volume_name(&self) -> &str {
        match self {
            PatchOp::AddVolume(volume) => &volume.name,
            PatchOp::AddVolumeMount { mount, .. } => &mount.name,
        }
    }

    /// Convert into an RFC 6902 `add` operation.
    pub fn to_operation(&self) -> serde_json::Result<PatchOperation> {
        let value = match self {
            PatchOp::AddVolume(volume) => serde_json::to_value(volume)?,
            PatchOp::AddVolumeMount { mount, .. } => serde_json::to_value(mount)?,
        };
        Ok(PatchOperation::Add(AddOperation {
            path: self.pointer(),
            value,
        }))
    }
}

/// Convert `ops` into a JSON Patch, preserving their order.
pub fn to_json_patch(ops: &[PatchOp]) -> serde_json::Result<Patch> {
    Ok(Patch(
        ops.iter()
            .map(PatchOp::to_operation)
            .collect::<serde_json::Result<Vec<_>>>()?,
    ))
}

/// Join `base` and `leaf` into an absolute path, dropping empty and `.`
/// segments the way Go's `path.Join` does.
fn join_path(base: &str, leaf: &str) -> String {
    let segments = base
        .split('/')
        .chain(leaf.split('/'))
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>();
    format!("/{}", segments.join("/"))
}

/// Where a mounted volume gets its credentials.
#[derive(Clone, Debug, PartialEq)]
pub enum MountSource {
    /// Credentials resolved at admission time and embedded in the volume.
    /// These mounts always go on the first container.
    Embedded(Credential),
    /// A Vault path which the driver resolves when the pod starts.
    Reference {
        /// Path of the credentials in Vault.
        vault_path: String,
        /// Index of the container which receives the mount.
        container_index: usize,
    },
}

/// Everything needed to attach one bucket to one container.
#[derive(Clone, Debug, PartialEq)]
pub struct MountSpec {
    /// Volume name, shared by the volume and its mount.
    pub name: String,
    /// S3 endpoint of the storage instance.
    pub endpoint: String,
    /// S3 region.
    pub region: String,
    /// Bucket to mount.
    pub bucket: String,
    /// Where to mount it inside the container.
    pub mount_path: String,
    /// How the driver obtains credentials.
    pub source: MountSource,
}

impl MountSpec {
    /// Build the volume and volume mount operations for this mount, in that
    /// order.
    pub fn patches(&self) -> [PatchOp; 2] {
        let mut options = BTreeMap::new();
        options.insert("bucket".to_owned(), self.bucket.clone());
        options.insert("endpoint".to_owned(), self.endpoint.clone());
        options.insert("region".to_owned(), self.region.clone());
        let (driver, container_index) = match &self.source {
            MountSource::Embedded(credential) => {
                options.insert("access-key".to_owned(), credential.access_key.clone());
                options.insert("secret-key".to_owned(), credential.secret_key.clone());
                (GOOFYS_DRIVER, 0)
            }
            MountSource::Reference {
                vault_path,
                container_index,
            } => {
                options.insert("vault-path".to_owned(), vault_path.clone());
                options.insert("vault-ttl".to_owned(), VAULT_TTL.to_owned());
                (BOATHOUSE_DRIVER, *container_index)
            }
        };
        options.insert("uid".to_owned(), OWNER_UID.to_owned());
        options.insert("gid".to_owned(), OWNER_GID.to_owned());

        let volume = Volume {
            name: self.name.clone(),
            flex_volume: Some(FlexVolumeSource {
                driver: driver.to_owned(),
                options: Some(options),
                ..FlexVolumeSource::default()
            }),
            ..Volume::default()
        };
        let mount = VolumeMount {
            name: self.name.clone(),
            mount_path: self.mount_path.clone(),
            ..VolumeMount::default()
        };
        [
            PatchOp::AddVolume(volume),
            PatchOp::AddVolumeMount {
                container_index,
                mount,
            },
        ]
    }
}

/// Mount `bucket` using the legacy goofys driver, with credentials embedded in
/// the volume. The mount goes on the first container.
pub fn build_embedded_mount(
    name: &str,
    access_key: &str,
    secret_key: &str,
    endpoint: &str,
    region: &str,
    bucket: &str,
    mount_path: &str,
) -> [PatchOp; 2] {
    MountSpec {
        name: name.to_owned(),
        endpoint: endpoint.to_owned(),
        region: region.to_owned(),
        bucket: bucket.to_owned(),
        mount_path: mount_path.to_owned(),
        source: MountSource::Embedded(Credential {
            access_key: access_key.to_owned(),
            secret_key: secret_key.to_owned(),
        }),
    }
    .patches()
}

/// Mount `bucket` using the `boathouse` driver, which reads credentials from
/// `vault_path` itself.
pub fn build_reference_mount(
    name: &str,
    vault_path: &str,
    endpoint: &str,
    region: &str,
    bucket: &str,
    mount_path: &str,
    container_index: usize,
) -> [PatchOp; 2] {
    MountSpec {
        name: name.to_owned(),
        endpoint: endpoint.to_owned(),
        region: region.to_owned(),
        bucket: bucket.to_owned(),
        mount_path: mount_path.to_owned(),
        source: MountSource::Reference {
            vault_path: vault_path.to_owned(),
            container_index,
        },
    }
    .patches()
}

/// Build the private and shared mounts for `instance`, given a function which
/// builds one mount from a volume name, a bucket and a mount path.
///
/// The private mount lives at `<base>/private` and uses the bucket named after
/// the profile. The shared mount lives at `<base>/shared` and uses the
/// `shared` bucket.
fn private_and_shared<F>(instance: &Instance, profile: &str, base: &str, build: F) -> Vec<PatchOp>
where
    F: Fn(&str, &str, &str) -> [PatchOp; 2],
{
    let volume_name = instance.volume_name();
    let mut patches = Vec::with_capacity(4);
    patches.extend(build(
        &format!("{}-private", volume_name),
        profile,
        &join_path(base, "private"),
    ));
    patches.extend(build(
        &format!("{}-shared", volume_name),
        SHARED_BUCKET,
        &join_path(base, "shared"),
    ));
    patches
}

/// Build the four operations attaching `instance` with embedded credentials.
pub fn build_embedded_instance(
    instance: &Instance,
    credential: &Credential,
    region: &str,
    profile: &str,
    base: &str,
) -> Vec<PatchOp> {
    private_and_shared(instance, profile, base, |name, bucket, mount_path| {
        build_embedded_mount(
            name,
            &credential.access_key,
            &credential.secret_key,
            &instance.external_url,
            region,
            bucket,
            mount_path,
        )
    })
}

/// Build the four operations attaching `instance` through `boathouse`.
pub fn build_reference_instance(
    instance: &Instance,
    vault_path: &str,
    region: &str,
    profile: &str,
    base: &str,
    container_index: usize,
) -> Vec<PatchOp> {
    private_and_shared(instance, profile, base, |name, bucket, mount_path| {
        build_reference_mount(
            name,
            vault_path,
            &instance.external_url,
            region,
            bucket,
            mount_path,
            container_index,
        )
    })
}

#[cfg(test)]
fn standard_instance() -> Instance {
    Instance {
        name: "minio_standard".to_owned(),
        external_url: "https://minio-standard.example.ca".to_owned(),
        short: "standard".to_owned(),
    }
}

#[test]
fn reference_mount_serializes_as_json_patch() {
    let patches = build_reference_mount(
        "minio-standard-private",
        "minio_standard/keys/profile-team-a",
        "https://minio-standard.example.ca",
        DEFAULT_REGION,
        "team-a",
        "/home/jovyan/minio/standard/private",
        1,
    );
    let json = serde_json::to_value(to_json_patch(&patches).unwrap()).unwrap();
    assert_eq!(
        json,
        serde_json::json!([
            {
                "op": "add",
                "path": "/spec/volumes/-",
                "value": {
                    "name": "minio-standard-private",
                    "flexVolume": {
                        "driver": "statcan.gc.ca/boathouse",
                        "options": {
                            "bucket": "team-a",
                            "endpoint": "https://minio-standard.example.ca",
                            "region": "us-east-1",
                            "vault-path": "minio_standard/keys/profile-team-a",
                            "vault-ttl": "24h",
                            "uid": "1000",
                            "gid": "100"
                        }
                    }
                }
            },
            {
                "op": "add",
                "path": "/spec/containers/1/volumeMounts/-",
                "value": {
                    "name": "minio-standard-private",
                    "mountPath": "/home/jovyan/minio/standard/private"
                }
            }
        ])
    );
}

#[test]
fn embedded_mount_carries_credentials_on_first_container() {
    let [volume, mount] = build_embedded_mount(
        "minio-standard-shared",
        "AKIA",
        "s3cr3t",
        "https://minio-standard.example.ca",
        DEFAULT_REGION,
        SHARED_BUCKET,
        "/home/jovyan/minio/standard/shared",
    );
    let flex = match &volume {
        PatchOp::AddVolume(volume) => volume.flex_volume.as_ref().unwrap(),
        other => panic!("expected a volume, got {:?}", other),
    };
    assert_eq!(flex.driver, GOOFYS_DRIVER);
    let options = flex.options.as_ref().unwrap();
    assert_eq!(options["access-key"], "AKIA");
    assert_eq!(options["secret-key"], "s3cr3t");
    assert_eq!(options["bucket"], "shared");
    assert_eq!(options["uid"], "1000");
    assert_eq!(options["gid"], "100");
    assert!(!options.contains_key("vault-path"));
    assert_eq!(mount.path(), "/spec/containers/0/volumeMounts/-");
}

#[test]
fn instance_gets_private_then_shared_mounts() {
    let patches = build_reference_instance(
        &standard_instance(),
        "minio_standard/keys/profile-team-a",
        DEFAULT_REGION,
        "team-a",
        "/home/jovyan/minio/standard",
        0,
    );
    let summary = patches
        .iter()
        .map(|op| (op.path(), op.volume_name().to_owned()))
        .collect::<Vec<_>>();
    assert_eq!(
        summary,
        vec![
            ("/spec/volumes/-".to_owned(), "minio-standard-private".to_owned()),
            (
                "/spec/containers/0/volumeMounts/-".to_owned(),
                "minio-standard-private".to_owned()
            ),
            ("/spec/volumes/-".to_owned(), "minio-standard-shared".to_owned()),
            (
                "/spec/containers/0/volumeMounts/-".to_owned(),
                "minio-standard-shared".to_owned()
            ),
        ]
    );

    let json = serde_json::to_value(to_json_patch(&patches).unwrap()).unwrap();
    assert_eq!(json[0]["value"]["flexVolume"]["options"]["bucket"], "team-a");
    assert_eq!(json[2]["value"]["flexVolume"]["options"]["bucket"], "shared");
    assert_eq!(json[3]["value"]["mountPath"], "/home/jovyan/minio/standard/shared");
}

#[test]
fn embedded_instance_uses_the_same_credentials_for_both_mounts() {
    let credential = Credential {
        access_key: "AKIA".to_owned(),
        secret_key: "s3cr3t".to_owned(),
    };
    let patches = build_embedded_instance(
        &standard_instance(),
        &credential,
        DEFAULT_REGION,
        "team-a",
        "/home/jovyan/minio/standard/",
    );
    assert_eq!(patches.len(), 4);
    let json = serde_json::to_value(to_json_patch(&patches).unwrap()).unwrap();
    for volume in &[&json[0], &json[2]] {
        assert_eq!(volume["value"]["flexVolume"]["options"]["access-key"], "AKIA");
    }
    assert_eq!(json[1]["value"]["mountPath"], "/home/jovyan/minio/standard/private");
}

#[test]
fn mount_paths_collapse_empty_segments() {
    let patches = build_reference_instance(
        &standard_instance(),
        "minio_standard/keys/profile-team-a",
        DEFAULT_REGION,
        "team-a",
        "/home//minio/./standard/",
        0,
    );
    let json = serde_json::to_value(to_json_patch(&patches).unwrap()).unwrap();
    assert_eq!(json[1]["value"]["mountPath"], "/home/minio/standard/private");
    assert_eq!(json[3]["value"]["mountPath"], "/home/minio/standard/shared");
}
