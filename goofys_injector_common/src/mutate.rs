//! Turning an admission request into MinIO mounts.

use k8s_openapi::api::core::v1::Pod;
use kube::core::{
    admission::{AdmissionRequest, AdmissionResponse, SerializePatchError},
    DynamicObject,
};
use thiserror::Error;

use crate::patch::{
    build_embedded_instance, build_reference_instance, to_json_patch, PatchOp, DEFAULT_REGION,
};
use crate::policy::{evaluate, InjectionDecision, PolicyError};
use crate::prelude::*;
use crate::vault::{credential_path, resolve_credential, SecretStore};

/// Audit annotation recorded whenever we add mounts.
pub const AUDIT_ANNOTATION: &str = "goofys-injector";

/// Value of `AUDIT_ANNOTATION`.
pub const AUDIT_MESSAGE: &str = "Added MinIO volume mounts";

/// Errors which prevent us from answering an admission request.
#[derive(Debug, Error)]
pub enum MutateError {
    /// The request did not contain a usable pod.
    #[error("unable to decode Pod")]
    Decode(#[source] serde_json::Error),

    /// The pod's metadata asked for something we don't understand.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// We couldn't convert our operations into a JSON Patch.
    #[error("unable to build patch")]
    Build(#[source] serde_json::Error),

    /// We couldn't attach the patch to our response.
    #[error("unable to serialize patch")]
    Serialize(#[from] SerializePatchError),
}

/// The outcome of a mutation. We never refuse a pod, so there is no
/// `allowed` field: it's always true.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AdmissionResult {
    /// Operations to apply, in order.
    pub patch: Vec<PatchOp>,
    /// Annotations for the API server's audit log.
    pub audit_annotations: BTreeMap<String, String>,
}

impl AdmissionResult {
    /// Did we change anything?
    pub fn is_mutated(&self) -> bool {
        !self.patch.is_empty()
    }

    /// Convert this result into the response to `request`.
    pub fn into_response(
        self,
        request: &AdmissionRequest<DynamicObject>,
    ) -> Result<AdmissionResponse, MutateError> {
        let mut response = AdmissionResponse::from(request);
        if self.is_mutated() {
            let patch = to_json_patch(&self.patch).map_err(MutateError::Build)?;
            response = response.with_patch(patch)?;
        }
        response.audit_annotations.extend(self.audit_annotations);
        Ok(response)
    }
}

/// Decides on and builds the mounts for each pod. One of these is shared by
/// every request.
pub struct Mutator {
    registry: Arc<InstanceRegistry>,
    store: Arc<dyn SecretStore>,
    mode: MountMode,
    home_user: String,
}

impl Mutator {
    /// Create a new mutator.
    pub fn new(
        registry: Arc<InstanceRegistry>,
        store: Arc<dyn SecretStore>,
        mode: MountMode,
        home_user: &str,
    ) -> Self {
        Mutator {
            registry,
            store,
            mode,
            home_user: home_user.to_owned(),
        }
    }

    /// Work out which mounts `request` needs.
    #[tracing::instrument(skip(self, request), fields(uid = %request.uid), level = "debug")]
    pub async fn mutate(
        &self,
        request: &AdmissionRequest<DynamicObject>,
    ) -> Result<AdmissionResult, MutateError> {
        // A missing object becomes `null`, which is also a decode error.
        let object = serde_json::to_value(&request.object).map_err(MutateError::Decode)?;
        let pod: Pod = serde_json::from_value(object).map_err(MutateError::Decode)?;
        info!(
            namespace = ?pod.metadata.namespace,
            name = ?pod.metadata.name.as_ref().or(pod.metadata.generate_name.as_ref()),
            "checking pod for notebook"
        );

        let decision = evaluate(&pod)?;
        debug!(?decision, "evaluated injection policy");
        if !decision.inject {
            return Ok(AdmissionResult::default());
        }

        let mut patch = vec![];
        for instance in self.registry.iter() {
            patch.extend(self.instance_patches(instance, &decision).await);
        }

        let mut audit_annotations = BTreeMap::new();
        audit_annotations.insert(AUDIT_ANNOTATION.to_owned(), AUDIT_MESSAGE.to_owned());
        Ok(AdmissionResult {
            patch,
            audit_annotations,
        })
    }

    /// Build the mounts for one instance. In embedded mode, an instance whose
    /// credentials we can't fetch gets no mounts.
    async fn instance_patches(
        &self,
        instance: &Instance,
        decision: &InjectionDecision,
    ) -> Vec<PatchOp> {
        let base = format!("/home/{}/minio/{}", self.home_user, instance.short);
        match self.mode {
            MountMode::Reference => build_reference_instance(
                instance,
                &credential_path(&instance.name, &decision.profile),
                DEFAULT_REGION,
                &decision.profile,
                &base,
                decision.container_index,
            ),
            MountMode::Embedded => {
                match resolve_credential(self.store.as_ref(), &instance.name, &decision.profile)
                    .await
                {
                    Ok(credential) => build_embedded_instance(
                        instance,
                        &credential,
                        DEFAULT_REGION,
                        &decision.profile,
                        &base,
                    ),
                    Err(err) => {
                        warn!(instance = %instance.name, "{}", err);
                        vec![]
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{test_pod, CLASSIFICATION_LABEL, INJECT_ANNOTATION, WORKFLOW_LABEL};
    use crate::vault::FakeStore;
    use kube::core::admission::AdmissionReview;
    use serde_json::{json, Value};
    use std::convert::TryInto;

    fn registry() -> Arc<InstanceRegistry> {
        Arc::new(
            InstanceRegistry::from_json(
                r#"[
                  {"name": "minio_standard", "externalUrl": "https://minio-standard.example.ca", "short": "standard"},
                  {"name": "minio_premium", "externalUrl": "https://minio-premium.example.ca", "short": "premium"}
                ]"#,
            )
            .unwrap(),
        )
    }

    fn mutator(mode: MountMode, store: FakeStore) -> Mutator {
        Mutator::new(registry(), Arc::new(store), mode, "jovyan")
    }

    fn request_with(object: Option<Value>) -> AdmissionRequest<DynamicObject> {
        let mut request = json!({
            "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
            "kind": {"group": "", "version": "v1", "kind": "Pod"},
            "resource": {"group": "", "version": "v1", "resource": "pods"},
            "namespace": "team_a",
            "operation": "CREATE",
            "userInfo": {}
        });
        if let Some(object) = object {
            request["object"] = object;
        }
        let review: AdmissionReview<DynamicObject> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": request
        }))
        .unwrap();
        review.try_into().unwrap()
    }

    fn request_for(pod: &Pod) -> AdmissionRequest<DynamicObject> {
        request_with(Some(serde_json::to_value(pod).unwrap()))
    }

    fn credentials_for(profile: &str) -> Value {
        json!({"accessKeyId": format!("{}-access", profile), "secretAccessKey": "s3cr3t"})
    }

    #[tokio::test]
    async fn pods_without_annotation_are_untouched() {
        let pod = test_pod("team-a", &[], &[], &["notebook"]);
        let result = mutator(MountMode::Reference, FakeStore::default())
            .mutate(&request_for(&pod))
            .await
            .unwrap();
        assert!(result.patch.is_empty());
        assert!(result.audit_annotations.is_empty());

        let response = result.into_response(&request_for(&pod)).unwrap();
        assert!(response.allowed);
        assert_eq!(response.uid, "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert_eq!(response.patch, None);
        assert!(response.audit_annotations.is_empty());
    }

    #[tokio::test]
    async fn annotated_pods_get_four_operations_per_instance() {
        let pod = test_pod("team_a", &[(INJECT_ANNOTATION, "true")], &[], &["notebook"]);
        let result = mutator(MountMode::Reference, FakeStore::default())
            .mutate(&request_for(&pod))
            .await
            .unwrap();
        assert_eq!(result.patch.len(), 8);
        assert_eq!(result.audit_annotations[AUDIT_ANNOTATION], AUDIT_MESSAGE);

        let json = serde_json::to_value(to_json_patch(&result.patch).unwrap()).unwrap();
        assert_eq!(json[0]["value"]["name"], "minio-standard-private");
        assert_eq!(json[0]["value"]["flexVolume"]["options"]["bucket"], "team-a");
        assert_eq!(
            json[0]["value"]["flexVolume"]["options"]["vault-path"],
            "minio_standard/keys/profile-team-a"
        );
        assert_eq!(
            json[0]["value"]["flexVolume"]["options"]["endpoint"],
            "https://minio-standard.example.ca"
        );
        assert_eq!(json[1]["value"]["mountPath"], "/home/jovyan/minio/standard/private");
        assert_eq!(json[6]["value"]["name"], "minio-premium-shared");
        assert_eq!(json[7]["value"]["mountPath"], "/home/jovyan/minio/premium/shared");

        // Every volume is immediately followed by its mount.
        for pair in result.patch.chunks(2) {
            assert!(matches!(pair[0], PatchOp::AddVolume(_)));
            assert!(matches!(pair[1], PatchOp::AddVolumeMount { .. }));
            assert_eq!(pair[0].volume_name(), pair[1].volume_name());
        }
    }

    #[tokio::test]
    async fn response_carries_encoded_patch() {
        let pod = test_pod("team-a", &[(INJECT_ANNOTATION, "true")], &[], &["notebook"]);
        let request = request_for(&pod);
        let result = mutator(MountMode::Reference, FakeStore::default())
            .mutate(&request)
            .await
            .unwrap();
        let expected = serde_json::to_value(to_json_patch(&result.patch).unwrap()).unwrap();

        let response = result.into_response(&request).unwrap();
        assert!(response.allowed);
        assert_eq!(response.uid, "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert_eq!(response.audit_annotations[AUDIT_ANNOTATION], AUDIT_MESSAGE);
        let decoded: Value = serde_json::from_slice(response.patch.as_ref().unwrap()).unwrap();
        assert_eq!(decoded, expected);
        assert_eq!(decoded[0]["op"], "add");
        assert_eq!(decoded[0]["path"], "/spec/volumes/-");
        assert_eq!(decoded[1]["path"], "/spec/containers/0/volumeMounts/-");

        let wire = serde_json::to_value(&response).unwrap();
        assert_eq!(wire["patchType"], "JSONPatch");
    }

    #[tokio::test]
    async fn protected_b_pods_are_untouched() {
        let pod = test_pod(
            "team-a",
            &[(INJECT_ANNOTATION, "true")],
            &[(CLASSIFICATION_LABEL, "protected-b")],
            &["notebook"],
        );
        let result = mutator(MountMode::Reference, FakeStore::default())
            .mutate(&request_for(&pod))
            .await
            .unwrap();
        assert!(!result.is_mutated());
        assert!(result.audit_annotations.is_empty());
    }

    #[tokio::test]
    async fn workflow_mounts_target_second_container() {
        let pod = test_pod(
            "team-a",
            &[(INJECT_ANNOTATION, "true")],
            &[(WORKFLOW_LABEL, "wf")],
            &["wait", "main"],
        );
        let result = mutator(MountMode::Reference, FakeStore::default())
            .mutate(&request_for(&pod))
            .await
            .unwrap();
        let mount_paths = result
            .patch
            .iter()
            .filter(|op| matches!(op, PatchOp::AddVolumeMount { .. }))
            .map(PatchOp::path)
            .collect::<Vec<_>>();
        assert_eq!(mount_paths.len(), 4);
        assert!(mount_paths
            .iter()
            .all(|path| path == "/spec/containers/1/volumeMounts/-"));
    }

    #[tokio::test]
    async fn malformed_annotation_fails_the_request() {
        let pod = test_pod("team-a", &[(INJECT_ANNOTATION, "yes")], &[], &["notebook"]);
        let err = mutator(MountMode::Reference, FakeStore::default())
            .mutate(&request_for(&pod))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MutateError::Policy(PolicyError::AnnotationParse { .. })
        ));
        assert_eq!(
            err.to_string(),
            "unable to decode data.statcan.gc.ca/inject-boathouse annotation \"yes\""
        );
    }

    #[tokio::test]
    async fn malformed_pod_fails_the_request() {
        let request = request_with(Some(json!({
            "metadata": {"name": "notebook-0"},
            "spec": {"containers": "not a list"}
        })));
        let err = mutator(MountMode::Reference, FakeStore::default())
            .mutate(&request)
            .await
            .unwrap_err();
        assert!(matches!(err, MutateError::Decode(_)));

        let request = request_with(None);
        let err = mutator(MountMode::Reference, FakeStore::default())
            .mutate(&request)
            .await
            .unwrap_err();
        assert!(matches!(err, MutateError::Decode(_)));
    }

    #[tokio::test]
    async fn embedded_mode_skips_instances_without_credentials() {
        let mut store = FakeStore::default();
        store.secrets.insert(
            "minio_premium/keys/profile-team-a".to_owned(),
            credentials_for("team-a"),
        );
        store.broken.push("minio_standard/keys/profile-team-a".to_owned());

        let pod = test_pod("team_a", &[(INJECT_ANNOTATION, "true")], &[], &["notebook"]);
        let result = mutator(MountMode::Embedded, store)
            .mutate(&request_for(&pod))
            .await
            .unwrap();
        assert_eq!(result.patch.len(), 4);
        assert!(result.audit_annotations.contains_key(AUDIT_ANNOTATION));

        let json = serde_json::to_value(to_json_patch(&result.patch).unwrap()).unwrap();
        assert_eq!(json[0]["value"]["name"], "minio-premium-private");
        let options = &json[0]["value"]["flexVolume"]["options"];
        assert_eq!(options["access-key"], "team-a-access");
        assert_eq!(options["secret-key"], "s3cr3t");
        assert_eq!(json[0]["value"]["flexVolume"]["driver"], "informaticslab/goofys-flex-volume");
    }

    #[tokio::test]
    async fn empty_home_user_gives_clean_mount_paths() {
        let pod = test_pod("team-a", &[(INJECT_ANNOTATION, "true")], &[], &["notebook"]);
        let mutator = Mutator::new(
            registry(),
            Arc::new(FakeStore::default()),
            MountMode::Reference,
            "",
        );
        let result = mutator.mutate(&request_for(&pod)).await.unwrap();
        let json = serde_json::to_value(to_json_patch(&result.patch).unwrap()).unwrap();
        assert_eq!(json[1]["value"]["mountPath"], "/home/minio/standard/private");
    }
}
