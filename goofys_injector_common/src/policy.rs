//! Deciding whether a pod gets MinIO mounts, and where they go.

use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;

use crate::prelude::*;

/// Annotation users set to ask for MinIO mounts.
pub const INJECT_ANNOTATION: &str = "data.statcan.gc.ca/inject-boathouse";

/// Label Argo puts on every pod belonging to a workflow.
pub const WORKFLOW_LABEL: &str = "workflows.argoproj.io/workflow";

/// Name of the sidecar Argo places first in workflow pods.
pub const WORKFLOW_WAIT_CONTAINER: &str = "wait";

/// Label carrying the data classification of a pod.
pub const CLASSIFICATION_LABEL: &str = "data.statcan.gc.ca/classification";

/// Classification which never gets MinIO mounts. `boathouse` doesn't support
/// Protected B storage yet.
pub const PROTECTED_B: &str = "protected-b";

/// A pod whose metadata we can't make sense of.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Our injection annotation was not a boolean.
    #[error("unable to decode {annotation} annotation {value:?}")]
    AnnotationParse {
        /// The annotation we tried to parse.
        annotation: &'static str,
        /// What we found there.
        value: String,
    },
}

/// What we decided to do with a pod.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InjectionDecision {
    /// Should we add mounts at all?
    pub inject: bool,
    /// Index of the container that receives the mounts.
    pub container_index: usize,
    /// The storage profile of the pod, derived from its namespace.
    pub profile: String,
}

/// Convert a namespace into a profile name. Profile names can't contain
/// underscores.
pub fn profile_name(namespace: &str) -> String {
    namespace.replace('_', "-")
}

/// Parse a boolean using the same spellings as Go's `strconv.ParseBool`,
/// which is what users of this annotation have always been able to write.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// Decide whether and where to inject mounts into `pod`.
pub fn evaluate(pod: &Pod) -> Result<InjectionDecision, PolicyError> {
    let metadata = &pod.metadata;
    let profile = profile_name(metadata.namespace.as_deref().unwrap_or_default());
    let mut inject = false;
    let mut container_index = 0;

    let annotation = metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(INJECT_ANNOTATION));
    if let Some(value) = annotation {
        inject = parse_bool(value).ok_or_else(|| PolicyError::AnnotationParse {
            annotation: INJECT_ANNOTATION,
            value: value.clone(),
        })?;
    }

    let labels = metadata.labels.as_ref();
    if labels.map_or(false, |labels| labels.contains_key(WORKFLOW_LABEL)) {
        // Argo puts its `wait` sidecar first, and the user's code second.
        let first_container = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.containers.first())
            .map(|container| container.name.as_str());
        if first_container == Some(WORKFLOW_WAIT_CONTAINER) {
            container_index = 1;
        }
    }

    // This must stay last: nothing may re-enable injection for Protected B.
    let classification = labels.and_then(|labels| labels.get(CLASSIFICATION_LABEL));
    if classification.map(String::as_str) == Some(PROTECTED_B) {
        if inject {
            debug!(
                namespace = ?metadata.namespace,
                name = ?metadata.name,
                "not injecting into protected-b pod"
            );
        }
        inject = false;
    }

    Ok(InjectionDecision {
        inject,
        container_index,
        profile,
    })
}

#[cfg(test)]
pub(crate) fn test_pod(
    namespace: &str,
    annotations: &[(&str, &str)],
    labels: &[(&str, &str)],
    containers: &[&str],
) -> Pod {
    let annotations: BTreeMap<&str, &str> = annotations.iter().cloned().collect();
    let labels: BTreeMap<&str, &str> = labels.iter().cloned().collect();
    let containers: Vec<_> = containers
        .iter()
        .map(|name| serde_json::json!({ "name": name }))
        .collect();
    serde_json::from_value(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": "notebook-0",
            "namespace": namespace,
            "annotations": annotations,
            "labels": labels,
        },
        "spec": { "containers": containers },
    }))
    .expect("invalid test pod")
}

#[test]
fn no_annotation_means_no_injection() {
    let pod = test_pod("team-a", &[], &[], &["notebook"]);
    let decision = evaluate(&pod).unwrap();
    assert!(!decision.inject);
    assert_eq!(decision.container_index, 0);
}

#[test]
fn annotation_accepts_go_booleans() {
    for &(value, expected) in &[("true", true), ("True", true), ("1", true), ("false", false), ("F", false)] {
        let pod = test_pod("team-a", &[(INJECT_ANNOTATION, value)], &[], &["notebook"]);
        assert_eq!(evaluate(&pod).unwrap().inject, expected, "value {:?}", value);
    }
}

#[test]
fn malformed_annotation_is_an_error() {
    let pod = test_pod("team-a", &[(INJECT_ANNOTATION, "yes")], &[], &["notebook"]);
    match evaluate(&pod) {
        Err(PolicyError::AnnotationParse { value, .. }) => assert_eq!(value, "yes"),
        other => panic!("expected an annotation error, got {:?}", other),
    }
}

#[test]
fn namespace_underscores_become_hyphens() {
    let pod = test_pod("team_a_b", &[], &[], &["notebook"]);
    assert_eq!(evaluate(&pod).unwrap().profile, "team-a-b");
}

#[test]
fn workflow_pods_mount_on_the_user_container() {
    let labels = &[(WORKFLOW_LABEL, "my-workflow")];
    let pod = test_pod("team-a", &[(INJECT_ANNOTATION, "true")], labels, &["wait", "main"]);
    assert_eq!(evaluate(&pod).unwrap().container_index, 1);

    let pod = test_pod("team-a", &[(INJECT_ANNOTATION, "true")], labels, &["main", "wait"]);
    assert_eq!(evaluate(&pod).unwrap().container_index, 0);

    let pod = test_pod("team-a", &[(INJECT_ANNOTATION, "true")], labels, &[]);
    assert_eq!(evaluate(&pod).unwrap().container_index, 0);
}

#[test]
fn wait_container_outside_workflows_is_ignored() {
    let pod = test_pod("team-a", &[(INJECT_ANNOTATION, "true")], &[], &["wait", "main"]);
    assert_eq!(evaluate(&pod).unwrap().container_index, 0);
}

#[test]
fn protected_b_always_wins() {
    let labels = &[(CLASSIFICATION_LABEL, PROTECTED_B), (WORKFLOW_LABEL, "wf")];
    let pod = test_pod("team-a", &[(INJECT_ANNOTATION, "true")], labels, &["wait", "main"]);
    assert!(!evaluate(&pod).unwrap().inject);

    let labels = &[(CLASSIFICATION_LABEL, "unclassified")];
    let pod = test_pod("team-a", &[(INJECT_ANNOTATION, "true")], labels, &["notebook"]);
    assert!(evaluate(&pod).unwrap().inject);
}
