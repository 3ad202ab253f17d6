//! A mutating admission webhook which mounts MinIO buckets into notebook pods.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use goofys_injector_common::{
    errors::DisplayCausesExt,
    goofys_injector_common_version,
    kube::core::{
        admission::{AdmissionRequest, AdmissionReview},
        DynamicObject,
    },
    mutate::Mutator,
    prelude::*,
    tracing_support::initialize_tracing,
    vault::{SecretStore, VaultClient},
};
use std::{convert::TryInto, process};

mod util;

use util::{InjectordError, InjectordResult};

/// Return our `goofys_injector_common` version.
async fn version() -> &'static str {
    goofys_injector_common_version()
}

/// Tell Kubernetes we're alive.
async fn healthz() -> &'static str {
    "ok"
}

/// Answer an `AdmissionReview` from the API server.
#[tracing::instrument(skip_all, fields(uid), level = "debug")]
async fn mutate(
    State(mutator): State<Arc<Mutator>>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> InjectordResult<Json<AdmissionReview<DynamicObject>>> {
    let request: AdmissionRequest<DynamicObject> = review
        .try_into()
        .map_err(|err| InjectordError::BadRequest(Error::from(err)))?;
    tracing::Span::current().record("uid", &request.uid.as_str());

    let result = mutator.mutate(&request).await.map_err(Error::from)?;
    if result.is_mutated() {
        info!(
            uid = %request.uid,
            operations = result.patch.len(),
            "added MinIO volume mounts"
        );
    }
    let response = result.into_response(&request).map_err(Error::from)?;
    Ok(Json(response.into_review()))
}

/// Build our HTTP routes.
fn app(mutator: Arc<Mutator>) -> Router {
    Router::new()
        .route("/mutate", post(mutate))
        .route("/version", get(version))
        .route("/healthz", get(healthz))
        .with_state(mutator)
}

/// Load our configuration and serve until something goes wrong.
async fn run() -> Result<()> {
    let config = Config::from_env()?;
    let registry = Arc::new(InstanceRegistry::load(&config.instances_path)?);
    let store: Arc<dyn SecretStore> = Arc::new(VaultClient::from_config(&config)?);
    let mutator = Arc::new(Mutator::new(
        registry,
        store,
        config.mount_mode,
        &config.home_user,
    ));
    let service = app(mutator).into_make_service();

    info!(
        listen = %config.listen,
        mount_mode = %config.mount_mode,
        tls = config.tls.is_some(),
        "starting goofys-injectord"
    );
    match &config.tls {
        Some(tls) => {
            let rustls = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
                .await
                .with_context(|| {
                    format!(
                        "could not load TLS certificate {} and key {}",
                        tls.cert_path.display(),
                        tls.key_path.display()
                    )
                })?;
            axum_server::bind_rustls(config.listen, rustls)
                .serve(service)
                .await
                .context("HTTPS server failed")?;
        }
        None => {
            warn!("no TLS certificate configured, serving plain HTTP");
            axum_server::bind(config.listen)
                .serve(service)
                .await
                .context("HTTP server failed")?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    initialize_tracing();
    if let Err(err) = run().await {
        error!("{}", err.display_causes_and_backtrace());
        process::exit(1);
    }
}
