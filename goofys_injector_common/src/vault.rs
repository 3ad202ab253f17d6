//! Looking up MinIO credentials in Vault.

use async_trait::async_trait;
use reqwest::{header::HeaderValue, StatusCode};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::prelude::*;

/// The data stored in a secret, as a JSON object.
pub type SecretData = Map<String, Value>;

/// Something we can read secrets from. In production this is Vault, but tests
/// substitute an in-memory store.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Read the secret at `path`. Returns `Ok(None)` if there is no such
    /// secret.
    async fn read(&self, path: &str) -> Result<Option<SecretData>>;
}

/// A pair of MinIO credentials. These are never logged, so our `Debug`
/// implementation hides them.
#[derive(Clone, Eq, PartialEq)]
pub struct Credential {
    /// The MinIO access key.
    pub access_key: String,
    /// The MinIO secret key.
    pub secret_key: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_key", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// We could not get usable credentials for a profile on one instance. This is
/// not fatal to a request: the instance is just skipped.
#[derive(Debug, Error)]
#[error("unable to obtain MinIO token at {mount}/{profile}: {reason}")]
pub struct CredentialLookupError {
    /// The Vault mount we looked in.
    pub mount: String,
    /// The profile we looked up.
    pub profile: String,
    /// What went wrong.
    pub reason: String,
}

/// The Vault path holding the credentials of `profile` on the instance mounted
/// at `mount`.
pub fn credential_path(mount: &str, profile: &str) -> String {
    format!("{}/keys/profile-{}", mount, profile)
}

/// Fetch the MinIO credentials of `profile` from the Vault mount `mount`.
#[tracing::instrument(skip(store), level = "debug")]
pub async fn resolve_credential(
    store: &dyn SecretStore,
    mount: &str,
    profile: &str,
) -> std::result::Result<Credential, CredentialLookupError> {
    let lookup_error = |reason: String| CredentialLookupError {
        mount: mount.to_owned(),
        profile: profile.to_owned(),
        reason,
    };

    let path = credential_path(mount, profile);
    let data = match store.read(&path).await {
        Ok(Some(data)) => data,
        Ok(None) => return Err(lookup_error(format!("no secret at {}", path))),
        Err(err) => return Err(lookup_error(format!("{:#}", err))),
    };

    let field = |name: &str| match data.get(name) {
        Some(Value::String(value)) => Ok(value.clone()),
        Some(_) => Err(lookup_error(format!("{} is not a string", name))),
        None => Err(lookup_error(format!("{} is missing", name))),
    };
    Ok(Credential {
        access_key: field("accessKeyId")?,
        secret_key: field("secretAccessKey")?,
    })
}

/// Body of a Vault read response. We only care about `data`.
#[derive(Debug, Deserialize)]
struct ReadResponse {
    data: SecretData,
}

/// A minimal client for Vault's HTTP API. Cloning is cheap, and clones share
/// a connection pool.
#[derive(Clone)]
pub struct VaultClient {
    client: reqwest::Client,
    addr: Url,
    token: Option<HeaderValue>,
}

impl VaultClient {
    /// Create a client talking to the Vault server at `addr`. Every request
    /// gives up after `timeout`.
    pub fn new(addr: &str, token: Option<&str>, timeout: Duration) -> Result<Self> {
        let mut addr = Url::parse(addr)
            .with_context(|| format!("could not parse Vault address {:?}", addr))?;
        if !addr.path().ends_with('/') {
            let path = format!("{}/", addr.path());
            addr.set_path(&path);
        }
        let token = token
            .map(|token| {
                let mut value = HeaderValue::from_str(token)
                    .context("Vault token is not a valid header value")?;
                value.set_sensitive(true);
                Ok::<_, Error>(value)
            })
            .transpose()?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("could not build Vault HTTP client")?;
        Ok(VaultClient {
            client,
            addr,
            token,
        })
    }

    /// Create a client from our configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            &config.vault_addr,
            config.vault_token.as_deref(),
            config.vault_timeout,
        )
    }
}

impl fmt::Debug for VaultClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultClient")
            .field("addr", &self.addr.as_str())
            .finish()
    }
}

#[async_trait]
impl SecretStore for VaultClient {
    async fn read(&self, path: &str) -> Result<Option<SecretData>> {
        let url = self
            .addr
            .join(&format!("v1/{}", path.trim_start_matches('/')))
            .with_context(|| format!("could not build Vault URL for {}", path))?;
        trace!(%url, "reading secret");

        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.header("X-Vault-Token", token.clone());
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("error reading {} from Vault", path))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body = response
                    .json::<ReadResponse>()
                    .await
                    .with_context(|| format!("error parsing Vault response for {}", path))?;
                Ok(Some(body.data))
            }
            status => Err(format_err!(
                "Vault returned {} when reading {}",
                status,
                path
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    /// An in-memory secret store. Paths listed in `broken` fail as if Vault
    /// were unreachable.
    #[derive(Default)]
    pub(crate) struct FakeStore {
        pub(crate) secrets: HashMap<String, Value>,
        pub(crate) broken: Vec<String>,
    }

    #[async_trait]
    impl SecretStore for FakeStore {
        async fn read(&self, path: &str) -> Result<Option<SecretData>> {
            if self.broken.iter().any(|broken| broken == path) {
                return Err(format_err!("connection refused"));
            }
            Ok(self
                .secrets
                .get(path)
                .and_then(|value| value.as_object().cloned()))
        }
    }

    fn store_with(path: &str, data: Value) -> FakeStore {
        let mut store = FakeStore::default();
        store.secrets.insert(path.to_owned(), data);
        store
    }

    #[tokio::test]
    async fn resolves_credentials_from_profile_path() {
        let store = store_with(
            "minio_standard/keys/profile-team-a",
            json!({"accessKeyId": "AKIA", "secretAccessKey": "s3cr3t"}),
        );
        let credential = resolve_credential(&store, "minio_standard", "team-a")
            .await
            .expect("lookup failed");
        assert_eq!(credential.access_key, "AKIA");
        assert_eq!(credential.secret_key, "s3cr3t");
        assert!(!format!("{:?}", credential).contains("s3cr3t"));
    }

    #[tokio::test]
    async fn missing_secret_is_a_lookup_error() {
        let store = FakeStore::default();
        let err = resolve_credential(&store, "minio_standard", "team-a")
            .await
            .unwrap_err();
        assert_eq!(err.mount, "minio_standard");
        assert_eq!(err.profile, "team-a");
    }

    #[tokio::test]
    async fn malformed_secret_is_a_lookup_error() {
        let store = store_with(
            "minio_standard/keys/profile-team-a",
            json!({"accessKeyId": "AKIA", "secretAccessKey": 42}),
        );
        let err = resolve_credential(&store, "minio_standard", "team-a")
            .await
            .unwrap_err();
        assert!(err.reason.contains("secretAccessKey"));

        let store = store_with(
            "minio_standard/keys/profile-team-a",
            json!({"secretAccessKey": "s3cr3t"}),
        );
        let err = resolve_credential(&store, "minio_standard", "team-a")
            .await
            .unwrap_err();
        assert!(err.reason.contains("accessKeyId"));
    }

    #[tokio::test]
    async fn transport_failure_is_a_lookup_error() {
        let store = FakeStore {
            broken: vec!["minio_standard/keys/profile-team-a".to_owned()],
            ..FakeStore::default()
        };
        let err = resolve_credential(&store, "minio_standard", "team-a")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn vault_client_reads_secret_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/minio_standard/keys/profile-team-a"))
            .and(header("X-Vault-Token", "s.token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "request_id": "3f1c",
                "lease_duration": 3600,
                "data": {"accessKeyId": "AKIA", "secretAccessKey": "s3cr3t"}
            })))
            .mount(&server)
            .await;

        let client = VaultClient::new(&server.uri(), Some("s.token"), Duration::from_secs(5))
            .expect("client");
        let data = client
            .read("minio_standard/keys/profile-team-a")
            .await
            .expect("read failed")
            .expect("secret missing");
        assert_eq!(data["accessKeyId"], "AKIA");
    }

    #[tokio::test]
    async fn vault_client_maps_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/minio_standard/keys/profile-nobody"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/minio_standard/keys/profile-forbidden"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let client =
            VaultClient::new(&server.uri(), None, Duration::from_secs(5)).expect("client");
        assert!(client
            .read("minio_standard/keys/profile-nobody")
            .await
            .expect("404 should not be an error")
            .is_none());
        assert!(client
            .read("minio_standard/keys/profile-forbidden")
            .await
            .is_err());
    }
}

#[cfg(test)]
pub(crate) use self::tests::FakeStore;
