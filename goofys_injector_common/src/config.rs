//! Runtime configuration, read from the environment.

use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use crate::prelude::*;

/// How injected volumes obtain their storage credentials.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MountMode {
    /// Volumes carry a Vault path, and the `boathouse` driver fetches
    /// credentials itself when the pod starts.
    Reference,
    /// We fetch credentials from Vault at admission time and embed them in
    /// the volume options of the legacy goofys driver.
    Embedded,
}

impl Default for MountMode {
    fn default() -> Self {
        MountMode::Reference
    }
}

impl FromStr for MountMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reference" => Ok(MountMode::Reference),
            "embedded" => Ok(MountMode::Embedded),
            _ => Err(format_err!(
                "unknown mount mode {:?} (expected \"reference\" or \"embedded\")",
                s
            )),
        }
    }
}

impl fmt::Display for MountMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match *self {
            MountMode::Reference => "reference",
            MountMode::Embedded => "embedded",
        };
        s.fmt(f)
    }
}

/// Certificate and key used to serve HTTPS.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TlsConfig {
    /// PEM-encoded certificate chain.
    pub cert_path: PathBuf,
    /// PEM-encoded private key.
    pub key_path: PathBuf,
}

/// Everything the webhook needs to know at startup.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address to listen on.
    pub listen: SocketAddr,
    /// JSON file listing our storage instances.
    pub instances_path: PathBuf,
    /// Which volume driver to inject.
    pub mount_mode: MountMode,
    /// The user whose home directory receives the mounts.
    pub home_user: String,
    /// Serve HTTPS with these files, or plain HTTP when absent.
    pub tls: Option<TlsConfig>,
    /// Base URL of the Vault server.
    pub vault_addr: String,
    /// Token sent to Vault, if any.
    pub vault_token: Option<String>,
    /// Upper bound on a single Vault request.
    pub vault_timeout: Duration,
}

impl Config {
    /// Read our configuration from the process environment.
    pub fn from_env() -> Result<Config> {
        Config::from_lookup(|name| env::var(name).ok())
    }

    /// Build a configuration using `lookup` to fetch variables. Unset
    /// variables fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen = lookup("GOOFYS_INJECTOR_LISTEN")
            .unwrap_or_else(|| "0.0.0.0:8443".to_owned());
        let listen = listen
            .parse::<SocketAddr>()
            .with_context(|| format!("could not parse listen address {:?}", listen))?;

        let mount_mode = match lookup("GOOFYS_INJECTOR_MOUNT_MODE") {
            Some(mode) => mode.parse()?,
            None => MountMode::default(),
        };

        let tls = match (
            lookup("GOOFYS_INJECTOR_TLS_CERT"),
            lookup("GOOFYS_INJECTOR_TLS_KEY"),
        ) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                cert_path: cert.into(),
                key_path: key.into(),
            }),
            (None, None) => None,
            _ => {
                return Err(format_err!(
                    "GOOFYS_INJECTOR_TLS_CERT and GOOFYS_INJECTOR_TLS_KEY must be set together"
                ))
            }
        };

        let vault_timeout = match lookup("VAULT_TIMEOUT") {
            Some(timeout) => humantime::parse_duration(&timeout)
                .with_context(|| format!("could not parse VAULT_TIMEOUT {:?}", timeout))?,
            None => Duration::from_secs(5),
        };

        Ok(Config {
            listen,
            instances_path: lookup("GOOFYS_INJECTOR_INSTANCES")
                .unwrap_or_else(|| "/instances.json".to_owned())
                .into(),
            mount_mode,
            home_user: lookup("GOOFYS_INJECTOR_HOME_USER")
                .unwrap_or_else(|| "jovyan".to_owned()),
            tls,
            vault_addr: lookup("VAULT_ADDR")
                .unwrap_or_else(|| "http://127.0.0.1:8200".to_owned()),
            vault_token: lookup("VAULT_TOKEN").filter(|token| !token.is_empty()),
            vault_timeout,
        })
    }
}

#[cfg(test)]
fn lookup_from<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
    move |name| {
        vars.iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| (*value).to_owned())
    }
}

#[test]
fn defaults_apply_when_unset() {
    let config = Config::from_lookup(lookup_from(&[])).expect("default config");
    assert_eq!(config.listen, "0.0.0.0:8443".parse::<SocketAddr>().unwrap());
    assert_eq!(config.instances_path, Path::new("/instances.json"));
    assert_eq!(config.mount_mode, MountMode::Reference);
    assert_eq!(config.home_user, "jovyan");
    assert_eq!(config.tls, None);
    assert_eq!(config.vault_token, None);
    assert_eq!(config.vault_timeout, Duration::from_secs(5));
}

#[test]
fn overrides_are_parsed() {
    let config = Config::from_lookup(lookup_from(&[
        ("GOOFYS_INJECTOR_LISTEN", "127.0.0.1:9000"),
        ("GOOFYS_INJECTOR_MOUNT_MODE", "embedded"),
        ("GOOFYS_INJECTOR_TLS_CERT", "/certs/tls.crt"),
        ("GOOFYS_INJECTOR_TLS_KEY", "/certs/tls.key"),
        ("VAULT_TOKEN", "s.abc"),
        ("VAULT_TIMEOUT", "1500ms"),
    ]))
    .expect("config");
    assert_eq!(config.listen.port(), 9000);
    assert_eq!(config.mount_mode, MountMode::Embedded);
    assert_eq!(
        config.tls,
        Some(TlsConfig {
            cert_path: "/certs/tls.crt".into(),
            key_path: "/certs/tls.key".into(),
        })
    );
    assert_eq!(config.vault_token.as_deref(), Some("s.abc"));
    assert_eq!(config.vault_timeout, Duration::from_millis(1500));
}

#[test]
fn bad_values_are_rejected() {
    assert!(Config::from_lookup(lookup_from(&[("GOOFYS_INJECTOR_MOUNT_MODE", "inline")])).is_err());
    assert!(Config::from_lookup(lookup_from(&[("GOOFYS_INJECTOR_TLS_CERT", "/tls.crt")])).is_err());
    assert!(Config::from_lookup(lookup_from(&[("VAULT_TIMEOUT", "soon")])).is_err());
}
