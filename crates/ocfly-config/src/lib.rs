//! Configuration for ocfly clients.
//!
//! TOML file plus `OCFLY_` environment overrides, identity material
//! resolution (env + PEM files), and translation to
//! `ocfly_core::ClientConfig`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use ocfly_api::{Addr, TlsIdentity};
use ocfly_core::{ClientConfig, IdentityConfig, RetryConfig};
use rustls_pki_types::CertificateDer;
use rustls_pki_types::pem::PemObject;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no private key configured for the client identity")]
    NoPrivateKey,

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Per-attempt deadline of a device operation, in milliseconds.
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    #[serde(default)]
    pub discovery: Discovery,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Client identity; secured sessions and ownership need it.
    pub identity: Option<Identity>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            operation_timeout_ms: default_operation_timeout_ms(),
            discovery: Discovery::default(),
            retry: RetryConfig::default(),
            identity: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Discovery {
    /// Multicast groups as URIs, e.g. `coap://224.0.1.187:5683`.
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for Discovery {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_operation_timeout_ms() -> u64 {
    millis(ocfly_core::config::DEFAULT_OPERATION_TIMEOUT)
}
fn default_endpoints() -> Vec<String> {
    ocfly_core::config::default_discovery_endpoints()
        .iter()
        .map(ToString::to_string)
        .collect()
}
fn default_channel_capacity() -> usize {
    ocfly_core::config::DEFAULT_DISCOVERY_CHANNEL_CAPACITY
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Client identity material, all PEM.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Identity {
    /// Identity certificate chain, leaf first.
    pub certificate_chain: PathBuf,

    /// PKCS#8 private key file.
    pub private_key: Option<PathBuf>,

    /// Environment variable holding the PEM private key itself.
    pub private_key_env: Option<String>,

    /// CA certificates device identity chains must lead to.
    #[serde(default)]
    pub trust_anchors: Vec<PathBuf>,
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("io", "ocfly", "ocfly").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("ocfly");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load the Config from `path` + environment. A missing file yields the
/// defaults.
///
/// Environment keys nest with a double underscore:
/// `OCFLY_DISCOVERY__CHANNEL_CAPACITY=128`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("OCFLY_").split("__"));

    let config: Config = figment.extract()?;
    tracing::debug!(path = %path.display(), "loaded ocfly config");
    Ok(config)
}

/// Load config, returning a default if it can't be read.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Identity resolution ─────────────────────────────────────────────

fn read(path: &Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolve the private key PEM: env var first, then the key file.
fn resolve_private_key(identity: &Identity) -> Result<SecretString, ConfigError> {
    // 1. Named env var
    if let Some(ref env_name) = identity.private_key_env {
        if let Ok(pem) = std::env::var(env_name) {
            return Ok(SecretString::from(pem));
        }
    }

    // 2. Key file
    if let Some(ref path) = identity.private_key {
        let pem = String::from_utf8(read(path)?).map_err(|_| ConfigError::Validation {
            field: "identity.private_key".into(),
            reason: format!("{} is not PEM text", path.display()),
        })?;
        return Ok(SecretString::from(pem));
    }

    Err(ConfigError::NoPrivateKey)
}

fn load_trust_anchors(paths: &[PathBuf]) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let mut anchors = Vec::new();
    for path in paths {
        let pem = read(path)?;
        let certs = CertificateDer::pem_slice_iter(&pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ConfigError::Validation {
                field: "identity.trust_anchors".into(),
                reason: format!("{}: {e}", path.display()),
            })?;
        if certs.is_empty() {
            return Err(ConfigError::Validation {
                field: "identity.trust_anchors".into(),
                reason: format!("{} holds no certificate", path.display()),
            });
        }
        anchors.extend(certs);
    }
    Ok(anchors)
}

/// Read the identity files into an `IdentityConfig`.
pub fn resolve_identity(identity: &Identity) -> Result<IdentityConfig, ConfigError> {
    let chain = read(&identity.certificate_chain)?;
    let key = resolve_private_key(identity)?;
    let tls = TlsIdentity::from_pem(&chain, key.expose_secret().as_bytes()).map_err(|e| {
        ConfigError::Validation {
            field: "identity".into(),
            reason: e.to_string(),
        }
    })?;

    let identity = IdentityConfig {
        tls: Arc::new(tls),
        trust_anchors: load_trust_anchors(&identity.trust_anchors)?,
    };
    if identity.trust_anchors.is_empty() {
        tracing::warn!("client identity has no trust anchors; secured dials will fail");
    }
    Ok(identity)
}

// ── Translation ─────────────────────────────────────────────────────

impl Config {
    /// Build a `ClientConfig`, reading identity material from disk.
    pub fn to_client_config(&self) -> Result<ClientConfig, ConfigError> {
        let discovery_endpoints = self
            .discovery
            .endpoints
            .iter()
            .map(|uri| {
                Addr::parse(uri).map_err(|e| ConfigError::Validation {
                    field: "discovery.endpoints".into(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if self.discovery.channel_capacity == 0 {
            return Err(ConfigError::Validation {
                field: "discovery.channel_capacity".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.operation_timeout_ms == 0 {
            return Err(ConfigError::Validation {
                field: "operation_timeout_ms".into(),
                reason: "must be positive".into(),
            });
        }

        let identity = self.identity.as_ref().map(resolve_identity).transpose()?;

        Ok(ClientConfig {
            discovery_endpoints,
            operation_timeout: Duration::from_millis(self.operation_timeout_ms),
            retry: self.retry.clone(),
            discovery_channel_capacity: self.discovery.channel_capacity,
            identity,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rcgen::{CertificateParams, DnType, KeyPair};

    fn write_identity(dir: &Path) -> Identity {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, "uuid:3f2b44a6-7d1c-4f07-9d0c-6e0c1c1f8a11");
        let cert = params.self_signed(&key).unwrap();

        let chain = dir.join("identity.pem");
        let private_key = dir.join("identity.key");
        let ca = dir.join("ca.pem");
        std::fs::write(&chain, cert.pem()).unwrap();
        std::fs::write(&private_key, key.serialize_pem()).unwrap();
        std::fs::write(&ca, cert.pem()).unwrap();

        Identity {
            certificate_chain: chain,
            private_key: Some(private_key),
            private_key_env: None,
            trust_anchors: vec![ca],
        }
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());

        let client = config.to_client_config().unwrap();
        assert_eq!(client.discovery_endpoints.len(), 3);
        assert_eq!(client.operation_timeout, Duration::from_secs(10));
        assert!(client.identity.is_none());
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
operation_timeout_ms = 2500

[discovery]
endpoints = ["coap://224.0.1.187:5683"]

[retry]
policy = "fixed"
attempts = 3
delay_ms = 50
"#,
        )
        .unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(
            config.retry,
            RetryConfig::Fixed {
                attempts: 3,
                delay_ms: 50
            }
        );
        assert_eq!(config.discovery.channel_capacity, default_channel_capacity());

        let client = config.to_client_config().unwrap();
        assert_eq!(client.operation_timeout, Duration::from_millis(2500));
        assert_eq!(
            client.discovery_endpoints[0].to_string(),
            "coap://224.0.1.187:5683"
        );
    }

    #[test]
    fn save_then_load_keeps_identity_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config {
            identity: Some(write_identity(dir.path())),
            ..Config::default()
        };
        save_config_to(&config, &path).unwrap();
        assert_eq!(load_config_from(&path).unwrap(), config);
    }

    #[test]
    fn identity_files_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let identity = resolve_identity(&write_identity(dir.path())).unwrap();
        assert_eq!(identity.tls.certificate_chain().len(), 1);
        assert_eq!(identity.trust_anchors.len(), 1);
        assert_eq!(
            identity.sdk_id().unwrap().to_string(),
            "3f2b44a6-7d1c-4f07-9d0c-6e0c1c1f8a11"
        );
    }

    #[test]
    fn identity_without_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut identity = write_identity(dir.path());
        identity.private_key = None;
        identity.private_key_env = Some("OCFLY_TEST_KEY_THAT_IS_NEVER_SET".into());
        assert!(matches!(
            resolve_identity(&identity),
            Err(ConfigError::NoPrivateKey)
        ));
    }

    #[test]
    fn invalid_endpoint_is_a_validation_error() {
        let config = Config {
            discovery: Discovery {
                endpoints: vec!["not a uri".into()],
                channel_capacity: 8,
            },
            ..Config::default()
        };
        let err = config.to_client_config().unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "discovery.endpoints"));
    }
}
