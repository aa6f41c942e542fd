//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Credentials are written as `{ env = "VAR" }` or `{ file = "/path" }`
//! references so the TOML itself can be checked in.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::SecretSource;
use provider::ProviderConfig;
use reqwest::{Method, Url};
use serde::Deserialize;
use token_store::{
    EncryptedFileTokenStore, EncryptedStoreOptions, FileTokenStore, InMemoryTokenStore, KeySource,
    TokenStore,
};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub provider: ProviderConfig,
    #[serde(default)]
    pub store: StoreConfig,
    pub request: RequestConfig,
}

/// Where interactive providers keep their tokens.
#[derive(Debug, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    #[default]
    Memory,
    File {
        path: PathBuf,
    },
    Encrypted {
        path: PathBuf,
        /// Falls back to AUTH_TOKENSTORE_KEY, then a generated key file.
        #[serde(default)]
        passphrase: Option<SecretSource>,
        #[serde(default)]
        associated_data: Option<String>,
    },
}

/// The single request the probe sends.
#[derive(Debug, Deserialize)]
pub struct RequestConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_session")]
    pub session: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_method() -> String {
    "GET".into()
}

fn default_session() -> String {
    provider::DEFAULT_SESSION.into()
}

fn default_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    ///
    /// Provider secrets are resolved later, when the provider is built, so a
    /// missing env var is reported against the provider that needs it.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;

        if config.provider.name.trim().is_empty() {
            return Err(common::Error::Config("provider.name must not be empty".into()));
        }

        let url = Url::parse(&config.request.url).map_err(|e| {
            common::Error::Config(format!("request.url is not a valid URL: {e}"))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(common::Error::Config(format!(
                "request.url must start with http:// or https://, got: {}",
                config.request.url
            )));
        }

        Method::from_bytes(config.request.method.as_bytes()).map_err(|_| {
            common::Error::Config(format!(
                "request.method is not a valid HTTP method: {}",
                config.request.method
            ))
        })?;

        if config.request.timeout_secs == 0 {
            return Err(common::Error::Config(
                "request.timeout_secs must be greater than 0".into(),
            ));
        }

        if config.request.session.trim().is_empty() {
            return Err(common::Error::Config(
                "request.session must not be empty".into(),
            ));
        }

        match &config.store {
            StoreConfig::File { path } | StoreConfig::Encrypted { path, .. }
                if path.as_os_str().is_empty() =>
            {
                return Err(common::Error::Config("store.path must not be empty".into()));
            }
            _ => {}
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("auth-probe.toml")
    }
}

impl RequestConfig {
    pub fn method(&self) -> Method {
        Method::from_bytes(self.method.as_bytes()).unwrap_or(Method::GET)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl StoreConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreConfig::Memory => "memory",
            StoreConfig::File { .. } => "file",
            StoreConfig::Encrypted { .. } => "encrypted",
        }
    }

    /// Open the configured backend. Key material is resolved here.
    pub fn open(&self) -> common::Result<Arc<dyn TokenStore>> {
        let store: Arc<dyn TokenStore> = match self {
            StoreConfig::Memory => Arc::new(InMemoryTokenStore::new()),
            StoreConfig::File { path } => Arc::new(FileTokenStore::new(path)),
            StoreConfig::Encrypted {
                path,
                passphrase,
                associated_data,
            } => {
                let key_source = match passphrase {
                    Some(source) => KeySource::Passphrase(source.resolve()?),
                    None => KeySource::Auto,
                };
                let mut options = EncryptedStoreOptions::new(path).key_source(key_source);
                if let Some(ad) = associated_data {
                    options = options.associated_data(ad.as_bytes());
                }
                let store = EncryptedFileTokenStore::open(options).map_err(|e| {
                    common::Error::Config(format!(
                        "failed to open token store at {}: {e}",
                        path.display()
                    ))
                })?;
                Arc::new(store)
            }
        };
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("auth-probe.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn device_toml() -> &'static str {
        r#"
[provider]
name = "github"

[provider.auth]
type = "device_code"
client_id = "Iv1.abc"
token_endpoint = "https://github.com/login/oauth/access_token"
device_authorization_endpoint = "https://github.com/login/device/code"
scope = "repo"

[store]
kind = "encrypted"
path = "/var/lib/auth-probe/tokens"
passphrase = { env = "AUTH_PROBE_TEST_PASSPHRASE" }
associated_data = "auth-probe"

[request]
url = "https://api.github.com/user"
"#
    }

    #[test]
    fn test_load_device_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, device_toml());

        let config = Config::load(&path).unwrap();
        assert_eq!(config.provider.name, "github");
        assert!(config.provider.auth.is_interactive());
        assert_eq!(config.store.kind(), "encrypted");
        assert_eq!(config.request.method(), Method::GET);
        assert_eq!(config.request.session, "default");
        assert_eq!(config.request.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_store_defaults_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[provider]
name = "static"

[provider.auth]
type = "bearer"
token = "tok"

[request]
url = "http://127.0.0.1:8080/ping"
method = "POST"
session = "alice"
timeout_secs = 5
"#,
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.store.kind(), "memory");
        assert_eq!(config.request.method(), Method::POST);
        assert_eq!(config.request.session, "alice");
        assert_eq!(config.request.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/auth-probe.toml"));
        assert!(matches!(result, Err(common::Error::Io(_))));
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");
        assert!(matches!(Config::load(&path), Err(common::Error::Toml(_))));
    }

    #[test]
    fn test_rejects_non_http_url() {
        let dir = tempfile::tempdir().unwrap();
        let contents = device_toml().replace("https://api.github.com/user", "ftp://example.com/");
        let path = write_config(&dir, &contents);
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("request.url"), "got: {err}");
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let contents = format!("{}timeout_secs = 0\n", device_toml());
        let path = write_config(&dir, &contents);
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("timeout_secs"), "got: {err}");
    }

    #[test]
    fn test_rejects_bad_method() {
        let dir = tempfile::tempdir().unwrap();
        let contents = format!("{}method = \"NOT A METHOD\"\n", device_toml());
        let path = write_config(&dir, &contents);
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("request.method"), "got: {err}");
    }

    #[test]
    fn test_rejects_blank_provider_name() {
        let dir = tempfile::tempdir().unwrap();
        let contents = device_toml().replace("name = \"github\"", "name = \"  \"");
        let path = write_config(&dir, &contents);
        assert!(matches!(Config::load(&path), Err(common::Error::Config(_))));
    }

    #[test]
    fn test_resolve_path_cli_takes_precedence() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/from/env.toml") };
        let path = Config::resolve_path(Some("/from/cli.toml"));
        assert_eq!(path, PathBuf::from("/from/cli.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_resolve_path_env_then_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/from/env.toml") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("/from/env.toml"));

        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("auth-probe.toml"));
    }

    #[tokio::test]
    async fn test_open_encrypted_store_with_env_passphrase() {
        let dir = tempfile::tempdir().unwrap();
        let store_config = StoreConfig::Encrypted {
            path: dir.path().join("tokens"),
            passphrase: Some(SecretSource::Env {
                env: "AUTH_PROBE_TEST_PASSPHRASE".into(),
            }),
            associated_data: Some("auth-probe".into()),
        };

        {
            let _lock = ENV_MUTEX.lock().unwrap();
            unsafe { remove_env("AUTH_PROBE_TEST_PASSPHRASE") };
            let err = store_config.open().err().unwrap();
            assert!(matches!(err, common::Error::MissingEnv(_)));
        }

        let store = {
            let _lock = ENV_MUTEX.lock().unwrap();
            unsafe { set_env("AUTH_PROBE_TEST_PASSPHRASE", "correct horse") };
            let store = store_config.open().unwrap();
            unsafe { remove_env("AUTH_PROBE_TEST_PASSPHRASE") };
            store
        };

        let key = token_store::SessionKey::new("default", "github");
        let token = token_store::TokenData::new("at", Some("rt".into()), Some(1)).unwrap();
        store.save(&key, &token).await.unwrap();
        assert_eq!(store.get(&key).await, Some(token));
    }

    #[tokio::test]
    async fn test_open_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreConfig::File {
            path: dir.path().to_path_buf(),
        }
        .open()
        .unwrap();
        let key = token_store::SessionKey::new("default", "github");
        assert_eq!(store.get(&key).await, None);
    }
}
