// Persisted settings and typed configuration

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::Url;

use super::errors::ConfigError;
use super::models::DownloadMode;

pub const KEY_AUTH_CREDENTIAL: &str = "authCredential";
pub const KEY_REQUEST_TEMPLATE: &str = "customRequestTemplate";
pub const KEY_API_URL: &str = "customAPIURL";
pub const KEY_API_KEY: &str = "customAPIKey";
pub const KEY_AUTH_SCHEME: &str = "customAuthScheme";
pub const KEY_BACKGROUND_DISABLED: &str = "backgroundDownloadsDisabled";
pub const KEY_AUTH_SERVER: &str = "authServerURL";
pub const KEY_PROXY_URL: &str = "proxyURL";

/// Placeholder base URL of the managed-auth server; deployments set
/// `authServerURL`.
pub const DEFAULT_AUTH_SERVER: &str = "https://nickel-auth.invalid/";

/// Upstream API the managed-auth server forwards to
pub const DEFAULT_UPSTREAM_API: &str = "https://api.cobalt.tools/";

const DEFAULT_AUTH_SCHEME: &str = "Api-Key";

/// String key-value storage that survives app restarts
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> Result<(), ConfigError>;

    fn remove(&self, key: &str) -> Result<(), ConfigError>;

    fn get_bool(&self, key: &str) -> bool {
        matches!(self.get(key).as_deref(), Some("true") | Some("1"))
    }
}

/// In-memory store (tests, ephemeral sessions)
#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.values.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), ConfigError> {
        self.values.write().remove(key);
        Ok(())
    }
}

/// Store backed by one JSON object file
pub struct JsonFileStore {
    path: PathBuf,
    values: RwLock<Map<String, Value>>,
}

impl JsonFileStore {
    /// Open (or lazily create) the store at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(content) if !content.trim().is_empty() => {
                match serde_json::from_str::<Value>(&content)? {
                    Value::Object(map) => map,
                    _ => {
                        return Err(ConfigError::InvalidTemplate(format!(
                            "{} does not contain a JSON object",
                            path.display()
                        )))
                    }
                }
            }
            Ok(_) => Map::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("Opened settings store at {}", path.display());
        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    /// `<config dir>/nickel-downloader/settings.json`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("nickel-downloader")
            .join("settings.json")
    }

    fn persist(&self, values: &Map<String, Value>) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(values)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        match self.values.read().get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut values = self.values.write();
        values.insert(key.to_string(), Value::String(value.to_string()));
        self.persist(&values)
    }

    fn remove(&self, key: &str) -> Result<(), ConfigError> {
        let mut values = self.values.write();
        if values.remove(key).is_some() {
            self.persist(&values)?;
        }
        Ok(())
    }
}

/// How requests to the API are authorized
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Attestation-backed short-lived credential from the auth server
    Managed,
    /// `Authorization: <scheme> <key>`
    ApiKey { scheme: String, key: String },
    None,
}

/// Typed view of the API-related settings
#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub auth_method: AuthMethod,
    /// Custom API endpoint, only used when auth is not managed
    pub custom_api_url: Option<Url>,
    pub auth_server: Url,
    /// Sent as `api-url` to the auth server in managed mode
    pub upstream_api_url: String,
}

impl ApiSettings {
    pub fn load(store: &dyn KeyValueStore) -> Result<Self, ConfigError> {
        let custom_api_url = match store.get(KEY_API_URL).filter(|s| !s.trim().is_empty()) {
            Some(raw) => Some(
                Url::parse(raw.trim()).map_err(|_| ConfigError::InvalidApiUrl(raw.clone()))?,
            ),
            None => None,
        };

        let auth_method = match (&custom_api_url, store.get(KEY_API_KEY)) {
            (None, _) => AuthMethod::Managed,
            (Some(_), Some(key)) if !key.trim().is_empty() => AuthMethod::ApiKey {
                scheme: store
                    .get(KEY_AUTH_SCHEME)
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_AUTH_SCHEME.to_string()),
                key: key.trim().to_string(),
            },
            (Some(_), _) => AuthMethod::None,
        };

        let auth_server = match store.get(KEY_AUTH_SERVER).filter(|s| !s.trim().is_empty()) {
            Some(raw) => parse_base_url(&raw)?,
            None => parse_base_url(DEFAULT_AUTH_SERVER)?,
        };

        Ok(Self {
            auth_method,
            custom_api_url,
            auth_server,
            upstream_api_url: DEFAULT_UPSTREAM_API.to_string(),
        })
    }
}

/// Parse a base URL, making sure relative joins stay below its path
fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let trimmed = raw.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{}/", trimmed)
    };
    Url::parse(&with_slash).map_err(|_| ConfigError::InvalidApiUrl(raw.to_string()))
}

/// Request body template. Known keys are typed; anything else a custom
/// template carries is kept in `extra` and sent as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_quality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_bitrate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename_style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_mode: Option<DownloadMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub youtube_video_codec: Option<String>,
    #[serde(default, rename = "youtubeHLS", skip_serializing_if = "Option::is_none")]
    pub youtube_hls: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub always_proxy: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_processing: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for RequestTemplate {
    fn default() -> Self {
        Self {
            video_quality: Some("1080".to_string()),
            audio_format: Some("mp3".to_string()),
            audio_bitrate: Some("128".to_string()),
            filename_style: Some("basic".to_string()),
            download_mode: Some(DownloadMode::Auto),
            youtube_video_codec: Some("h264".to_string()),
            youtube_hls: Some(false),
            always_proxy: Some(false),
            local_processing: Some("preferred".to_string()),
            extra: Map::new(),
        }
    }
}

impl RequestTemplate {
    /// Parse and validate a stored custom template
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| ConfigError::InvalidTemplate(e.to_string()))?;
        let Value::Object(mut map) = value else {
            return Err(ConfigError::InvalidTemplate(
                "template must be a JSON object".to_string(),
            ));
        };

        for reserved in ["url", "api-url"] {
            if map.remove(reserved).is_some() {
                warn!("Ignoring reserved key `{}` in custom request template", reserved);
            }
        }

        serde_json::from_value(Value::Object(map))
            .map_err(|e| ConfigError::InvalidTemplate(e.to_string()))
    }

    /// Stored custom template, or the built-in default when none is stored
    pub fn load(store: &dyn KeyValueStore) -> Result<Self, ConfigError> {
        match store.get(KEY_REQUEST_TEMPLATE).filter(|s| !s.trim().is_empty()) {
            Some(raw) => Self::from_json(&raw),
            None => Ok(Self::default()),
        }
    }

    pub fn to_body(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Transfer engine configuration
#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Shared, periodically cleared download area
    pub scratch_dir: PathBuf,
    /// Start transfers on the background transport first
    pub background_enabled: bool,
    pub connect_timeout: Duration,
    /// Longest silence tolerated between two body chunks
    pub read_timeout: Duration,
    /// HTTP or SOCKS5 proxy for all traffic
    pub proxy: Option<String>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            scratch_dir: cache_root().join("scratch"),
            background_enabled: true,
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            proxy: None,
        }
    }
}

impl TransferSettings {
    pub fn load(store: &dyn KeyValueStore) -> Self {
        Self {
            background_enabled: !store.get_bool(KEY_BACKGROUND_DISABLED),
            proxy: store.get(KEY_PROXY_URL).filter(|p| !p.trim().is_empty()),
            ..Self::default()
        }
    }

    pub fn with_scratch_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.scratch_dir = dir.as_ref().to_path_buf();
        self
    }
}

/// Local processing pipeline configuration
#[derive(Debug, Clone)]
pub struct ProcessingSettings {
    /// Where exported files are written
    pub output_dir: PathBuf,
    /// Cancellation/progress polling interval during exports
    pub poll_interval: Duration,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            output_dir: cache_root().join("processed"),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl ProcessingSettings {
    pub fn with_output_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.output_dir = dir.as_ref().to_path_buf();
        self
    }
}

fn cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("nickel-downloader")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_managed_auth_without_custom_url() {
        let store = MemoryStore::new();
        let settings = ApiSettings::load(&store).unwrap();
        assert_eq!(settings.auth_method, AuthMethod::Managed);
        assert!(settings.custom_api_url.is_none());
    }

    #[test]
    fn test_key_auth_with_default_scheme() {
        let store = MemoryStore::new();
        store.set(KEY_API_URL, "https://cobalt.example/").unwrap();
        store.set(KEY_API_KEY, " secret ").unwrap();
        let settings = ApiSettings::load(&store).unwrap();
        assert_eq!(
            settings.auth_method,
            AuthMethod::ApiKey {
                scheme: "Api-Key".to_string(),
                key: "secret".to_string()
            }
        );

        store.set(KEY_AUTH_SCHEME, "Bearer").unwrap();
        let settings = ApiSettings::load(&store).unwrap();
        assert!(matches!(
            settings.auth_method,
            AuthMethod::ApiKey { scheme, .. } if scheme == "Bearer"
        ));
    }

    #[test]
    fn test_auth_server_override_is_a_base() {
        let store = MemoryStore::new();
        store.set(KEY_AUTH_SERVER, "https://auth.example/v1").unwrap();
        let settings = ApiSettings::load(&store).unwrap();
        assert_eq!(
            settings.auth_server.join("ios-challenge").unwrap().as_str(),
            "https://auth.example/v1/ios-challenge"
        );
    }

    #[test]
    fn test_custom_url_without_key_has_no_auth() {
        let store = MemoryStore::new();
        store.set(KEY_API_URL, "https://cobalt.example/").unwrap();
        let settings = ApiSettings::load(&store).unwrap();
        assert_eq!(settings.auth_method, AuthMethod::None);
    }

    #[test]
    fn test_invalid_custom_url_rejected() {
        let store = MemoryStore::new();
        store.set(KEY_API_URL, "not a url").unwrap();
        assert!(matches!(
            ApiSettings::load(&store),
            Err(ConfigError::InvalidApiUrl(_))
        ));
    }

    #[test]
    fn test_template_keeps_extra_and_drops_reserved() {
        let template = RequestTemplate::from_json(
            r#"{"videoQuality":"720","url":"x","api-url":"y","tiktokFullAudio":true}"#,
        )
        .unwrap();
        assert_eq!(template.video_quality.as_deref(), Some("720"));
        assert_eq!(template.extra.get("tiktokFullAudio"), Some(&Value::Bool(true)));

        let body = template.to_body();
        assert!(!body.contains_key("url"));
        assert!(!body.contains_key("api-url"));
        assert_eq!(body.get("videoQuality"), Some(&Value::String("720".into())));
    }

    #[test]
    fn test_template_must_be_object() {
        assert!(matches!(
            RequestTemplate::from_json("[1,2]"),
            Err(ConfigError::InvalidTemplate(_))
        ));
        assert!(matches!(
            RequestTemplate::from_json(r#"{"downloadMode":"sideways"}"#),
            Err(ConfigError::InvalidTemplate(_))
        ));
    }

    #[test]
    fn test_default_template_body() {
        let body = RequestTemplate::default().to_body();
        assert_eq!(body.get("downloadMode"), Some(&Value::String("auto".into())));
        assert_eq!(body.get("youtubeHLS"), Some(&Value::Bool(false)));
    }

    #[test]
    fn test_json_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let store = JsonFileStore::open(&path).unwrap();
        store.set(KEY_AUTH_CREDENTIAL, "abc").unwrap();
        store.set(KEY_BACKGROUND_DISABLED, "true").unwrap();
        drop(store);

        let store = JsonFileStore::open(&path).unwrap();
        assert_eq!(store.get(KEY_AUTH_CREDENTIAL).as_deref(), Some("abc"));
        assert!(store.get_bool(KEY_BACKGROUND_DISABLED));
        assert!(!TransferSettings::load(&store).background_enabled);

        store.remove(KEY_AUTH_CREDENTIAL).unwrap();
        assert!(store.get(KEY_AUTH_CREDENTIAL).is_none());
    }
}
