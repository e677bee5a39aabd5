//! Gateway configuration loaded from the environment.
//!
//! Every optional backend (search, vectors) degrades to a disabled client when
//! its variables are absent, so a bare `JWT_SECRET` is enough to run locally.

use std::time::Duration;
use thiserror::Error;

use crate::storage::StorageConfig;

/// Number of characters of the projected content cached as a preview.
pub const DEFAULT_PREVIEW_LENGTH: usize = 500;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Full-text search backend settings
#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub index: String,
}

impl SearchConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            index: "documents".to_string(),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = index.into();
        self
    }

    fn from_env() -> Option<Self> {
        let url = non_empty_var("ELASTICSEARCH_URL")?;
        let mut config = Self::new(url);
        if let Some(username) = non_empty_var("ELASTICSEARCH_USERNAME") {
            let password = non_empty_var("ELASTICSEARCH_PASSWORD").unwrap_or_default();
            config = config.with_credentials(username, password);
        }
        if let Some(index) = non_empty_var("ELASTICSEARCH_INDEX") {
            config = config.with_index(index);
        }
        Some(config)
    }
}

/// Vector index and embeddings backend settings
#[derive(Debug, Clone)]
pub struct VectorConfig {
    pub qdrant_url: String,
    pub collection: String,
    pub embeddings_url: String,
    pub embeddings_api_key: Option<String>,
    pub embeddings_model: String,
    /// Maximum characters per embedded chunk
    pub chunk_size: usize,
}

impl VectorConfig {
    pub fn new(qdrant_url: impl Into<String>, embeddings_url: impl Into<String>) -> Self {
        Self {
            qdrant_url: qdrant_url.into(),
            collection: "chunks".to_string(),
            embeddings_url: embeddings_url.into(),
            embeddings_api_key: None,
            embeddings_model: "text-embedding-3-small".to_string(),
            chunk_size: 1000,
        }
    }

    fn from_env() -> Option<Self> {
        let qdrant_url = non_empty_var("QDRANT_URL")?;
        let embeddings_url = non_empty_var("EMBEDDINGS_URL")?;
        let mut config = Self::new(qdrant_url, embeddings_url);
        config.embeddings_api_key = non_empty_var("EMBEDDINGS_API_KEY");
        if let Some(collection) = non_empty_var("QDRANT_COLLECTION") {
            config.collection = collection;
        }
        if let Some(model) = non_empty_var("EMBEDDINGS_MODEL") {
            config.embeddings_model = model;
        }
        Some(config)
    }
}

/// Debounce settings for the flush scheduler
#[derive(Debug, Clone)]
pub struct FlushConfig {
    /// Quiet period after the last change before a flush
    pub debounce: Duration,
    /// Longest a change may stay unflushed under continuous editing
    pub max_debounce: Duration,
    /// How often the scheduler looks for due rooms
    pub tick: Duration,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(2000),
            max_debounce: Duration::from_millis(10_000),
            tick: Duration::from_millis(250),
        }
    }
}

/// Top-level gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub storage: StorageConfig,
    pub jwt_secret: String,
    pub jwt_leeway_secs: u64,
    pub preview_length: usize,
    pub flush: FlushConfig,
    pub search: Option<SearchConfig>,
    pub vector: Option<VectorConfig>,
}

impl GatewayConfig {
    pub fn new(jwt_secret: impl Into<String>) -> Self {
        Self {
            port: 5000,
            storage: StorageConfig::default(),
            jwt_secret: jwt_secret.into(),
            jwt_leeway_secs: 60,
            preview_length: DEFAULT_PREVIEW_LENGTH,
            flush: FlushConfig::default(),
            search: None,
            vector: None,
        }
    }

    pub fn with_flush(mut self, flush: FlushConfig) -> Self {
        self.flush = flush;
        self
    }

    /// Build the configuration from process environment variables.
    ///
    /// Call `dotenvy::dotenv()` first to pick up a local `.env` file.
    pub fn from_env() -> ConfigResult<Self> {
        let jwt_secret = non_empty_var("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?;
        let mut config = Self::new(jwt_secret);

        if let Some(port) = parse_var::<u16>("PORT")? {
            config.port = port;
        }
        if let Some(path) = non_empty_var("STORAGE_PATH") {
            config.storage = StorageConfig::new(path);
        }
        if let Some(leeway) = parse_var::<u64>("JWT_LEEWAY_SECS")? {
            config.jwt_leeway_secs = leeway;
        }
        if let Some(len) = parse_var::<usize>("PREVIEW_LENGTH")? {
            config.preview_length = len;
        }
        if let Some(ms) = parse_var::<u64>("FLUSH_DEBOUNCE_MS")? {
            config.flush.debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>("FLUSH_MAX_DEBOUNCE_MS")? {
            config.flush.max_debounce = Duration::from_millis(ms);
        }
        config.search = SearchConfig::from_env();
        config.vector = VectorConfig::from_env();

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.jwt_secret.is_empty() {
            return Err(ConfigError::Missing("JWT_SECRET"));
        }
        if self.flush.max_debounce < self.flush.debounce {
            return Err(ConfigError::Invalid {
                name: "FLUSH_MAX_DEBOUNCE_MS",
                value: format!("{:?} is shorter than the debounce", self.flush.max_debounce),
            });
        }
        Ok(())
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &'static str) -> ConfigResult<Option<T>> {
    match non_empty_var(name) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(None),
    }
}
