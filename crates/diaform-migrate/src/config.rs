//! Configuration types for diaform-migrate.
//!
//! Configuration comes from a YAML file, with credentials optionally
//! supplied (or overridden) by the `DIAFORM_*` environment variables the
//! rest of the Diaform tooling uses.

use serde::{Deserialize, Serialize};

use crate::connectors::data_api::DataApiConfig;
use crate::connectors::json_file::JsonFileConfig;
use crate::connectors::mongodb::{is_mongodb_uri, validate_uri, MongoDBConfig};
use crate::error::{Error, Result};
use crate::retry::RetrySettings;

/// MongoDB connection string, or a Data API URL.
pub const ENV_DATABASE: &str = "DIAFORM_DATABASE";
/// MongoDB Data API key; only read for a Data API URL.
pub const ENV_DATABASE_API_KEY: &str = "DIAFORM_DATABASE_API_KEY";
/// PostgreSQL host.
pub const ENV_POSTGRES_HOST: &str = "DIAFORM_POSTGRES_HOST";
/// PostgreSQL port.
pub const ENV_POSTGRES_PORT: &str = "DIAFORM_POSTGRES_PORT";
/// PostgreSQL user.
pub const ENV_POSTGRES_USERNAME: &str = "DIAFORM_POSTGRES_USERNAME";
/// PostgreSQL password.
pub const ENV_POSTGRES_PASSWORD: &str = "DIAFORM_POSTGRES_PASSWORD";
/// PostgreSQL database name.
pub const ENV_POSTGRES_DATABASE: &str = "DIAFORM_POSTGRES_DATABASE";

/// Main migration configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationConfig {
    /// Source document store.
    pub source: SourceConfig,
    /// Destination relational store.
    pub destination: DestinationConfig,
    /// Migration options.
    #[serde(default)]
    pub options: MigrationOptions,
}

/// Source store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum SourceConfig {
    /// MongoDB through the driver.
    #[serde(rename = "mongodb")]
    MongoDB(MongoDBConfig),
    /// MongoDB through the Atlas Data API.
    #[serde(rename = "mongodb_data_api")]
    DataApi(DataApiConfig),
    /// JSON dump of the three collections.
    #[serde(rename = "json_file")]
    JsonFile(JsonFileConfig),
}

impl SourceConfig {
    /// Short name of the source kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MongoDB(_) => "mongodb",
            Self::DataApi(_) => "mongodb_data_api",
            Self::JsonFile(_) => "json_file",
        }
    }
}

/// Destination store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum DestinationConfig {
    /// PostgreSQL database.
    #[serde(rename = "postgres")]
    Postgres(PostgresConfig),
    /// In-process store; nothing is persisted.
    #[serde(rename = "memory")]
    Memory,
}

impl DestinationConfig {
    /// Short name of the destination kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::Memory => "memory",
        }
    }
}

/// PostgreSQL connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostgresConfig {
    /// Server host.
    pub host: String,
    /// Server port.
    #[serde(default = "default_postgres_port")]
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Login password.
    #[serde(default)]
    pub password: String,
    /// Database name.
    #[serde(default = "default_postgres_database")]
    pub database: String,
    /// Pool size. The migration itself uses a single connection.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Migration options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationOptions {
    /// Page size for source reads and target scans.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Dry run mode: write to an in-memory target instead of the destination.
    #[serde(default)]
    pub dry_run: bool,
    /// Keep going after a row fails for reasons other than a key conflict.
    #[serde(default = "default_true")]
    pub continue_on_error: bool,
    /// Create missing tables and columns before migrating.
    #[serde(default = "default_true")]
    pub create_schema: bool,
    /// Synthesize connections from legacy `children` lists.
    #[serde(default)]
    pub legacy_children: bool,
    /// Run the `first_created` backfill after the migration commits.
    #[serde(default)]
    pub backfill_first_created: bool,
    /// Draw progress bars.
    #[serde(default = "default_true")]
    pub progress: bool,
    /// Retry policy for source reads.
    #[serde(default)]
    pub retry: RetrySettings,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            dry_run: false,
            continue_on_error: true,
            create_schema: true,
            legacy_children: false,
            backfill_first_created: false,
            progress: true,
            retry: RetrySettings::default(),
        }
    }
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_postgres_database() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    2
}

fn default_batch_size() -> usize {
    500
}

fn default_true() -> bool {
    true
}

impl MigrationConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Cannot read config '{}': {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML does not describe a valid configuration.
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Build a configuration purely from `DIAFORM_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a required variable is missing.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable lookup.
    ///
    /// `DIAFORM_DATABASE` selects the source: an `http(s)://` URL means the
    /// Data API (and requires `DIAFORM_DATABASE_API_KEY`), anything else is
    /// taken as a driver connection string.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let require = |key: &str| {
            lookup(key).ok_or_else(|| Error::Config(format!("{} is not set", key)))
        };

        let database_url = require(ENV_DATABASE)?;
        let source = if is_http_url(&database_url) {
            SourceConfig::DataApi(DataApiConfig {
                data_api_url: database_url,
                api_key: require(ENV_DATABASE_API_KEY)?,
                database: "diaform".to_string(),
                data_source: "mongodb-atlas".to_string(),
            })
        } else {
            SourceConfig::MongoDB(MongoDBConfig {
                uri: database_url,
                database: "diaform".to_string(),
            })
        };

        let mut config = Self {
            source,
            destination: DestinationConfig::Postgres(PostgresConfig {
                host: require(ENV_POSTGRES_HOST)?,
                port: default_postgres_port(),
                username: require(ENV_POSTGRES_USERNAME)?,
                password: String::new(),
                database: default_postgres_database(),
                max_connections: default_max_connections(),
            }),
            options: MigrationOptions::default(),
        };
        config.apply_overrides(lookup)?;
        Ok(config)
    }

    /// Override credentials from `DIAFORM_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `DIAFORM_POSTGRES_PORT` is not a port number.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Same as [`apply_env_overrides`](Self::apply_env_overrides) with an explicit lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        match &mut self.source {
            SourceConfig::MongoDB(mongo) => {
                if let Some(uri) = lookup(ENV_DATABASE) {
                    mongo.uri = uri;
                }
            }
            SourceConfig::DataApi(api) => {
                if let Some(url) = lookup(ENV_DATABASE) {
                    api.data_api_url = url;
                }
                if let Some(key) = lookup(ENV_DATABASE_API_KEY) {
                    api.api_key = key;
                }
            }
            SourceConfig::JsonFile(_) => {}
        }

        if let DestinationConfig::Postgres(pg) = &mut self.destination {
            if let Some(host) = lookup(ENV_POSTGRES_HOST) {
                pg.host = host;
            }
            if let Some(port) = lookup(ENV_POSTGRES_PORT) {
                pg.port = port.parse().map_err(|_| {
                    Error::Config(format!("{} is not a valid port: {}", ENV_POSTGRES_PORT, port))
                })?;
            }
            if let Some(username) = lookup(ENV_POSTGRES_USERNAME) {
                pg.username = username;
            }
            if let Some(password) = lookup(ENV_POSTGRES_PASSWORD) {
                pg.password = password;
            }
            if let Some(database) = lookup(ENV_POSTGRES_DATABASE) {
                pg.database = database;
            }
        }

        Ok(())
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.options.batch_size == 0 {
            return Err(Error::Config(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        match &self.source {
            SourceConfig::MongoDB(mongo) => {
                validate_uri(&mongo.uri)?;
                if mongo.database.is_empty() {
                    return Err(Error::Config("MongoDB database is empty".to_string()));
                }
            }
            SourceConfig::DataApi(api) => {
                crate::connectors::common::validate_http_url(&api.data_api_url)?;
                if api.api_key.is_empty() {
                    return Err(Error::Config("MongoDB api_key is empty".to_string()));
                }
                if api.database.is_empty() {
                    return Err(Error::Config("MongoDB database is empty".to_string()));
                }
            }
            SourceConfig::JsonFile(file) => {
                if file.path.as_os_str().is_empty() {
                    return Err(Error::Config("JSON dump path is empty".to_string()));
                }
            }
        }

        if let DestinationConfig::Postgres(pg) = &self.destination {
            if pg.host.is_empty() || pg.username.is_empty() {
                return Err(Error::Config(
                    "PostgreSQL host and username are required".to_string(),
                ));
            }
            if pg.max_connections == 0 {
                return Err(Error::Config(
                    "max_connections must be greater than 0".to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn is_http_url(url: &str) -> bool {
    !is_mongodb_uri(url) && (url.starts_with("http://") || url.starts_with("https://"))
}

/// Configuration template written by `diaform-migrate init`.
pub const CONFIG_TEMPLATE: &str = r#"# Diaform migration configuration
#
# Credentials may be left out here and supplied through DIAFORM_DATABASE
# and DIAFORM_POSTGRES_* environment variables.
#
# Deployments that still expose the Atlas Data API can use instead:
#   type: mongodb_data_api
#   data_api_url: https://data.mongodb-api.com/app/<app-id>/endpoint/data/v1
#   api_key: change-me

source:
  type: mongodb
  uri: mongodb://localhost:27017
  database: diaform

destination:
  type: postgres
  host: localhost
  port: 5432
  username: postgres
  database: postgres

options:
  batch_size: 500
  continue_on_error: true
  create_schema: true
  legacy_children: false
  backfill_first_created: false
  retry:
    max_retries: 3
    initial_delay_ms: 500
"#;
