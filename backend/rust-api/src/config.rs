use serde::Deserialize;
use std::env;

const DEFAULT_METRICS_AUTH: &str = "admin:changeme";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Mongo,
    Memory,
}

impl StorageBackend {
    pub fn parse(value: &str) -> Result<Self, config::ConfigError> {
        match value.trim().to_lowercase().as_str() {
            "mongo" | "mongodb" => Ok(StorageBackend::Mongo),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(config::ConfigError::Message(format!(
                "Unknown storage backend: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mongo_uri: String,
    pub mongo_database: String,
    pub storage_backend: StorageBackend,
    pub bind_addr: String,
    pub metrics_auth: String,
    pub otlp_enabled: bool,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Root .env first (two levels up), then the local one
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            dotenvy::dotenv().ok();
        }

        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // config/*.toml + ENV overrides (prefix: APP_)
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", app_env)).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Self::from_settings(&settings, &app_env)
    }

    fn from_settings(settings: &config::Config, app_env: &str) -> Result<Self, config::ConfigError> {
        let mongo_uri = settings
            .get_string("database.mongo_uri")
            .or_else(|_| env::var("MONGO_URI"))
            .unwrap_or_else(|_| "mongodb://localhost:27017/?replicaSet=rs0".to_string());

        let mongo_database = settings
            .get_string("database.mongo_database")
            .or_else(|_| env::var("MONGO_DATABASE"))
            .unwrap_or_else(|_| "questionengine".to_string());

        let storage_backend = match settings
            .get_string("storage.backend")
            .or_else(|_| env::var("STORAGE_BACKEND"))
        {
            Ok(value) => StorageBackend::parse(&value)?,
            Err(_) => StorageBackend::Mongo,
        };

        let bind_addr = settings
            .get_string("server.bind_addr")
            .or_else(|_| env::var("BIND_ADDR"))
            .unwrap_or_else(|_| "0.0.0.0:8081".to_string());

        let metrics_auth = settings
            .get_string("metrics.auth")
            .or_else(|_| env::var("METRICS_AUTH"))
            .unwrap_or_else(|_| DEFAULT_METRICS_AUTH.to_string());
        if app_env == "prod" && metrics_auth == DEFAULT_METRICS_AUTH {
            return Err(config::ConfigError::Message(
                "METRICS_AUTH must be set in production".to_string(),
            ));
        }

        let otlp_enabled = settings
            .get_bool("telemetry.otlp_enabled")
            .or_else(|_| {
                env::var("OTEL_ENABLED")
                    .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            })
            .unwrap_or(false);

        Ok(Config {
            mongo_uri,
            mongo_database,
            storage_backend,
            bind_addr,
            metrics_auth,
            otlp_enabled,
        })
    }

    /// In-memory configuration for tests and local runs without MongoDB.
    pub fn in_memory() -> Self {
        Config {
            mongo_uri: String::new(),
            mongo_database: "questionengine".to_string(),
            storage_backend: StorageBackend::Memory,
            bind_addr: "127.0.0.1:0".to_string(),
            metrics_auth: DEFAULT_METRICS_AUTH.to_string(),
            otlp_enabled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn settings(pairs: &[(&str, &str)]) -> config::Config {
        let mut builder = config::Config::builder();
        for (key, value) in pairs {
            builder = builder.set_override(*key, *value).unwrap();
        }
        builder.build().unwrap()
    }

    #[test]
    fn storage_backend_parsing() {
        assert_eq!(StorageBackend::parse("Mongo").unwrap(), StorageBackend::Mongo);
        assert_eq!(StorageBackend::parse("memory").unwrap(), StorageBackend::Memory);
        assert!(StorageBackend::parse("sqlite").is_err());
    }

    #[test]
    #[serial]
    fn settings_take_precedence_over_defaults() {
        let cfg = Config::from_settings(
            &settings(&[
                ("database.mongo_database", "qe_test"),
                ("storage.backend", "memory"),
                ("telemetry.otlp_enabled", "true"),
            ]),
            "dev",
        )
        .unwrap();

        assert_eq!(cfg.mongo_database, "qe_test");
        assert_eq!(cfg.storage_backend, StorageBackend::Memory);
        assert!(cfg.otlp_enabled);
    }

    #[test]
    #[serial]
    fn prod_rejects_default_metrics_credentials() {
        std::env::remove_var("METRICS_AUTH");
        let err = Config::from_settings(&settings(&[]), "prod").unwrap_err();
        assert!(err.to_string().contains("METRICS_AUTH"));

        let cfg = Config::from_settings(&settings(&[("metrics.auth", "ops:s3cret")]), "prod")
            .unwrap();
        assert_eq!(cfg.metrics_auth, "ops:s3cret");
    }

    #[test]
    #[serial]
    fn default_mongo_uri_targets_replica_set() {
        std::env::remove_var("MONGO_URI");
        let cfg = Config::from_settings(&settings(&[]), "dev").unwrap();
        assert_eq!(cfg.mongo_uri, "mongodb://localhost:27017/?replicaSet=rs0");
    }
}
