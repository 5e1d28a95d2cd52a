use dotenvy::dotenv;
use std::env;
use std::time::Duration;
use thiserror::Error;

use crate::models::QualityOfService;

/// Connection settings shared read-only by the publisher and the subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub keep_alive: Duration,
}

impl ClientSettings {
    /// The subscriber keeps its own session, so it must not reuse the publisher's id.
    pub fn subscriber_client_id(&self) -> String {
        format!("{}-subscriber", self.client_id)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub client: ClientSettings,
    pub subscribe_topics: Vec<String>,
    pub subscribe_qos: QualityOfService,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Config {
    fn validate_keep_alive(&self) -> Result<(), ConfigError> {
        const MIN_KEEP_ALIVE: u64 = 5;
        const MAX_KEEP_ALIVE: u64 = 3600;

        let secs = self.client.keep_alive.as_secs();
        if !(MIN_KEEP_ALIVE..=MAX_KEEP_ALIVE).contains(&secs) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_KEEP_ALIVE_SECS must be between {} and {} seconds",
                MIN_KEEP_ALIVE, MAX_KEEP_ALIVE
            )));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or_else(|| ConfigError::MissingOrInvalid(key.to_string()))
        };
        // Empty credentials count as absent
        let optional = |key: &str| lookup(key).filter(|value| !value.is_empty());

        let use_tls = match lookup("MQTT_USE_TLS").as_deref().map(str::trim) {
            None | Some("") => false,
            Some(value) => parse_bool(value).ok_or_else(|| {
                ConfigError::ParsingError("MQTT_USE_TLS must be true or false".to_string())
            })?,
        };

        let keep_alive_secs = lookup("MQTT_KEEP_ALIVE_SECS")
            .unwrap_or_else(|| "10".to_string())
            .trim()
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::ParsingError("MQTT_KEEP_ALIVE_SECS must be a valid number".to_string())
            })?;

        let subscribe_qos = lookup("MQTT_SUBSCRIBE_QOS")
            .unwrap_or_else(|| "1".to_string())
            .trim()
            .parse::<u8>()
            .map_err(|_| {
                ConfigError::ParsingError("MQTT_SUBSCRIBE_QOS must be 0, 1 or 2".to_string())
            })
            .and_then(QualityOfService::try_from)?;

        let subscribe_topics = lookup("MQTT_SUBSCRIBE_TOPICS")
            .map(|topics| {
                topics
                    .split(',')
                    .map(str::trim)
                    .filter(|topic| !topic.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let config = Self {
            client: ClientSettings {
                client_id: required("MQTT_CLIENT_ID")?,
                host: required("MQTT_HOST")?,
                port: required("MQTT_PORT")?.parse::<u16>().map_err(|_| {
                    ConfigError::ParsingError("MQTT_PORT must be a valid number".to_string())
                })?,
                username: optional("MQTT_USERNAME"),
                password: optional("MQTT_PASSWORD"),
                use_tls,
                keep_alive: Duration::from_secs(keep_alive_secs),
            },
            subscribe_topics,
            subscribe_qos,
        };

        config.validate_keep_alive()?;

        Ok(config)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    const BASE: [(&str, &str); 3] = [
        ("MQTT_CLIENT_ID", "own-mqtt"),
        ("MQTT_HOST", "broker.local"),
        ("MQTT_PORT", "1883"),
    ];

    #[test]
    fn loads_minimal_configuration_with_defaults() {
        let config = Config::from_lookup(lookup_from(&BASE)).unwrap();

        assert_eq!(config.client.client_id, "own-mqtt");
        assert_eq!(config.client.host, "broker.local");
        assert_eq!(config.client.port, 1883);
        assert!(!config.client.use_tls);
        assert_eq!(config.client.username, None);
        assert_eq!(config.client.keep_alive, Duration::from_secs(10));
        assert!(config.subscribe_topics.is_empty());
        assert_eq!(config.subscribe_qos, QualityOfService::AtLeastOnce);
    }

    #[test]
    fn missing_host_is_reported_by_name() {
        let err = Config::from_lookup(lookup_from(&[
            ("MQTT_CLIENT_ID", "own-mqtt"),
            ("MQTT_PORT", "1883"),
        ]))
        .unwrap_err();

        assert_eq!(err, ConfigError::MissingOrInvalid("MQTT_HOST".to_string()));
    }

    #[test]
    fn rejects_non_numeric_port() {
        let mut vars = BASE.to_vec();
        vars[2] = ("MQTT_PORT", "eighteen");

        let err = Config::from_lookup(lookup_from(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::ParsingError(_)));
    }

    #[test]
    fn rejects_out_of_range_qos() {
        let mut vars = BASE.to_vec();
        vars.push(("MQTT_SUBSCRIBE_QOS", "3"));

        let err = Config::from_lookup(lookup_from(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::ParsingError(_)));
    }

    #[test]
    fn rejects_keep_alive_outside_bounds() {
        let mut vars = BASE.to_vec();
        vars.push(("MQTT_KEEP_ALIVE_SECS", "1"));

        assert!(Config::from_lookup(lookup_from(&vars)).is_err());
    }

    #[test]
    fn parses_tls_credentials_and_topics() {
        let mut vars = BASE.to_vec();
        vars.extend([
            ("MQTT_USE_TLS", "TRUE"),
            ("MQTT_USERNAME", "duc"),
            ("MQTT_PASSWORD", "secret"),
            ("MQTT_SUBSCRIBE_TOPICS", "ptduc, sensors/#,,"),
            ("MQTT_SUBSCRIBE_QOS", "2"),
        ]);

        let config = Config::from_lookup(lookup_from(&vars)).unwrap();

        assert!(config.client.use_tls);
        assert_eq!(config.client.username.as_deref(), Some("duc"));
        assert_eq!(config.client.password.as_deref(), Some("secret"));
        assert_eq!(config.subscribe_topics, vec!["ptduc", "sensors/#"]);
        assert_eq!(config.subscribe_qos, QualityOfService::ExactlyOnce);
    }

    #[test]
    fn empty_credentials_are_absent() {
        let mut vars = BASE.to_vec();
        vars.extend([("MQTT_USERNAME", ""), ("MQTT_PASSWORD", "")]);

        let config = Config::from_lookup(lookup_from(&vars)).unwrap();
        assert_eq!(config.client.username, None);
        assert_eq!(config.client.password, None);
    }

    #[test]
    fn subscriber_gets_its_own_client_id() {
        let config = Config::from_lookup(lookup_from(&BASE)).unwrap();
        assert_eq!(config.client.subscriber_client_id(), "own-mqtt-subscriber");
    }
}
