use core_config::server::ServerConfig;
use core_config::{env_or_default, ConfigError, FromEnv};
use nakadi_consumer::{ConsumerConfig, CoordinationConfig};
use strum::{Display, EnumString};

/// How partitions are shared between running instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, clap::ValueEnum)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum CoordinationMode {
    /// Every partition, newest offsets, nothing persisted
    Simple,
    /// Every partition, offsets persisted in Redis
    Durable,
    /// Partitions divided across instances by leader election
    Leader,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub consumer: ConsumerConfig,
    pub coordination: CoordinationConfig,
    pub mode: CoordinationMode,
    pub server: ServerConfig,
    pub access_token: Option<String>,
}

impl FromEnv for Config {
    fn from_env() -> Result<Self, ConfigError> {
        let mode = env_or_default("NAKADI_COORDINATION", "simple")
            .parse::<CoordinationMode>()
            .map_err(|e| ConfigError::ParseError {
                key: "NAKADI_COORDINATION".to_string(),
                details: e.to_string(),
            })?;

        Ok(Self {
            consumer: ConsumerConfig::from_env()?,
            coordination: CoordinationConfig::from_env()?,
            mode,
            server: ServerConfig::from_env()?,
            access_token: std::env::var("NAKADI_ACCESS_TOKEN")
                .ok()
                .filter(|token| !token.is_empty()),
        })
    }
}
