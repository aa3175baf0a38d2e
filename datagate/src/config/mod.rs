use std::path::Path;

use datagate_core::{
    auth::UserConfig,
    config::{PoolConfig, RuntimeConfig, SessionConfig, TransportConfig},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

mod extractor;

/// Everything the launcher reads from its config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    pub transport: TransportConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

/// The slice of [`Config`] the connection stack is built from.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub transport: TransportConfig,
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = datagate_core::util::file_read(path).await?;
        Self::from_slice(&content)
    }

    pub fn from_slice(content: &[u8]) -> anyhow::Result<Self> {
        parse_from_slice(content)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            transport: self.transport.clone(),
        }
    }
}

pub fn parse_from_slice<T: DeserializeOwned>(content: &[u8]) -> anyhow::Result<T> {
    // read first non-space u8
    let is_json = match content
        .iter()
        .find(|&&b| b != b' ' && b != b'\r' && b != b'\n' && b != b'\t')
    {
        Some(first) => *first == b'{',
        None => false,
    };
    match is_json {
        true => serde_json::from_slice::<T>(content).map_err(Into::into),
        false => toml::from_str::<T>(&String::from_utf8_lossy(content)).map_err(Into::into),
    }
}
