use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use kubernetes::ClusterOptions;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config file {1:?} failed, {0}")]
    Read(#[source] std::io::Error, PathBuf),

    #[error("parse config failed, {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("at least one cluster is required")]
    NoClusters,

    #[error("cluster name cannot be empty")]
    EmptyName,

    #[error("duplicate cluster {0:?}")]
    Duplicate(String),

    #[error("cluster {0:?} has no server")]
    MissingServer(String),

    #[error("watch timeout must be less than 295s, got {0}")]
    InvalidTimeout(u32),

    #[error("invalid cluster {name:?}, {source}")]
    Cluster {
        name: String,
        #[source]
        source: kubernetes::ConfigError,
    },
}

/// A cluster the console can watch, referenced by `name` in every query.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ClusterConfig {
    pub name: String,

    #[serde(flatten)]
    pub options: ClusterOptions,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Log level, `WATCHHUB_LOG` takes precedence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Server side timeout of a single watch request in seconds, the watch
    /// is re-issued after it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch_timeout: Option<u32>,

    pub clusters: Vec<ClusterConfig>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).map_err(|err| ConfigError::Read(err, path.to_path_buf()))?;

        text.parse()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clusters.is_empty() {
            return Err(ConfigError::NoClusters);
        }

        if let Some(timeout) = self.watch_timeout {
            if timeout >= 295 {
                return Err(ConfigError::InvalidTimeout(timeout));
            }
        }

        let mut names = HashSet::with_capacity(self.clusters.len());
        for cluster in &self.clusters {
            if cluster.name.is_empty() {
                return Err(ConfigError::EmptyName);
            }
            if cluster.options.server.is_empty() {
                return Err(ConfigError::MissingServer(cluster.name.clone()));
            }
            if !names.insert(cluster.name.as_str()) {
                return Err(ConfigError::Duplicate(cluster.name.clone()));
            }
        }

        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config = serde_yaml::from_str::<Config>(s)?;
        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        let config = r#"
log_level: debug
watch_timeout: 120
clusters:
  - name: prod
    server: https://10.0.0.1:6443
    token_file: /var/run/secrets/kubernetes.io/serviceaccount/token
    certificate_authority: /var/run/secrets/kubernetes.io/serviceaccount/ca.crt
  - name: staging
    server: https://staging.example.com
    token: abc
"#
        .parse::<Config>()
        .unwrap();

        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.watch_timeout, Some(120));
        assert_eq!(config.clusters.len(), 2);
        assert_eq!(config.clusters[0].name, "prod");
        assert_eq!(
            config.clusters[0].options.token_file,
            Some(PathBuf::from(
                "/var/run/secrets/kubernetes.io/serviceaccount/token"
            ))
        );
        assert_eq!(config.clusters[1].options.token.as_deref(), Some("abc"));
    }

    #[test]
    fn rejects_invalid() {
        for (text, want) in [
            ("clusters: []", "at least one cluster is required"),
            (
                "clusters: [{name: '', server: 'https://a'}]",
                "cluster name cannot be empty",
            ),
            (
                "clusters: [{name: a, server: ''}]",
                "cluster \"a\" has no server",
            ),
            (
                "clusters: [{name: a, server: 'https://a'}, {name: a, server: 'https://b'}]",
                "duplicate cluster \"a\"",
            ),
            (
                "watch_timeout: 300\nclusters: [{name: a, server: 'https://a'}]",
                "watch timeout must be less than 295s, got 300",
            ),
        ] {
            let err = text.parse::<Config>().unwrap_err();
            assert_eq!(err.to_string(), want, "{text}");
        }
    }

    #[test]
    fn unknown_top_level_field() {
        let err = "foo: bar\nclusters: []".parse::<Config>().unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file() {
        let err = Config::load("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read(..)));
    }
}
