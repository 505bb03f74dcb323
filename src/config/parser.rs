//! Configuration parser for loading and merging configuration files.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, KeelError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::DeployConfig;

/// Configuration parser for loading deployment configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<DeployConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(KeelError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            KeelError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<DeployConfig> {
        debug!("Parsing YAML configuration");

        let config: DeployConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            KeelError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed configuration for project {} with {} resource(s)",
            config.project.name,
            config.resource_count()
        );
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Recognized variables: `KEEL_STATE_PATH`, `KEEL_PLAN_PARALLELISM`,
    /// `KEEL_APPLY_PARALLELISM`, `KEEL_REMOTE_URL`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// is malformed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<DeployConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(
        config: &mut DeployConfig,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        if let Some(path) = var("KEEL_STATE_PATH") {
            debug!("Overriding state.path from environment");
            config.state.path = Some(PathBuf::from(path));
        }

        if let Some(value) = var("KEEL_PLAN_PARALLELISM") {
            debug!("Overriding engine.plan_parallelism from environment");
            config.engine.plan_parallelism = parse_count("KEEL_PLAN_PARALLELISM", &value)?;
        }

        if let Some(value) = var("KEEL_APPLY_PARALLELISM") {
            debug!("Overriding engine.apply_parallelism from environment");
            config.engine.apply_parallelism = parse_count("KEEL_APPLY_PARALLELISM", &value)?;
        }

        if let Some(url) = var("KEEL_REMOTE_URL") {
            debug!("Overriding remote.base_url from environment");
            match config.remote.as_mut() {
                Some(remote) => remote.base_url = url,
                None => {
                    return Err(ConfigError::validation(
                        "KEEL_REMOTE_URL is set but the configuration has no remote section",
                        "remote",
                    )
                    .into());
                }
            }
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                KeelError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Reads the bearer token named by `token_env`.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is named but not set.
    pub fn get_token(token_env: Option<&str>) -> Result<Option<String>> {
        let Some(name) = token_env else {
            return Ok(None);
        };
        std::env::var(name).map(Some).map_err(|_| {
            KeelError::Config(ConfigError::MissingEnvVar {
                name: name.to_string(),
            })
        })
    }
}

fn parse_count(name: &str, value: &str) -> Result<usize> {
    value.trim().parse().map_err(|_| {
        ConfigError::validation(format!("{name} must be a positive integer, got '{value}'"), name)
            .into()
    })
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "keel.deploy.yaml",
    "keel.deploy.yml",
    "deploy.yaml",
    "deploy.yml",
];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(KeelError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::ActionType;
    use std::collections::HashMap;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: test-project
";
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).unwrap();
        assert_eq!(config.project.name, "test-project");
        assert_eq!(config.project.environment, "dev");
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
project:
  name: analytics
  environment: prod

state:
  path: state/prod.json

engine:
  plan_parallelism: 2
  apply_parallelism: 4
  refresh: true

remote:
  base_url: https://api.example.com
  token_env: KEEL_TOKEN

adapters:
  jobs:
    path: /api/2.1/jobs
    id_field: job_id
    triggers: { name: update, storage: recreate }
    keyed_slices: { tasks: task_key }
    remote_fields: [state, url]
    ready: { field: state, value: RUNNING, timeout_secs: 60 }

resources:
  jobs:
    nightly:
      name: nightly
      tasks:
        - task_key: ingest
"#;
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        assert_eq!(config.engine.apply_parallelism, 4);
        assert!(config.engine.refresh);

        let jobs = &config.adapters["jobs"];
        assert_eq!(jobs.id_field, "job_id");
        assert_eq!(jobs.triggers["storage"], ActionType::Recreate);
        assert_eq!(jobs.keyed_slices["tasks"], "task_key");
        assert_eq!(jobs.ready.as_ref().map(|r| r.interval_secs), Some(5));
        assert_eq!(config.resource_map().len(), 1);
    }

    #[test]
    fn test_unknown_action_is_a_parse_error() {
        let yaml = r"
project: { name: x }
adapters:
  jobs: { path: /jobs, triggers: { name: explode } }
";
        let err = ConfigParser::new().parse_yaml(yaml, None).unwrap_err();
        assert!(matches!(err, KeelError::Config(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ConfigParser::new()
            .parse_yaml(
                "project: { name: x }\nremote: { base_url: https://a.example.com }",
                None,
            )
            .unwrap();
        let vars = HashMap::from([
            ("KEEL_STATE_PATH", "/tmp/s.json"),
            ("KEEL_APPLY_PARALLELISM", "3"),
            ("KEEL_REMOTE_URL", "https://b.example.com"),
        ]);
        ConfigParser::apply_env_overrides(&mut config, |k| {
            vars.get(k).map(ToString::to_string)
        })
        .unwrap();

        assert_eq!(config.state.path, Some(PathBuf::from("/tmp/s.json")));
        assert_eq!(config.engine.apply_parallelism, 3);
        assert_eq!(config.engine.plan_parallelism, 1);
        assert_eq!(
            config.remote.map(|r| r.base_url),
            Some(String::from("https://b.example.com"))
        );
    }

    #[test]
    fn test_bad_parallelism_override() {
        let mut config = ConfigParser::new()
            .parse_yaml("project: { name: x }", None)
            .unwrap();
        let result = ConfigParser::apply_env_overrides(&mut config, |k| {
            (k == "KEEL_PLAN_PARALLELISM").then(|| String::from("many"))
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("keel.deploy.yaml"), "project: { name: x }").unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("keel.deploy.yaml"));
    }
}
