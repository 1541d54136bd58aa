//! Configuration for conductor.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CONDUCTOR_HOME, CONDUCTOR_GENERATION_COMMAND)
//! 2. Config file (.conductor/config.yaml)
//! 3. Defaults (~/.conductor)
//!
//! Config file discovery:
//! - Searches current directory and parents for .conductor/config.yaml
//! - `paths.home` in the config file is relative to the .conductor/ directory
//!
//! The resolved configuration is a plain value handed to the engine
//! builder; nothing here is global.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::{EngineConfig, ResearchSettings, SafetyLimits};
use crate::domain::ProductType;

pub const HOME_ENV: &str = "CONDUCTOR_HOME";
pub const GENERATION_COMMAND_ENV: &str = "CONDUCTOR_GENERATION_COMMAND";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub limits: SafetyLimits,
    #[serde(default)]
    pub research: ResearchSettings,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub default_product_type: Option<ProductType>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .conductor/)
    pub home: Option<String>,
}

/// External generation command (JSON on stdin/stdout)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Engine state directory (threads, blobs)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Settings handed to the engine builder
    pub engine: EngineConfig,
    pub generation: GenerationConfig,
}

impl ResolvedConfig {
    /// Checkpoints and event logs ($CONDUCTOR_HOME/threads)
    pub fn threads_dir(&self) -> PathBuf {
        self.home.join("threads")
    }

    /// Rendered images and other binary outputs ($CONDUCTOR_HOME/blobs)
    pub fn blobs_dir(&self) -> PathBuf {
        self.home.join("blobs")
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".conductor").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Environment overrides, captured once so resolution stays testable
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub home: Option<String>,
    pub generation_command: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            home: std::env::var(HOME_ENV).ok().filter(|v| !v.is_empty()),
            generation_command: std::env::var(GENERATION_COMMAND_ENV)
                .ok()
                .filter(|v| !v.is_empty()),
        }
    }
}

/// Merge defaults, an optional config file and environment overrides
pub fn resolve(config_file: Option<PathBuf>, env: &EnvOverrides, default_home: PathBuf) -> Result<ResolvedConfig> {
    let file = match &config_file {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    let home = if let Some(env_home) = &env.home {
        PathBuf::from(env_home)
    } else if let (Some(home_path), Some(config_path)) = (&file.paths.home, &config_file) {
        let conductor_dir = config_path.parent().unwrap_or(Path::new("."));
        resolve_path(conductor_dir, home_path)
    } else {
        default_home
    };

    let mut generation = file.generation;
    if let Some(command) = &env.generation_command {
        generation.command = Some(command.clone());
    }

    // Validate the patterns here so a bad config fails before any run starts
    file.research
        .compile()
        .context("Invalid research settings in configuration")?;

    Ok(ResolvedConfig {
        home,
        config_file,
        engine: EngineConfig {
            limits: file.limits,
            research: file.research,
            default_product_type: file.default_product_type.unwrap_or_default(),
        },
        generation,
    })
}

/// Load configuration from all sources
pub fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".conductor");

    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    resolve(find_config_file(&cwd), &EnvOverrides::from_env(), default_home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let conductor_dir = dir.join(".conductor");
        std::fs::create_dir_all(&conductor_dir).unwrap();
        let config_path = conductor_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "{}", body).unwrap();
        config_path
    }

    #[test]
    fn test_defaults_without_file() {
        let config = resolve(None, &EnvOverrides::default(), PathBuf::from("/tmp/.conductor")).unwrap();

        assert_eq!(config.home, PathBuf::from("/tmp/.conductor"));
        assert_eq!(config.threads_dir(), PathBuf::from("/tmp/.conductor/threads"));
        assert!(config.config_file.is_none());
        assert_eq!(config.engine.limits.max_graph_steps, 50);
        assert_eq!(config.engine.research.parallelism, 3);
        assert_eq!(config.engine.default_product_type, ProductType::Slide);
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            temp.path(),
            r#"
version: "1"
paths:
  home: ./state
limits:
  max_graph_steps: 80
  max_retries: 1
research:
  parallelism: 2
generation:
  command: my-llm
  args: ["--json"]
default_product_type: comic
"#,
        );

        let config = resolve(Some(config_path), &EnvOverrides::default(), PathBuf::from("/unused")).unwrap();

        assert_eq!(config.home, temp.path().join(".conductor").join("state"));
        assert_eq!(config.engine.limits.max_graph_steps, 80);
        assert_eq!(config.engine.limits.max_research_steps, 7);
        assert_eq!(config.engine.research.parallelism, 2);
        assert_eq!(config.engine.default_product_type, ProductType::Comic);
        assert_eq!(config.generation.command.as_deref(), Some("my-llm"));
        assert_eq!(config.generation.args, vec!["--json".to_string()]);
    }

    #[test]
    fn test_env_overrides_file() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(temp.path(), "generation:\n  command: from-file\n");

        let env = EnvOverrides {
            home: Some("/env/home".to_string()),
            generation_command: Some("from-env".to_string()),
        };
        let config = resolve(Some(config_path), &env, PathBuf::from("/unused")).unwrap();

        assert_eq!(config.home, PathBuf::from("/env/home"));
        assert_eq!(config.generation.command.as_deref(), Some("from-env"));
    }

    #[test]
    fn test_invalid_research_pattern_is_rejected() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(temp.path(), "research:\n  signal_patterns: [\"(broken\"]\n");

        let result = resolve(Some(config_path), &EnvOverrides::default(), PathBuf::from("/unused"));
        assert!(result.is_err());
    }

    #[test]
    fn test_single_perspective_research_is_rejected() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(temp.path(), "research:\n  min_tasks: 1\n");

        let err = resolve(Some(config_path), &EnvOverrides::default(), PathBuf::from("/unused"))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("min_tasks must be at least 2"));
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let temp = TempDir::new().unwrap();
        write_config(temp.path(), "version: \"1\"");
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert!(found.ends_with(".conductor/config.yaml"));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
