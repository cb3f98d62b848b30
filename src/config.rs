//! Configuration for the conductor engine.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CONDUCTOR_HOME, CONDUCTOR_SIMULATE_ERRORS)
//! 2. Config file (.conductor/config.yaml)
//! 3. Defaults (~/.conductor)
//!
//! Config file discovery:
//! - Searches current directory and parents for .conductor/config.yaml
//! - `paths.home` is relative to the .conductor/ directory

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::{HttpServices, Latency};
use crate::core::{ApprovalConfig, EngineSettings, PollConfig, RetryPolicy};

pub const ENV_HOME: &str = "CONDUCTOR_HOME";
pub const ENV_SIMULATE_ERRORS: &str = "CONDUCTOR_SIMULATE_ERRORS";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub journal: Option<JournalConfig>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub polling: Option<PollConfig>,
    #[serde(default)]
    pub approval: Option<ApprovalConfig>,
    #[serde(default)]
    pub simulation: Option<SimulationConfig>,
    /// HTTP endpoints replacing simulated plan steps
    #[serde(default)]
    pub services: Option<HttpServices>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .conductor/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JournalConfig {
    pub enabled: Option<bool>,
}

/// Behaviour of the in-process simulated services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Inject random transient failures
    #[serde(default)]
    pub errors_enabled: bool,

    #[serde(default)]
    pub latency_min_ms: u64,

    #[serde(default)]
    pub latency_max_ms: u64,

    /// PROCESSING answers before a payment settles; random 2..=8 when unset
    #[serde(default)]
    pub polls_to_settle: Option<u32>,

    /// Chance in percent that a settled payment is declined
    #[serde(default = "default_payment_failure_rate")]
    pub payment_failure_rate: u8,
}

fn default_payment_failure_rate() -> u8 {
    20
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            errors_enabled: false,
            latency_min_ms: 0,
            latency_max_ms: 0,
            polls_to_settle: None,
            payment_failure_rate: default_payment_failure_rate(),
        }
    }
}

impl SimulationConfig {
    pub fn latency(&self) -> Latency {
        Latency::between(self.latency_min_ms, self.latency_max_ms)
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Absolute path to the conductor home (journal and state)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub journal_enabled: bool,
    pub retry: RetryPolicy,
    pub polling: PollConfig,
    pub approval: ApprovalConfig,
    pub simulation: SimulationConfig,
    /// Carries bearer tokens, so never serialized
    #[serde(skip)]
    pub services: HttpServices,
}

impl ResolvedConfig {
    /// Directory of the process journal ($CONDUCTOR_HOME/processes)
    pub fn journal_dir(&self) -> PathBuf {
        self.home.join("processes")
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            retry: self.retry.clone(),
            polling: self.polling.clone(),
            approval: self.approval.clone(),
        }
    }

    /// Reject policies the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        self.retry.validate().context("Invalid retry policy")?;
        self.polling.validate().context("Invalid polling policy")?;
        self.approval.validate().context("Invalid approval policy")?;
        if self.simulation.payment_failure_rate > 100 {
            anyhow::bail!(
                "simulation.payment_failure_rate must be a percentage, got {}",
                self.simulation.payment_failure_rate
            );
        }
        self.services.validate().context("Invalid services section")?;
        Ok(())
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

/// Resolve a path that may be relative to the config file's parent
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

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Environment overrides, read once so resolution stays testable
#[derive(Debug, Clone, Default)]
struct EnvOverrides {
    home: Option<String>,
    simulate_errors: Option<String>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        Self {
            home: std::env::var(ENV_HOME).ok(),
            simulate_errors: std::env::var(ENV_SIMULATE_ERRORS).ok(),
        }
    }
}

fn resolve(
    config_file: Option<(PathBuf, ConfigFile)>,
    env: EnvOverrides,
    default_home: PathBuf,
) -> ResolvedConfig {
    let (config_path, file) = match config_file {
        Some((path, file)) => (Some(path), Some(file)),
        None => (None, None),
    };

    let home = if let Some(env_home) = env.home {
        PathBuf::from(env_home)
    } else if let (Some(path), Some(home)) = (
        config_path.as_ref(),
        file.as_ref().and_then(|f| f.paths.home.as_ref()),
    ) {
        let conductor_dir = path.parent().unwrap_or(Path::new("."));
        resolve_path(conductor_dir, home)
    } else {
        default_home
    };

    let mut resolved = ResolvedConfig {
        home,
        config_file: config_path,
        journal_enabled: true,
        retry: RetryPolicy::default(),
        polling: PollConfig::default(),
        approval: ApprovalConfig::default(),
        simulation: SimulationConfig::default(),
        services: HttpServices::default(),
    };

    if let Some(file) = file {
        if let Some(enabled) = file.journal.and_then(|j| j.enabled) {
            resolved.journal_enabled = enabled;
        }
        if let Some(retry) = file.retry {
            resolved.retry = retry;
        }
        if let Some(polling) = file.polling {
            resolved.polling = polling;
        }
        if let Some(approval) = file.approval {
            resolved.approval = approval;
        }
        if let Some(simulation) = file.simulation {
            resolved.simulation = simulation;
        }
        if let Some(services) = file.services {
            resolved.services = services;
        }
    }

    if let Some(flag) = env.simulate_errors {
        resolved.simulation.errors_enabled = parse_flag(&flag);
    }

    resolved
}

/// Load configuration from all sources, starting discovery at `start`
pub fn load_config_from(start: &Path) -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".conductor");

    let config_file = match find_config_file(start) {
        Some(path) => {
            let file = load_config_file(&path)?;
            Some((path, file))
        }
        None => None,
    };

    let config = resolve(config_file, EnvOverrides::from_env(), default_home);
    config.validate()?;
    Ok(config)
}

/// Load configuration from all sources, starting at the current directory
pub fn load_config() -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    load_config_from(&cwd)
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
        let config = resolve(None, EnvOverrides::default(), PathBuf::from("/home/u/.conductor"));

        assert_eq!(config.home, PathBuf::from("/home/u/.conductor"));
        assert_eq!(config.journal_dir(), PathBuf::from("/home/u/.conductor/processes"));
        assert!(config.config_file.is_none());
        assert!(config.journal_enabled);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.polling.max_polls, 20);
        assert_eq!(config.approval.min_details_len, 10);
        assert!(!config.simulation.errors_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            temp.path(),
            r#"
version: "1.0"
paths:
  home: state
journal:
  enabled: false
retry:
  initial_interval_ms: 500
  max_attempts: 3
polling:
  interval_ms: 5000
approval:
  timeout_ms: 60000
simulation:
  errors_enabled: true
  polls_to_settle: 2
"#,
        );

        let file = load_config_file(&config_path).unwrap();
        assert_eq!(file.version, "1.0");
        assert_eq!(file.paths.home, Some("state".to_string()));

        let config = resolve(
            Some((config_path.clone(), file)),
            EnvOverrides::default(),
            PathBuf::from("/unused"),
        );
        assert_eq!(config.home, temp.path().join(".conductor").join("state"));
        assert!(!config.journal_enabled);
        assert_eq!(config.retry.initial_interval_ms, 500);
        assert_eq!(config.retry.max_attempts, 3);
        // Unset fields keep their defaults
        assert_eq!(config.retry.max_interval_ms, 30_000);
        assert_eq!(config.polling.interval_ms, 5_000);
        assert_eq!(config.polling.max_polls, 20);
        assert_eq!(config.approval.timeout_ms, 60_000);
        assert_eq!(config.approval.allowed_request_types.len(), 5);
        assert!(config.simulation.errors_enabled);
        assert_eq!(config.simulation.polls_to_settle, Some(2));
    }

    #[test]
    fn test_env_overrides_file() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            temp.path(),
            "version: \"1.0\"\nsimulation:\n  errors_enabled: true\n",
        );
        let file = load_config_file(&config_path).unwrap();

        let config = resolve(
            Some((config_path, file)),
            EnvOverrides {
                home: Some("/srv/conductor".to_string()),
                simulate_errors: Some("false".to_string()),
            },
            PathBuf::from("/unused"),
        );
        assert_eq!(config.home, PathBuf::from("/srv/conductor"));
        assert!(!config.simulation.errors_enabled);
    }

    #[test]
    fn test_discovery_walks_up() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(temp.path(), "version: \"1.0\"");
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_config_file(&nested), Some(config_path));
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let mut config = resolve(None, EnvOverrides::default(), PathBuf::from("/tmp"));
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_services_section() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            temp.path(),
            r#"
version: "1.0"
services:
  payment:
    name: PaymentService
    url: https://payments.internal/charge
    token: secret
"#,
        );
        let file = load_config_file(&config_path).unwrap();
        let config = resolve(
            Some((config_path, file)),
            EnvOverrides::default(),
            PathBuf::from("/unused"),
        );

        assert!(config.services.user.is_none());
        let payment = config.services.payment.as_ref().unwrap();
        assert_eq!(payment.url, "https://payments.internal/charge");
        assert_eq!(payment.token.as_deref(), Some("secret"));
        assert!(config.validate().is_ok());

        let shown = serde_yaml::to_string(&config).unwrap();
        assert!(!shown.contains("secret"));
    }

    #[test]
    fn test_invalid_service_url_rejected() {
        let mut config = resolve(None, EnvOverrides::default(), PathBuf::from("/tmp"));
        config.services.order = Some(crate::adapters::HttpServiceConfig {
            name: "OrderService".to_string(),
            url: "not a url".to_string(),
            token: None,
        });

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid services section"));
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("1"));
        assert!(parse_flag("TRUE"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag("nope"));
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
