use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use vloop::domain::{EventKind, Hat, Policy, RoleKind};
use vloop::roles::{CommandRole, PassthroughRole, Role, RoleRegistry};
use vloop::watchdog::TickConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub policy: Policy,
    pub roles: Vec<RoleConfig>,
    pub watchdog: WatchdogConfig,
    pub storage: StorageConfig,
}

/// One entry of the role roster.
///
/// Empty `consumes`/`produces` take the stock contract of `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    pub id: String,
    pub kind: RoleKind,
    #[serde(default)]
    pub consumes: Vec<EventKind>,
    #[serde(default)]
    pub produces: Vec<EventKind>,
    /// Shell command run for every delivered event
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl RoleConfig {
    fn stock(id: &str, kind: RoleKind) -> Self {
        Self {
            id: id.to_string(),
            kind,
            consumes: Vec::new(),
            produces: Vec::new(),
            command: None,
            env: BTreeMap::new(),
        }
    }

    pub fn hat(&self) -> Hat {
        let base = match self.kind {
            RoleKind::Planner => Hat::planner(),
            RoleKind::Builder => Hat::builder(),
            RoleKind::Verifier => Hat::verifier(),
            RoleKind::Custom => Hat::new(self.id.as_str(), RoleKind::Custom),
        };
        let mut hat = Hat {
            id: self.id.as_str().into(),
            name: self.id.clone(),
            ..base
        };
        if !self.consumes.is_empty() {
            hat.consumes = self.consumes.clone();
        }
        if !self.produces.is_empty() {
            hat.produces = self.produces.clone();
        }
        hat
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub tick_interval_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { tick_interval_ms: 1000 }
    }
}

impl WatchdogConfig {
    pub fn tick_config(&self) -> TickConfig {
        TickConfig::from_millis(self.tick_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// One `<run_id>.jsonl` event log per run
    pub log_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            log_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("vloop")
                .join("runs"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            policy: Policy::default(),
            roles: vec![
                RoleConfig::stock("planner", RoleKind::Planner),
                RoleConfig::stock("builder", RoleKind::Builder),
            ],
            watchdog: WatchdogConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let project_name = env!("CARGO_PKG_NAME");
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Turn the roster into a registry.
    ///
    /// Roles with a command shell out from `workdir`; roles without one pass
    /// straight through. A `verifier` entry only renames the gate's hat.
    pub fn build_registry(&self, workdir: &Path) -> Result<RoleRegistry> {
        let mut verifier = Hat::verifier();
        let mut roles: Vec<Arc<dyn Role>> = Vec::new();

        for role in &self.roles {
            let hat = role.hat();
            if role.kind == RoleKind::Verifier {
                verifier = hat;
                continue;
            }
            match &role.command {
                Some(command) => {
                    let mut handler = CommandRole::new(hat, command).workdir(workdir);
                    for (key, value) in &role.env {
                        handler = handler.env(key, value);
                    }
                    roles.push(Arc::new(handler));
                }
                None => roles.push(Arc::new(PassthroughRole::new(hat))),
            }
        }

        RoleRegistry::new(verifier, roles).context("Invalid role roster")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use vloop::domain::{RoleId, StallRecovery};

    #[test]
    fn test_default_config_builds_registry() {
        let config = Config::default();
        let registry = config.build_registry(Path::new(".")).unwrap();
        assert_eq!(registry.verifier_id().as_str(), "verifier");
        assert!(registry.validate(&config.policy).is_ok());
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vloop.yml");
        fs::write(
            &path,
            r#"
log_level: debug
policy:
  max_iterations: 4
  stall_recovery: abort
  verify_command:
    command: "make check"
    timeout_ms: 5000
roles:
  - id: planner
    kind: planner
  - id: builder
    kind: builder
    command: "./build.sh"
    env:
      MODE: fast
watchdog:
  tick_interval_ms: 250
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.policy.max_iterations, 4);
        assert_eq!(config.policy.stall_recovery, StallRecovery::Abort);
        assert_eq!(config.policy.verify_command.command, "make check");
        // Unlisted policy fields keep their defaults
        assert_eq!(config.policy.repeat_failure_limit, 3);
        assert_eq!(config.roles[1].command.as_deref(), Some("./build.sh"));
        assert_eq!(config.watchdog.tick_config().tick_interval.as_millis(), 250);
    }

    #[test]
    fn test_renamed_builder_validates_with_default_policy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vloop.yml");
        fs::write(
            &path,
            r#"
roles:
  - id: planner
    kind: planner
  - id: coder
    kind: builder
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert!(config.policy.retry_target.is_empty());
        let registry = config.build_registry(Path::new(".")).unwrap();
        assert!(registry.validate(&config.policy).is_ok());
        assert_eq!(
            registry.retry_target_for(&config.policy, &RoleId::new("coder")).unwrap(),
            RoleId::new("coder")
        );
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let path = PathBuf::from("/nonexistent/vloop.yml");
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_role_contract_overrides() {
        let role: RoleConfig = serde_yaml::from_str(
            r#"
id: fixer
kind: builder
consumes: ["test.failed"]
"#,
        )
        .unwrap();
        let hat = role.hat();
        assert_eq!(hat.id, RoleId::new("fixer"));
        assert_eq!(hat.consumes, vec![EventKind::TestFailed]);
        assert_eq!(hat.produces, vec![EventKind::BuildDone]);
    }

    #[test]
    fn test_verifier_entry_renames_gate() {
        let mut config = Config::default();
        config.roles.push(RoleConfig::stock("checker", RoleKind::Verifier));
        let registry = config.build_registry(Path::new(".")).unwrap();
        assert_eq!(registry.verifier_id().as_str(), "checker");
    }

    #[test]
    fn test_roster_without_planner_rejected() {
        let mut config = Config::default();
        config.roles.retain(|r| r.kind != RoleKind::Planner);
        assert!(config.build_registry(Path::new(".")).is_err());
    }
}
