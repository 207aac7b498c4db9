use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  /// Repositories to watch
  #[serde(default)]
  pub repos: Vec<RepoConfig>,
  #[serde(default)]
  pub avatars: AvatarsConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

/// CI provider selection for a repository. `Auto` infers from the remote
/// host (github.com, hosts containing "gitlab", anything else is treated
/// as a Jenkins endpoint).
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
  #[default]
  Auto,
  Github,
  Gitlab,
  Jenkins,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepoConfig {
  /// Local path, used as the cache owner key
  pub path: String,
  /// Remote (or Jenkins job) URL the provider adapters match against
  pub remote: String,
  #[serde(default)]
  pub provider: ProviderKind,
  /// Environment variable holding the API token for this repo.
  /// Falls back to GITPULSE_GITHUB_TOKEN / GITPULSE_GITLAB_TOKEN /
  /// GITPULSE_JENKINS_TOKEN by provider.
  pub token_env: Option<String>,
  /// Username for providers using basic auth (Jenkins)
  pub username: Option<String>,
  /// Commit hashes to watch
  #[serde(default)]
  pub commits: Vec<String>,
  /// Author emails to fetch avatars for
  #[serde(default)]
  pub authors: Vec<String>,
  /// Detail fetch (named per-commit check runs/statuses) vs a list scan
  /// over recent runs/pipelines
  #[serde(default = "default_true")]
  pub detail: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AvatarsConfig {
  #[serde(default = "default_true")]
  pub enabled: bool,
}

impl Default for AvatarsConfig {
  fn default() -> Self {
    Self { enabled: true }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// When disabled, nothing persists across restarts
  #[serde(default = "default_true")]
  pub enabled: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self { enabled: true }
  }
}

fn default_true() -> bool {
  true
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./gitpulse.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/gitpulse/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/gitpulse/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("gitpulse.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("gitpulse").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_minimal_config() {
    let config: Config = serde_yaml::from_str(
      r#"
repos:
  - path: /work/widgets
    remote: https://github.com/acme/widgets.git
    commits: [abc123]
"#,
    )
    .unwrap();

    assert_eq!(config.repos.len(), 1);
    assert_eq!(config.repos[0].provider, ProviderKind::Auto);
    assert!(config.repos[0].detail);
    assert!(config.avatars.enabled);
    assert!(config.cache.enabled);
  }

  #[test]
  fn test_parse_full_repo_entry() {
    let config: Config = serde_yaml::from_str(
      r#"
repos:
  - path: /work/widgets
    remote: https://ci.acme.org/job/widgets
    provider: jenkins
    username: bot
    token_env: ACME_CI_TOKEN
    detail: false
    authors: [dev@acme.org]
avatars:
  enabled: false
cache:
  enabled: false
"#,
    )
    .unwrap();

    let repo = &config.repos[0];
    assert_eq!(repo.provider, ProviderKind::Jenkins);
    assert_eq!(repo.username.as_deref(), Some("bot"));
    assert!(!repo.detail);
    assert!(!config.avatars.enabled);
    assert!(!config.cache.enabled);
  }
}
