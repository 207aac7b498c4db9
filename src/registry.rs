//! Repository registry: resolves which provider and credentials apply to
//! each configured repository. The schedulers consult this instead of
//! resolving remotes themselves.

use std::collections::HashMap;

use crate::config::{Config, ProviderKind, RepoConfig};
use crate::providers::{Credentials, Provider};

#[derive(Debug, Clone)]
pub struct RepoEntry {
  pub path: String,
  pub remote_url: String,
  pub provider: Provider,
  pub credentials: Option<Credentials>,
  pub commits: Vec<String>,
  pub authors: Vec<String>,
  pub detail: bool,
}

pub struct RepoRegistry {
  repos: HashMap<String, RepoEntry>,
}

impl RepoRegistry {
  pub fn from_config(config: &Config) -> Self {
    let repos = config
      .repos
      .iter()
      .map(|repo| {
        let provider = resolve_provider(repo);
        (
          repo.path.clone(),
          RepoEntry {
            path: repo.path.clone(),
            remote_url: repo.remote.clone(),
            provider,
            credentials: resolve_credentials(repo, provider),
            commits: repo.commits.clone(),
            authors: repo.authors.clone(),
            detail: repo.detail,
          },
        )
      })
      .collect();

    Self { repos }
  }

  pub fn list_repos(&self) -> impl Iterator<Item = &RepoEntry> {
    self.repos.values()
  }

  pub fn get(&self, path: &str) -> Option<&RepoEntry> {
    self.repos.get(path)
  }
}

fn resolve_provider(repo: &RepoConfig) -> Provider {
  match repo.provider {
    ProviderKind::Github => Provider::GitHub,
    ProviderKind::Gitlab => Provider::GitLab,
    ProviderKind::Jenkins => Provider::Jenkins,
    ProviderKind::Auto => {
      let host = url::Url::parse(&repo.remote)
        .ok()
        .and_then(|u| u.host_str().map(String::from))
        .unwrap_or_default();
      if host == "github.com" {
        Provider::GitHub
      } else if host.contains("gitlab") {
        Provider::GitLab
      } else {
        Provider::Jenkins
      }
    }
  }
}

fn default_token_env(provider: Provider) -> &'static str {
  match provider {
    Provider::GitHub => "GITPULSE_GITHUB_TOKEN",
    Provider::GitLab => "GITPULSE_GITLAB_TOKEN",
    Provider::Jenkins => "GITPULSE_JENKINS_TOKEN",
    Provider::Gravatar => "",
  }
}

fn resolve_credentials(repo: &RepoConfig, provider: Provider) -> Option<Credentials> {
  let token = repo
    .token_env
    .as_deref()
    .and_then(|name| std::env::var(name).ok())
    .or_else(|| std::env::var(default_token_env(provider)).ok())?;

  match provider {
    Provider::Jenkins => Some(Credentials::Basic {
      username: repo.username.clone().unwrap_or_default(),
      token,
    }),
    _ => Some(Credentials::Token(token)),
  }
}
