//! Provider adapters: pure functions mapping each supported service onto
//! the shared fetch machine.
//!
//! Each CI provider supplies the same five operations (remote-URL match,
//! request build, rate-limit parse, pagination parse, body parse) behind a
//! dispatch table keyed by [`Provider`], so the scheduler never branches on
//! provider-specific logic itself.

pub mod github;
pub mod gitlab;
pub mod gravatar;
pub mod jenkins;

use reqwest::header::HeaderMap;

use crate::cache::StatusRecord;
use crate::transport::{HttpResponse, ProviderRequest};

/// Rate-limit class. All requests to the same provider within one manager
/// instance share one timeout slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
  GitHub,
  GitLab,
  Jenkins,
  Gravatar,
}

impl std::fmt::Display for Provider {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      Provider::GitHub => "github",
      Provider::GitLab => "gitlab",
      Provider::Jenkins => "jenkins",
      Provider::Gravatar => "gravatar",
    };
    f.write_str(name)
  }
}

/// Authentication material for a provider. Each adapter formats its own
/// auth header (GitHub `Authorization: token`, GitLab `PRIVATE-TOKEN`,
/// Jenkins HTTP Basic).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
  Token(String),
  Basic { username: String, token: String },
}

/// Result of matching a remote URL against a provider pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedTarget {
  /// owner/repo style target (GitHub, GitLab)
  Repo {
    /// API origin, e.g. `https://api.github.com` or the GitLab host
    origin: String,
    owner: String,
    repo: String,
  },
  /// Path-identified Jenkins job
  JenkinsJob { origin: String, job_path: String },
}

/// Rate-limit metadata extracted from response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimit {
  Known {
    limit: i64,
    remaining: i64,
    /// Epoch ms at which the window resets
    reset_ms: i64,
  },
  /// Headers absent or malformed. Logged, but never sets a timeout.
  Unknown,
}

/// Pagination metadata. Malformed headers degrade to "no more pages" so a
/// bad response can never cause unbounded paging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
  pub has_more: bool,
  pub next_page: u32,
}

impl Pagination {
  pub fn done() -> Self {
    Self {
      has_more: false,
      next_page: 0,
    }
  }
}

/// The five per-provider operations the scheduler dispatches through.
pub struct CiAdapter {
  pub match_remote_url: fn(&str) -> Option<ParsedTarget>,
  pub build_request:
    fn(&ParsedTarget, Option<&Credentials>, &str, u32, bool) -> ProviderRequest,
  pub parse_rate_limit: fn(&HeaderMap) -> RateLimit,
  pub parse_pagination: fn(&HttpResponse) -> Pagination,
  pub parse_body: fn(&[u8], &[String], bool) -> Result<Vec<StatusRecord>, String>,
}

static GITHUB_CI: CiAdapter = CiAdapter {
  match_remote_url: github::match_remote_url,
  build_request: github::build_request,
  parse_rate_limit: github::parse_rate_limit,
  parse_pagination: github::parse_pagination,
  parse_body: github::parse_body,
};

static GITLAB_CI: CiAdapter = CiAdapter {
  match_remote_url: gitlab::match_remote_url,
  build_request: gitlab::build_request,
  parse_rate_limit: gitlab::parse_rate_limit,
  parse_pagination: gitlab::parse_pagination,
  parse_body: gitlab::parse_body,
};

static JENKINS_CI: CiAdapter = CiAdapter {
  match_remote_url: jenkins::match_remote_url,
  build_request: jenkins::build_request,
  parse_rate_limit: jenkins::parse_rate_limit,
  parse_pagination: jenkins::parse_pagination,
  parse_body: jenkins::parse_body,
};

/// Look up the CI adapter for a provider. Gravatar has no CI variant.
pub fn ci_adapter(provider: Provider) -> Option<&'static CiAdapter> {
  match provider {
    Provider::GitHub => Some(&GITHUB_CI),
    Provider::GitLab => Some(&GITLAB_CI),
    Provider::Jenkins => Some(&JENKINS_CI),
    Provider::Gravatar => None,
  }
}

/// Rate-limit parse dispatch for the scheduler, which only knows the
/// provider class of the item it just serviced.
pub fn parse_rate_limit(provider: Provider, headers: &HeaderMap) -> RateLimit {
  match ci_adapter(provider) {
    Some(adapter) => (adapter.parse_rate_limit)(headers),
    None => RateLimit::Unknown,
  }
}

/// Parse numeric rate-limit headers by the given names, in epoch seconds
/// for the reset value. Any absent or non-numeric header degrades the
/// whole triple to Unknown.
pub(crate) fn rate_limit_from_headers(
  headers: &HeaderMap,
  limit_name: &str,
  remaining_name: &str,
  reset_name: &str,
) -> RateLimit {
  let read = |name: &str| {
    headers
      .get(name)
      .and_then(|v| v.to_str().ok())
      .and_then(|v| v.parse::<i64>().ok())
  };

  match (read(limit_name), read(remaining_name), read(reset_name)) {
    (Some(limit), Some(remaining), Some(reset)) => RateLimit::Known {
      limit,
      remaining,
      reset_ms: reset * 1000,
    },
    _ => RateLimit::Unknown,
  }
}

/// Extract the `rel="next"` page number from an RFC 5988 `Link` header.
pub(crate) fn link_header_next_page(headers: &HeaderMap) -> Option<u32> {
  let link = headers.get("link").and_then(|v| v.to_str().ok())?;

  for part in link.split(',') {
    let (target, params) = part.split_once(';')?;
    if !params.contains("rel=\"next\"") {
      continue;
    }
    let target = target.trim().strip_prefix('<')?.strip_suffix('>')?;
    let url = url::Url::parse(target).ok()?;
    return url
      .query_pairs()
      .find(|(k, _)| k == "page")
      .and_then(|(_, v)| v.parse::<u32>().ok());
  }

  None
}

/// Percent-encode a query value (emails contain `+` and `@`).
pub(crate) fn encode_query_value(value: &str) -> String {
  url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
