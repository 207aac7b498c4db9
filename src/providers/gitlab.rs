//! GitLab adapter: per-commit statuses (detail) and project pipelines
//! (list), plus user search for avatar resolution. Works against gitlab.com
//! and self-hosted instances - the API origin is taken from the remote.

use reqwest::header::HeaderMap;
use serde::Deserialize;

use crate::cache::StatusRecord;
use crate::transport::{HttpResponse, ProviderRequest};

use super::{
  encode_query_value, rate_limit_from_headers, Credentials, Pagination, ParsedTarget, RateLimit,
};

/// Match `http(s)://{host}/{owner...}/{repo}[.git]`. The owner may contain
/// subgroups. SSH remotes are structural non-matches.
pub fn match_remote_url(remote: &str) -> Option<ParsedTarget> {
  let url = url::Url::parse(remote).ok()?;
  if url.scheme() != "https" && url.scheme() != "http" {
    return None;
  }
  let host = url.host_str()?;

  let segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
  if segments.len() < 2 {
    return None;
  }
  let repo = segments[segments.len() - 1].trim_end_matches(".git");
  if repo.is_empty() {
    return None;
  }
  let owner = segments[..segments.len() - 1].join("/");

  let origin = match url.port() {
    Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
    None => format!("{}://{}", url.scheme(), host),
  };

  Some(ParsedTarget::Repo {
    origin,
    owner,
    repo: repo.to_string(),
  })
}

fn auth_headers(credentials: Option<&Credentials>) -> Vec<(String, String)> {
  match credentials {
    Some(Credentials::Token(token)) => vec![("PRIVATE-TOKEN".to_string(), token.clone())],
    _ => Vec::new(),
  }
}

/// Project id in the API is the URL-encoded full path, slashes included.
fn project_id(owner: &str, repo: &str) -> String {
  format!("{}/{}", owner, repo).replace('/', "%2F")
}

pub fn build_request(
  target: &ParsedTarget,
  credentials: Option<&Credentials>,
  hash: &str,
  page: u32,
  detail: bool,
) -> ProviderRequest {
  let (origin, owner, repo) = match target {
    ParsedTarget::Repo {
      origin,
      owner,
      repo,
    } => (origin, owner, repo),
    ParsedTarget::JenkinsJob { origin, job_path } => (origin, job_path, job_path),
  };

  let project = project_id(owner, repo);
  let mut path = if detail {
    format!(
      "/api/v4/projects/{}/repository/commits/{}/statuses?per_page=100",
      project, hash
    )
  } else {
    format!("/api/v4/projects/{}/pipelines?per_page=100", project)
  };
  if page > 1 {
    path.push_str(&format!("&page={}", page));
  }

  ProviderRequest {
    origin: origin.clone(),
    path,
    headers: auth_headers(credentials),
  }
}

pub fn parse_rate_limit(headers: &HeaderMap) -> RateLimit {
  rate_limit_from_headers(
    headers,
    "ratelimit-limit",
    "ratelimit-remaining",
    "ratelimit-reset",
  )
}

/// GitLab paginates via `x-page` / `x-total-pages` headers.
pub fn parse_pagination(response: &HttpResponse) -> Pagination {
  let read = |name: &str| {
    response
      .header(name)
      .and_then(|v| v.parse::<u32>().ok())
  };

  match (read("x-page"), read("x-total-pages")) {
    (Some(page), Some(total)) if page < total => Pagination {
      has_more: true,
      next_page: page + 1,
    },
    _ => Pagination::done(),
  }
}

#[derive(Deserialize)]
struct CommitStatus {
  id: Option<i64>,
  name: Option<String>,
  status: Option<String>,
  #[serde(rename = "ref")]
  reference: Option<String>,
  target_url: Option<String>,
  allow_failure: Option<bool>,
}

#[derive(Deserialize)]
struct PipelineEntry {
  id: Option<i64>,
  status: Option<String>,
  #[serde(rename = "ref")]
  reference: Option<String>,
  sha: Option<String>,
  web_url: Option<String>,
  source: Option<String>,
}

pub fn parse_body(
  body: &[u8],
  candidates: &[String],
  detail: bool,
) -> Result<Vec<StatusRecord>, String> {
  if detail {
    // The statuses endpoint is already scoped to one commit.
    let parsed: Vec<CommitStatus> =
      serde_json::from_slice(body).map_err(|e| format!("malformed statuses body: {}", e))?;

    Ok(
      parsed
        .into_iter()
        .filter_map(|status| {
          Some(StatusRecord {
            id: status.id?.to_string(),
            name: status.name.unwrap_or_default(),
            status: status.status.unwrap_or_default(),
            reference: status.reference.unwrap_or_default(),
            web_url: status.target_url.unwrap_or_default(),
            event: String::new(),
            detail: true,
            allow_failure: status.allow_failure.unwrap_or(false),
          })
        })
        .collect(),
    )
  } else {
    let parsed: Vec<PipelineEntry> =
      serde_json::from_slice(body).map_err(|e| format!("malformed pipelines body: {}", e))?;

    Ok(
      parsed
        .into_iter()
        .filter(|pipeline| match &pipeline.sha {
          Some(sha) => candidates.iter().any(|c| c.eq_ignore_ascii_case(sha)),
          None => false,
        })
        .filter_map(|pipeline| {
          Some(StatusRecord {
            id: pipeline.id?.to_string(),
            name: String::new(),
            status: pipeline.status.unwrap_or_default(),
            reference: pipeline.reference.unwrap_or_default(),
            web_url: pipeline.web_url.unwrap_or_default(),
            event: pipeline.source.unwrap_or_default(),
            detail: false,
            allow_failure: false,
          })
        })
        .collect(),
    )
  }
}

/// Avatar variant: search users by email.
pub fn build_user_search(
  origin: &str,
  credentials: Option<&Credentials>,
  email: &str,
) -> ProviderRequest {
  ProviderRequest {
    origin: origin.to_string(),
    path: format!("/api/v4/users?search={}", encode_query_value(email)),
    headers: auth_headers(credentials),
  }
}

#[derive(Deserialize)]
struct UserEntry {
  avatar_url: Option<String>,
}

/// First matching user's avatar URL, if any.
pub fn parse_user_avatar(body: &[u8]) -> Result<Option<String>, String> {
  let parsed: Vec<UserEntry> =
    serde_json::from_slice(body).map_err(|e| format!("malformed users body: {}", e))?;
  Ok(parsed.into_iter().find_map(|user| user.avatar_url))
}
