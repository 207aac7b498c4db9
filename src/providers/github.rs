//! GitHub adapter: check-runs (detail) and Actions runs (list) for CI
//! status, plus the commit endpoint for avatar resolution.

use reqwest::header::HeaderMap;
use serde::Deserialize;

use crate::cache::StatusRecord;
use crate::transport::{HttpResponse, ProviderRequest};

use super::{
  link_header_next_page, rate_limit_from_headers, Credentials, Pagination, ParsedTarget,
  RateLimit,
};

const API_ORIGIN: &str = "https://api.github.com";
const ACCEPT: (&str, &str) = ("Accept", "application/vnd.github.v3+json");

/// Match `https://github.com/{owner}/{repo}[.git]` (or http). SSH remotes
/// and other schemes are structural non-matches.
pub fn match_remote_url(remote: &str) -> Option<ParsedTarget> {
  let url = url::Url::parse(remote).ok()?;
  if url.scheme() != "https" && url.scheme() != "http" {
    return None;
  }
  if url.host_str()? != "github.com" {
    return None;
  }

  let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
  let owner = segments.next()?.to_string();
  let repo = segments.next()?.trim_end_matches(".git").to_string();
  if owner.is_empty() || repo.is_empty() || segments.next().is_some() {
    return None;
  }

  Some(ParsedTarget::Repo {
    origin: API_ORIGIN.to_string(),
    owner,
    repo,
  })
}

fn auth_headers(credentials: Option<&Credentials>) -> Vec<(String, String)> {
  let mut headers = vec![(ACCEPT.0.to_string(), ACCEPT.1.to_string())];
  if let Some(Credentials::Token(token)) = credentials {
    headers.push(("Authorization".to_string(), format!("token {}", token)));
  }
  headers
}

/// Detail fetch: a single commit's check-runs. List fetch: recent Actions
/// runs, scanned for matching commits.
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
    ParsedTarget::JenkinsJob { origin, job_path } => {
      // Unreachable for a well-formed job; degrade to a request that 404s.
      (origin, job_path, job_path)
    }
  };

  let mut path = if detail {
    format!(
      "/repos/{}/{}/commits/{}/check-runs?per_page=100",
      owner, repo, hash
    )
  } else {
    format!("/repos/{}/{}/actions/runs?per_page=100", owner, repo)
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
    "x-ratelimit-limit",
    "x-ratelimit-remaining",
    "x-ratelimit-reset",
  )
}

pub fn parse_pagination(response: &HttpResponse) -> Pagination {
  match link_header_next_page(&response.headers) {
    Some(next_page) => Pagination {
      has_more: true,
      next_page,
    },
    None => Pagination::done(),
  }
}

#[derive(Deserialize)]
struct CheckRunsResponse {
  check_runs: Vec<CheckRun>,
}

#[derive(Deserialize)]
struct CheckRun {
  id: Option<i64>,
  name: Option<String>,
  status: Option<String>,
  conclusion: Option<String>,
  html_url: Option<String>,
  head_sha: Option<String>,
}

#[derive(Deserialize)]
struct WorkflowRunsResponse {
  workflow_runs: Vec<WorkflowRun>,
}

#[derive(Deserialize)]
struct WorkflowRun {
  id: Option<i64>,
  name: Option<String>,
  status: Option<String>,
  conclusion: Option<String>,
  html_url: Option<String>,
  head_sha: Option<String>,
  head_branch: Option<String>,
  event: Option<String>,
}

fn matches_candidate(sha: &Option<String>, candidates: &[String]) -> bool {
  match sha {
    Some(sha) => candidates.iter().any(|c| c.eq_ignore_ascii_case(sha)),
    // Detail responses are already scoped to the requested commit.
    None => true,
  }
}

/// Normalize a GitHub response into status records. Entries without an id,
/// or whose head commit matches none of the candidates, yield no record.
pub fn parse_body(
  body: &[u8],
  candidates: &[String],
  detail: bool,
) -> Result<Vec<StatusRecord>, String> {
  if detail {
    let parsed: CheckRunsResponse =
      serde_json::from_slice(body).map_err(|e| format!("malformed check-runs body: {}", e))?;

    Ok(
      parsed
        .check_runs
        .into_iter()
        .filter(|run| matches_candidate(&run.head_sha, candidates))
        .filter_map(|run| {
          Some(StatusRecord {
            id: run.id?.to_string(),
            name: run.name.unwrap_or_default(),
            status: run.conclusion.or(run.status).unwrap_or_default(),
            reference: String::new(),
            web_url: run.html_url.unwrap_or_default(),
            event: String::new(),
            detail: true,
            allow_failure: false,
          })
        })
        .collect(),
    )
  } else {
    let parsed: WorkflowRunsResponse =
      serde_json::from_slice(body).map_err(|e| format!("malformed workflow-runs body: {}", e))?;

    Ok(
      parsed
        .workflow_runs
        .into_iter()
        .filter(|run| run.head_sha.is_some() && matches_candidate(&run.head_sha, candidates))
        .filter_map(|run| {
          Some(StatusRecord {
            id: run.id?.to_string(),
            name: run.name.unwrap_or_default(),
            status: run.conclusion.or(run.status).unwrap_or_default(),
            reference: run.head_branch.unwrap_or_default(),
            web_url: run.html_url.unwrap_or_default(),
            event: run.event.unwrap_or_default(),
            detail: false,
            allow_failure: false,
          })
        })
        .collect(),
    )
  }
}

/// Avatar variant: look up a commit to read its author's avatar URL.
pub fn build_commit_request(
  target: &ParsedTarget,
  credentials: Option<&Credentials>,
  hash: &str,
) -> ProviderRequest {
  let (origin, owner, repo) = match target {
    ParsedTarget::Repo {
      origin,
      owner,
      repo,
    } => (origin.clone(), owner.clone(), repo.clone()),
    ParsedTarget::JenkinsJob { origin, job_path } => {
      (origin.clone(), job_path.clone(), job_path.clone())
    }
  };

  ProviderRequest {
    origin,
    path: format!("/repos/{}/{}/commits/{}", owner, repo, hash),
    headers: auth_headers(credentials),
  }
}

#[derive(Deserialize)]
struct CommitResponse {
  author: Option<CommitAuthor>,
}

#[derive(Deserialize)]
struct CommitAuthor {
  avatar_url: Option<String>,
}

/// Extract the author avatar URL from a commit response, if any.
pub fn parse_commit_avatar(body: &[u8]) -> Result<Option<String>, String> {
  let parsed: CommitResponse =
    serde_json::from_slice(body).map_err(|e| format!("malformed commit body: {}", e))?;
  Ok(parsed.author.and_then(|a| a.avatar_url))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_match_https_remote() {
    let target = match_remote_url("https://github.com/acme/widgets.git").unwrap();
    assert_eq!(
      target,
      ParsedTarget::Repo {
        origin: "https://api.github.com".to_string(),
        owner: "acme".to_string(),
        repo: "widgets".to_string(),
      }
    );
    assert!(match_remote_url("http://github.com/acme/widgets").is_some());
  }

  #[test]
  fn test_ssh_and_foreign_remotes_do_not_match() {
    assert!(match_remote_url("git@github.com:acme/widgets.git").is_none());
    assert!(match_remote_url("ssh://git@github.com/acme/widgets.git").is_none());
    assert!(match_remote_url("https://gitlab.com/acme/widgets.git").is_none());
    assert!(match_remote_url("https://github.com/acme").is_none());
  }

  #[test]
  fn test_build_detail_request_path() {
    let target = match_remote_url("https://github.com/acme/widgets.git").unwrap();
    let request = build_request(
      &target,
      Some(&Credentials::Token("t0k".to_string())),
      "abc123",
      1,
      true,
    );

    assert_eq!(request.origin, "https://api.github.com");
    assert_eq!(
      request.path,
      "/repos/acme/widgets/commits/abc123/check-runs?per_page=100"
    );
    assert!(request
      .headers
      .contains(&("Authorization".to_string(), "token t0k".to_string())));
  }

  #[test]
  fn test_build_list_request_with_page() {
    let target = match_remote_url("https://github.com/acme/widgets").unwrap();
    let request = build_request(&target, None, "abc123", 3, false);
    assert_eq!(
      request.path,
      "/repos/acme/widgets/actions/runs?per_page=100&page=3"
    );
    // No token, no auth header.
    assert!(!request
      .headers
      .iter()
      .any(|(name, _)| name == "Authorization"));
  }

  #[test]
  fn test_parse_check_runs_body() {
    let body = br#"{"check_runs": [
      {"id": 42, "name": "build", "status": "completed", "conclusion": "success",
       "html_url": "https://github.com/acme/widgets/runs/42", "head_sha": "abc123"},
      {"name": "no-id", "status": "completed"}
    ]}"#;

    let records = parse_body(body, &["abc123".to_string()], true).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, "42");
    assert_eq!(records[0].status, "success");
    assert!(records[0].detail);
  }

  #[test]
  fn test_parse_workflow_runs_filters_by_candidate() {
    let body = br#"{"workflow_runs": [
      {"id": 1, "name": "ci", "status": "completed", "conclusion": "failure",
       "head_sha": "abc123", "head_branch": "main", "event": "push",
       "html_url": "https://github.com/acme/widgets/actions/runs/1"},
      {"id": 2, "name": "ci", "status": "completed", "conclusion": "success",
       "head_sha": "other", "head_branch": "main", "event": "push"}
    ]}"#;

    let records = parse_body(body, &["abc123".to_string()], false).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, "1");
    assert_eq!(records[0].status, "failure");
    assert_eq!(records[0].event, "push");
  }

  #[test]
  fn test_malformed_body_is_error() {
    assert!(parse_body(b"not json", &[], true).is_err());
    assert!(parse_body(b"{\"unexpected\": true}", &[], true).is_err());
  }

  #[test]
  fn test_parse_commit_avatar() {
    let body = br#"{"author": {"avatar_url": "https://avatars.example/u/1"}}"#;
    assert_eq!(
      parse_commit_avatar(body).unwrap(),
      Some("https://avatars.example/u/1".to_string())
    );
    assert_eq!(parse_commit_avatar(br#"{"author": null}"#).unwrap(), None);
    assert!(parse_commit_avatar(b"nope").is_err());
  }
}
