//! Jenkins adapter: the JSON API's builds tree, with commit identity taken
//! from each build's `lastBuiltRevision` action.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::HeaderMap;
use serde::Deserialize;

use crate::cache::StatusRecord;
use crate::transport::{HttpResponse, ProviderRequest};

use super::{link_header_next_page, Credentials, Pagination, ParsedTarget, RateLimit};

const BUILDS_TREE: &str =
  "builds[id,timestamp,fullDisplayName,result,url,actions[lastBuiltRevision[branch[*]]]]";

/// Jenkins jobs are identified by URL path, not owner/repo. Any http(s)
/// URL matches; everything else is a structural non-match.
pub fn match_remote_url(remote: &str) -> Option<ParsedTarget> {
  let url = url::Url::parse(remote).ok()?;
  if url.scheme() != "https" && url.scheme() != "http" {
    return None;
  }
  let host = url.host_str()?;

  let origin = match url.port() {
    Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
    None => format!("{}://{}", url.scheme(), host),
  };
  let job_path = url.path().trim_end_matches('/').to_string();

  Some(ParsedTarget::JenkinsJob { origin, job_path })
}

pub fn build_request(
  target: &ParsedTarget,
  credentials: Option<&Credentials>,
  _hash: &str,
  _page: u32,
  _detail: bool,
) -> ProviderRequest {
  let (origin, job_path) = match target {
    ParsedTarget::JenkinsJob { origin, job_path } => (origin.clone(), job_path.clone()),
    ParsedTarget::Repo { origin, owner, repo } => {
      (origin.clone(), format!("/job/{}/job/{}", owner, repo))
    }
  };

  let mut headers = Vec::new();
  if let Some(Credentials::Basic { username, token }) = credentials {
    let encoded = BASE64.encode(format!("{}:{}", username, token));
    headers.push(("Authorization".to_string(), format!("Basic {}", encoded)));
  }

  ProviderRequest {
    origin,
    path: format!("{}/api/json?tree={}", job_path, BUILDS_TREE),
    headers,
  }
}

/// Jenkins publishes no rate-limit headers.
pub fn parse_rate_limit(_headers: &HeaderMap) -> RateLimit {
  RateLimit::Unknown
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
struct BuildsResponse {
  builds: Vec<Build>,
}

#[derive(Deserialize)]
struct Build {
  id: Option<String>,
  #[serde(rename = "fullDisplayName")]
  full_display_name: Option<String>,
  result: Option<String>,
  url: Option<String>,
  #[serde(default)]
  actions: Vec<Action>,
}

#[derive(Deserialize)]
struct Action {
  #[serde(rename = "lastBuiltRevision")]
  last_built_revision: Option<Revision>,
}

#[derive(Deserialize)]
struct Revision {
  #[serde(default)]
  branch: Vec<Branch>,
}

#[derive(Deserialize)]
struct Branch {
  #[serde(rename = "SHA1")]
  sha1: Option<String>,
  name: Option<String>,
}

pub fn parse_body(
  body: &[u8],
  candidates: &[String],
  _detail: bool,
) -> Result<Vec<StatusRecord>, String> {
  let parsed: BuildsResponse =
    serde_json::from_slice(body).map_err(|e| format!("malformed builds body: {}", e))?;

  Ok(
    parsed
      .builds
      .into_iter()
      .filter_map(|build| {
        let branch = build
          .actions
          .iter()
          .filter_map(|action| action.last_built_revision.as_ref())
          .flat_map(|revision| revision.branch.iter())
          .find(|branch| match &branch.sha1 {
            Some(sha) => candidates.iter().any(|c| c.eq_ignore_ascii_case(sha)),
            None => false,
          })?;

        Some(StatusRecord {
          id: build.id?,
          name: build.full_display_name.unwrap_or_default(),
          // A null result means the build is still running.
          status: build.result.unwrap_or_else(|| "IN_PROGRESS".to_string()),
          reference: branch.name.clone().unwrap_or_default(),
          web_url: build.url.unwrap_or_default(),
          event: "build".to_string(),
          detail: false,
          allow_failure: false,
        })
      })
      .collect(),
  )
}
