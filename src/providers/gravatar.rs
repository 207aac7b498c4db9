//! Gravatar adapter: direct image fetch keyed by the MD5 of the email.
//!
//! The first attempt asks for a 404 when no real avatar is registered
//! (`d=404`); the retry asks for a generated identicon instead.

use md5::{Digest, Md5};

use crate::transport::ProviderRequest;

const ORIGIN: &str = "https://secure.gravatar.com";

/// Gravatar hashes the trimmed, lowercased email.
pub fn email_hash(email: &str) -> String {
  hex::encode(Md5::digest(email.trim().to_lowercase().as_bytes()))
}

pub fn build_request(email: &str, identicon: bool) -> ProviderRequest {
  let fallback = if identicon { "identicon" } else { "404" };
  ProviderRequest {
    origin: ORIGIN.to_string(),
    path: format!("/avatar/{}?s=162&d={}", email_hash(email), fallback),
    headers: Vec::new(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_email_hash_normalizes() {
    // Reference hash from the Gravatar documentation.
    assert_eq!(
      email_hash("MyEmailAddress@example.com "),
      "0bc83cb571cd1c50ba6f3e8a78ef1346"
    );
    assert_eq!(
      email_hash("myemailaddress@example.com"),
      email_hash("  MyEmailAddress@example.com")
    );
  }

  #[test]
  fn test_build_request_with_404_fallback() {
    let request = build_request("myemailaddress@example.com", false);
    assert_eq!(request.origin, "https://secure.gravatar.com");
    assert_eq!(
      request.path,
      "/avatar/0bc83cb571cd1c50ba6f3e8a78ef1346?s=162&d=404"
    );
  }

  #[test]
  fn test_identicon_retry_changes_fallback_only() {
    let request = build_request("myemailaddress@example.com", true);
    assert!(request.path.ends_with("?s=162&d=identicon"));
  }
}
