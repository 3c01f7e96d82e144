//! Request identity used as the lookup key inside a partition.

use sha2::{Digest, Sha256};
use std::fmt;

use crate::request::Request;

/// Method + URL identity of a cached request. Fragments never reach the
/// network, so they are not part of the identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestKey {
  method: String,
  url: String,
}

impl RequestKey {
  pub fn new(method: &str, url: &url::Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.to_uppercase(),
      url: url.to_string(),
    }
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// SHA256 hash for stable, fixed-length primary keys.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl From<&Request> for RequestKey {
  fn from(request: &Request) -> Self {
    Self::new(request.method.as_str(), &request.url)
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  #[test]
  fn test_fragment_is_not_part_of_identity() {
    let a = RequestKey::new("GET", &Url::parse("https://x.org/gallery#top").unwrap());
    let b = RequestKey::new("get", &Url::parse("https://x.org/gallery").unwrap());
    assert_eq!(a, b);
    assert_eq!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_method_and_query_distinguish_keys() {
    let url = Url::parse("https://x.org/api/events?page=1").unwrap();
    let get = RequestKey::new("GET", &url);
    let head = RequestKey::new("HEAD", &url);
    let other = RequestKey::new("GET", &Url::parse("https://x.org/api/events?page=2").unwrap());
    assert_ne!(get.cache_hash(), head.cache_hash());
    assert_ne!(get.cache_hash(), other.cache_hash());
    assert_eq!(get.cache_hash().len(), 64);
  }
}
