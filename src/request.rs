//! Request and response values passed between the controller, the cache and the network.

use reqwest::Method;
use url::Url;

/// What the requesting context intends to do with the response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Destination {
  /// No declared destination (fetch/XHR)
  #[default]
  Empty,
  Document,
  Image,
  Script,
  Style,
  Font,
}

/// Whether the request is a top-level navigation or a subresource load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  Navigate,
  #[default]
  Subresource,
}

/// An intercepted outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
  pub mode: RequestMode,
}

impl Request {
  /// A plain GET subresource request.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      destination: Destination::Empty,
      mode: RequestMode::Subresource,
    }
  }

  /// A top-level document navigation.
  pub fn navigate(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      destination: Destination::Document,
      mode: RequestMode::Navigate,
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Compare scheme, host and port against the site origin.
  pub fn is_same_origin(&self, origin: &Url) -> bool {
    self.url.origin() == origin.origin()
  }
}

/// A stored or freshly fetched response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_lowercase(), value.to_string()));
    self
  }

  /// Only a 200 is eligible for storage.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_same_origin_compares_scheme_host_and_port() {
    let origin = url("https://club.example.org");
    assert!(Request::get(url("https://club.example.org/about")).is_same_origin(&origin));
    assert!(!Request::get(url("http://club.example.org/about")).is_same_origin(&origin));
    assert!(!Request::get(url("https://club.example.org:8443/")).is_same_origin(&origin));
    assert!(!Request::get(url("https://images.unsplash.com/x")).is_same_origin(&origin));
  }

  #[test]
  fn test_navigation_defaults() {
    let req = Request::navigate(url("https://club.example.org/events"));
    assert!(req.is_get());
    assert!(req.is_navigation());
    assert_eq!(req.destination, Destination::Document);

    let post = Request::get(url("https://club.example.org/api/join")).with_method(Method::POST);
    assert!(!post.is_get());
    assert!(!post.is_navigation());
  }

  #[test]
  fn test_only_200_is_cacheable() {
    assert!(Response::new(200, "ok").is_cacheable());
    assert!(!Response::new(204, "").is_cacheable());
    assert!(!Response::new(404, "missing").is_cacheable());
    assert!(!Response::new(500, "boom").is_cacheable());
  }

  #[test]
  fn test_header_lookup_ignores_case() {
    let resp = Response::new(200, "x").with_header("Content-Type", "image/png");
    assert_eq!(resp.header("content-type"), Some("image/png"));
    assert_eq!(resp.header("CONTENT-TYPE"), Some("image/png"));
    assert_eq!(resp.header("etag"), None);
  }
}
