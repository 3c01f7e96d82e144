//! Request classification: which strategy family a request belongs to.

use crate::config::Config;
use crate::request::{Destination, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Image by extension or declared destination
  Image,
  /// API calls and JSON data, kept fresh
  Dynamic,
  /// Documents, scripts, styles
  Other,
}

/// Classify a request. Image wins over dynamic when both match.
pub fn classify(request: &Request, config: &Config) -> RequestClass {
  let path = request.url.path();

  let is_image = request.destination == Destination::Image
    || config
      .image_extensions
      .iter()
      .any(|ext| path.ends_with(ext.as_str()));
  if is_image {
    return RequestClass::Image;
  }

  if path.contains(config.dynamic.path_segment.as_str())
    || path.ends_with(config.dynamic.suffix.as_str())
  {
    return RequestClass::Dynamic;
  }

  RequestClass::Other
}
