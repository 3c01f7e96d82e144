//! Network access for the controller.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;

use crate::config::Config;
use crate::request::{Request, Response};

/// Performs a request against the network.
///
/// An `Err` means the request never produced a response (offline, DNS,
/// connection reset). HTTP error statuses come back as `Ok`.
pub trait Fetcher: Send + Sync {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>>;
}

/// reqwest-backed fetcher
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(config: &Config) -> Result<Self> {
    let mut builder = reqwest::Client::builder().gzip(true).deflate(true);
    if let Some(agent) = &config.user_agent {
      builder = builder.user_agent(agent.clone());
    }

    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Fetcher for HttpFetcher {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
    Box::pin(async move {
      let response = self
        .client
        .request(request.method.clone(), request.url.clone())
        .send()
        .await
        .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

      let status = response.status().as_u16();
      let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

      Ok(
        headers
          .iter()
          .fold(Response::new(status, body.to_vec()), |resp, (name, value)| {
            resp.with_header(name, value)
          }),
      )
    })
  }
}
