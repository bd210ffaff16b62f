use std::collections::HashSet;
use tracing::debug;
use url::Url;

use super::keys::normalize_url;
use super::traits::Strategy;
use crate::net::ApiRequest;

const IMAGE_EXTENSIONS: &[&str] = &[
  "png", "jpg", "jpeg", "gif", "webp", "avif", "svg", "ico", "bmp", "heic",
];

/// Decides which strategy a read request is served with.
#[derive(Debug, Clone, Default)]
pub struct RouteRules {
  precache: Vec<Url>,
  precache_index: HashSet<String>,
  api_prefixes: Vec<String>,
}

impl RouteRules {
  pub fn new(precache: Vec<Url>, api_prefixes: Vec<String>) -> Self {
    let precache_index = precache.iter().map(normalize_url).collect();
    Self {
      precache,
      precache_index,
      api_prefixes,
    }
  }

  /// The manifest fetched on install.
  pub fn precache(&self) -> &[Url] {
    &self.precache
  }

  /// First match wins: manifest, image, API surface, everything else.
  pub fn classify(&self, request: &ApiRequest) -> Strategy {
    let strategy = if self.precache_index.contains(&normalize_url(&request.url)) {
      Strategy::CacheFirst
    } else if is_image(request) {
      Strategy::CacheFirstWithRefresh
    } else if self.is_api(&request.url) {
      Strategy::NetworkFirst
    } else {
      Strategy::StaleWhileRevalidate
    };
    debug!(url = %request.url, %strategy, "classified request");
    strategy
  }

  fn is_api(&self, url: &Url) -> bool {
    let path = url.path();
    self.api_prefixes.iter().any(|prefix| {
      let prefix = prefix.trim_end_matches('/');
      path == prefix || path.starts_with(&format!("{}/", prefix))
    })
  }
}

fn is_image(request: &ApiRequest) -> bool {
  let by_extension = request
    .url
    .path_segments()
    .and_then(|segments| segments.last())
    .and_then(|last| last.rsplit_once('.'))
    .map(|(_, ext)| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
    .unwrap_or(false);

  by_extension
    || request
      .header("accept")
      .map(|accept| accept.trim_start().starts_with("image/"))
      .unwrap_or(false)
}
