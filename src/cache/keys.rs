use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

use crate::net::ApiRequest;

/// Stable identity of a cacheable request, derived from method + URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey(String);

impl RequestKey {
  pub fn new(method: &str, url: &Url) -> Self {
    let input = format!("{}:{}", method.to_ascii_uppercase(), normalize_url(url));

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    Self(hex::encode(hasher.finalize()))
  }

  pub fn for_request(request: &ApiRequest) -> Self {
    Self::new(request.method.as_str(), &request.url)
  }

  /// Rebuild a key read back from storage.
  pub(crate) fn from_stored(hash: String) -> Self {
    Self(hash)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    // Short prefix is enough to tell keys apart in logs
    f.write_str(&self.0[..12.min(self.0.len())])
  }
}

/// Normalize a URL for consistent hashing.
/// Fragments never reach the server, so they don't distinguish responses.
pub(crate) fn normalize_url(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  url.to_string()
}
