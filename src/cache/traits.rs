//! Core types for the caching system.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::keys::RequestKey;
use crate::net::ApiResponse;

/// How a read request blends cache and network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
  /// Precached, immutable for the lifetime of a namespace
  CacheFirst,
  /// Serve cached immediately, refresh in the background
  CacheFirstWithRefresh,
  /// Live data preferred, cache as offline fallback
  NetworkFirst,
  /// Serve cached immediately, always revalidate for next time
  StaleWhileRevalidate,
}

impl Strategy {
  pub fn as_str(&self) -> &'static str {
    match self {
      Strategy::CacheFirst => "cache-first",
      Strategy::CacheFirstWithRefresh => "cache-first-with-refresh",
      Strategy::NetworkFirst => "network-first",
      Strategy::StaleWhileRevalidate => "stale-while-revalidate",
    }
  }

  /// Which namespace class entries fetched under this strategy belong to.
  pub fn asset_class(&self) -> AssetClass {
    match self {
      Strategy::CacheFirst => AssetClass::Static,
      Strategy::CacheFirstWithRefresh => AssetClass::Images,
      Strategy::NetworkFirst => AssetClass::Api,
      Strategy::StaleWhileRevalidate => AssetClass::Misc,
    }
  }
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Strategy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "cache-first" => Ok(Strategy::CacheFirst),
      "cache-first-with-refresh" => Ok(Strategy::CacheFirstWithRefresh),
      "network-first" => Ok(Strategy::NetworkFirst),
      "stale-while-revalidate" => Ok(Strategy::StaleWhileRevalidate),
      other => Err(format!("unknown cache strategy '{}'", other)),
    }
  }
}

/// Asset classes; each gets exactly one current namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetClass {
  Static,
  Images,
  Api,
  Misc,
}

impl AssetClass {
  pub const ALL: [AssetClass; 4] = [
    AssetClass::Static,
    AssetClass::Images,
    AssetClass::Api,
    AssetClass::Misc,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      AssetClass::Static => "static",
      AssetClass::Images => "images",
      AssetClass::Api => "api",
      AssetClass::Misc => "misc",
    }
  }
}

impl FromStr for AssetClass {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    AssetClass::ALL
      .into_iter()
      .find(|class| class.as_str() == s)
      .ok_or_else(|| format!("unknown asset class '{}'", s))
  }
}

/// A versioned partition of the cache store, e.g. `images-v2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNamespace {
  pub name: String,
  pub class: AssetClass,
  pub version: String,
}

impl CacheNamespace {
  pub fn new(class: AssetClass, version: &str) -> Self {
    Self {
      name: format!("{}-{}", class.as_str(), version),
      class,
      version: version.to_string(),
    }
  }

  /// One namespace per asset class for a cache version.
  pub fn all_for(version: &str) -> Vec<Self> {
    AssetClass::ALL
      .into_iter()
      .map(|class| Self::new(class, version))
      .collect()
  }
}

/// A stored response. Replaced wholesale on re-fetch, never edited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub request_key: RequestKey,
  pub url: String,
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  pub strategy: Strategy,
  pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn from_response(
    request_key: RequestKey,
    url: &url::Url,
    strategy: Strategy,
    response: &ApiResponse,
  ) -> Self {
    Self {
      request_key,
      url: url.to_string(),
      status: response.status,
      headers: response.headers.clone(),
      body: response.body.clone(),
      strategy,
      stored_at: Utc::now(),
    }
  }

  pub fn to_response(&self) -> ApiResponse {
    ApiResponse {
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// The request never touched the cache.
  pub fn bypass(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Bypass,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Served from cache (a background refresh may be running)
  Cache,
  /// Offline mode - network unavailable, serving cached data
  Offline,
  /// Not cacheable or router not active
  Bypass,
}
