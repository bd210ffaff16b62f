//! Serde types matching the backend's JSON bodies.
//!
//! These types are separate from the queue and token types so the wire format
//! can change without touching persisted state.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{SyncError, SyncResult};

// ============================================================================
// Authentication
// ============================================================================

#[derive(Debug, Serialize)]
pub struct LoginRequest<'a> {
  pub username: &'a str,
  pub password: &'a str,
}

#[derive(Debug, Serialize)]
pub struct RefreshRequest<'a> {
  pub refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
  pub access_token: String,
  /// Absent when the server does not rotate refresh tokens
  #[serde(default)]
  pub refresh_token: Option<String>,
  #[serde(default)]
  pub token_type: Option<String>,
}

// ============================================================================
// Submissions
// ============================================================================

/// Body returned by the submission endpoint once a batch is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
  pub task_id: String,
  pub status: String,
  #[serde(default)]
  pub message: Option<String>,
}

/// One captured photo, base64-encoded the way the upload endpoint expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedPhoto {
  pub image_data: String,
  pub category: String,
}

/// Optional vehicle details typed in by the user at capture time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VehicleDetails {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub vin: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub make: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub model: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub year: Option<i32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub auction_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub asking_price: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub notes: Option<String>,
}

/// A batch of photos handed over by the capture layer as a single write.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhotoBatch {
  pub photos: Vec<CapturedPhoto>,
  #[serde(default)]
  pub vehicle: VehicleDetails,
}

impl PhotoBatch {
  pub fn new(vehicle: VehicleDetails) -> Self {
    Self {
      photos: Vec::new(),
      vehicle,
    }
  }

  pub fn add_photo(&mut self, bytes: &[u8], category: impl Into<String>) {
    self.photos.push(CapturedPhoto {
      image_data: STANDARD.encode(bytes),
      category: category.into(),
    });
  }

  /// Read a photo from disk and add it under the given category.
  pub fn add_file(&mut self, path: &Path, category: &str) -> Result<()> {
    let bytes = std::fs::read(path)
      .map_err(|e| eyre!("Failed to read photo {}: {}", path.display(), e))?;
    self.add_photo(&bytes, category);
    Ok(())
  }

  /// Serialize into the opaque payload stored by the upload queue.
  pub fn encode(&self) -> SyncResult<Vec<u8>> {
    if self.photos.is_empty() {
      return Err(SyncError::InvalidRequest("photo batch is empty".into()));
    }
    serde_json::to_vec(self)
      .map_err(|e| SyncError::InvalidRequest(format!("failed to encode photo batch: {}", e)))
  }

  /// Metadata stored alongside the payload and sent as query parameters.
  pub fn metadata(&self) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    let mut categories: Vec<&str> = Vec::new();
    for photo in &self.photos {
      if !categories.contains(&photo.category.as_str()) {
        categories.push(&photo.category);
      }
    }
    metadata.insert("category".to_string(), categories.join(","));
    metadata.insert("photo_count".to_string(), self.photos.len().to_string());
    if let Some(vin) = &self.vehicle.vin {
      metadata.insert("vin".to_string(), vin.clone());
    }
    if let Some(auction_id) = &self.vehicle.auction_id {
      metadata.insert("auction_id".to_string(), auction_id.clone());
    }
    metadata
  }
}
