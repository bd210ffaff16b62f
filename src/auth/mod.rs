//! Credentials and the authenticated request pipeline.

mod api;
mod pipeline;
mod tokens;

pub use api::{AuthApi, AuthEndpoints, HttpAuthApi};
pub use pipeline::{AuthPipeline, PipelinePhase};
pub use tokens::{TokenPair, TokenStore};
