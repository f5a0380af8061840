/// HTTP API Layer
///
/// This module provides the admin REST endpoints for storage sessions:
/// - Opening and closing sessions
/// - Inspecting checkpoints and their type previews
/// - Peeking at checkpoint rows

// Session management endpoints (POST/GET/DELETE)
pub mod sessions;

// Re-export router builder
pub use sessions::{create_session_routes, AppState};
