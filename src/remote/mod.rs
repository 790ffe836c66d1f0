// ABOUTME: Remote changeset service access
// ABOUTME: URL construction, response shape and the HTTP-backed ChangesetSource

pub mod client;
pub mod models;

pub use client::{ChangesetClient, ChangesetSource};
pub use models::{build_changeset_url, FetchResponse};
