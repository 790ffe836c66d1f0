// ABOUTME: Library root for geo-changeset-sync
// ABOUTME: Incremental WFS changeset synchronization into PostGIS target tables

pub mod changeset;
pub mod commands;
pub mod config;
pub mod error;
pub mod materialize;
pub mod pipeline;
pub mod postgres;
pub mod registry;
pub mod remote;
pub mod utils;
pub mod watermark;

pub use error::SyncError;
pub use pipeline::{BatchReport, Pipeline, SyncResult, SyncStatus};
pub use registry::DatasetDescriptor;
pub use watermark::SyncWindow;
