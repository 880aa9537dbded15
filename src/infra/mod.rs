//! Infrastructure adapters: persistence, blob storage, the headless engine
//! and process-level telemetry.

pub mod chromium;
pub mod db;
pub mod error;
pub mod fs_blobs;
pub mod memory;
pub mod telemetry;
