pub mod blobs;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod render;
pub mod repos;
