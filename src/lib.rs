//! Pressroom: an asynchronous pipeline that renders multi-page printable
//! documents. Each page layout is rasterized to PDF bytes by a shared headless
//! rendering engine, page artifacts are persisted as they complete, and the
//! worker that observes the final page atomically claims the job and triggers
//! a merge pass that concatenates all pages into one document.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
