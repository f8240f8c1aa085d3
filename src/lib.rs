// ABOUTME: Library root for sqlite-pg-sync
// ABOUTME: Replicates daily SQLite partition files into PostgreSQL by watermark

pub mod config;
pub mod error;
pub mod postgres;
pub mod profile;
pub mod replication;
pub mod sqlite;
pub mod timestamp;
pub mod utils;
