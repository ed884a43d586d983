pub mod config;
pub mod engine;
pub mod execution;
pub mod ingest;
pub mod models;
pub mod notify;
pub mod orchestration;
pub mod persistence;
pub mod registry;
pub mod service;
pub mod sqlite;
pub mod workers;
