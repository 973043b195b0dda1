pub mod blob;
pub mod bootstrap;
pub mod config;
pub mod handler;
pub mod ingest;
pub mod locks;
pub mod queue;
pub mod service;
