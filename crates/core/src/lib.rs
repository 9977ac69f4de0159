//! Core library: taxonomy, rule engine, oracle classification, audit and the
//! staged migration into the remote store.

pub mod audit;
pub mod classifier;
pub mod config;
pub mod embeddings;
pub mod ingest;
pub mod migration;
pub mod models;
pub mod pipeline;
pub mod remote;
pub mod retry;
pub mod rules;
pub mod store;
pub mod taxonomy;
