//! Video to audio conversion backend: a chunked object store, a job ledger,
//! a conversion worker pool, and HTTP gateways for upload and download.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
