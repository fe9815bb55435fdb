pub mod annotate;
pub mod config;
pub mod detector;
pub mod error;
pub mod routes;
pub mod storage;
pub mod synthetic;
