pub(crate) mod retry;

pub mod commands;
pub mod config;
pub mod context;
pub mod export;
pub mod http_client;
pub mod models;
pub mod polygon;
pub mod scheduler;
pub mod warehouse;
