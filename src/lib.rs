pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod models;
pub mod notify;
pub mod rate_limit;
pub mod routes;
pub mod schema;
pub mod security;
pub mod state;
pub mod storage;
pub mod upload;
pub mod utils;
pub mod workflow;
