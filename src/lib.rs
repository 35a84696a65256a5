pub mod accounts;
pub mod admin;
pub mod app;
pub mod balancer;
pub mod clerk;
pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod prompt;
pub mod sse;
pub mod tokens;
pub mod translate;
