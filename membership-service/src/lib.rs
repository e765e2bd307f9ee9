pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod models;
pub mod proration;
pub mod services;
pub mod startup;
