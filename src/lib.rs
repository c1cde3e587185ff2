// Library entry point for simplefeed
// Exposes modules for testing

pub mod api;
pub mod auth;
pub mod config;
pub mod events;
pub mod feed;
pub mod images;
pub mod models;
pub mod store;
