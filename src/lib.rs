pub mod cache;
pub mod commands;
pub mod config;
pub mod counter;
pub mod error;
pub mod proxy;
pub mod registry;
pub mod state;
pub mod url_path;
pub mod web;
