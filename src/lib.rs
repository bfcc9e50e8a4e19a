pub mod app;
pub mod checksum;
pub mod config;
pub mod domain;
pub mod error;
pub mod extract;
pub mod fetcher;
pub mod output;
pub mod plan;
pub mod selection;
pub mod store;
pub mod tui;
