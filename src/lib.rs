pub mod analyzer;
pub mod config;
pub mod errors;
pub mod models;
pub mod proxy;
pub mod services;
pub mod sessions;
pub mod ssdp;
pub mod transcoder;
pub mod web;
