pub mod app;
pub mod backend;
pub mod config;
pub mod error;
pub mod handlers;
pub mod messages;
pub mod proxy;
pub mod tools;
pub mod transcoder;
pub mod upstream;
