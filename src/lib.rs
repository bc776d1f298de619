pub mod aggregate;
pub mod banner;
pub mod config;
pub mod consts;
pub mod engine;
pub mod error;
pub mod events;
pub mod history;
pub mod ingest;
pub mod preprocess;
pub mod present;
pub mod server;
pub mod stage;
