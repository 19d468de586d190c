pub mod api;
pub mod cli;
pub mod config;
pub mod derp_map;
pub mod discovery;
pub mod error;
pub mod models;
pub mod persistence;
pub mod probe;
pub mod push;
pub mod ranking;
pub mod redis_cache;
pub mod registry;
pub mod scheduler;
pub mod supervisor;
pub mod utils;
