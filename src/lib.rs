pub mod config;
pub mod engine;
pub mod enrich;
pub mod error;
pub mod geometry;
pub mod interaction;
pub mod loader;
pub mod normalize;
pub mod reconcile;
pub mod render;
pub mod resolver;
pub mod server;
pub mod types;
pub mod viewport;
