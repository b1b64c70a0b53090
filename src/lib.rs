pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod fleet;
pub mod gate;
pub mod geo;
pub mod models;
pub mod notify;
pub mod observability;
pub mod planner;
pub mod state;
pub mod store;
pub mod verification;
