pub mod error;
pub mod events;
pub mod facades;
pub mod models;
pub mod settings;
