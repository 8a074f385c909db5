pub mod backfill;
pub mod collaborators;
pub mod config;
pub mod connection;
pub mod database;
pub mod dispatcher;
pub mod error;
pub mod group_ack;
pub mod registry;
pub mod store;
pub mod sweeper;
pub mod websocket;

pub use error::ImError;
