//! `SQLite` layer backing the local store

mod connection;
mod migrations;
mod repository;

pub use connection::Database;
pub use repository::{KvRepository, SqliteKvRepository};
