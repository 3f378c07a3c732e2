//! Durable state: the KV store wrapper and the manager's key schema

pub mod db;
pub mod schema;

pub use db::{Db, DbError};
