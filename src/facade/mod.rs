//! Async entry point tying a backend, a bridge and the model registry together.

pub mod database;

pub use database::AsyncDatabase;
