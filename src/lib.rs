#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod config;
pub mod cursor;
pub mod data;
pub mod error;
pub mod fetch;
pub mod model;
pub mod mutation;
pub mod playback;
pub mod player;
pub mod query;
pub mod surface;
pub mod viewport;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::{run, RunOptions};
