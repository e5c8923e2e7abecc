#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod compose;
pub mod config;
pub mod feed;
pub mod firebase;
pub mod identity;
pub mod model;
pub mod oauth;
pub mod playback;
pub mod profile;
pub mod session;
pub mod storage;
pub mod store;
pub mod viewport;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
