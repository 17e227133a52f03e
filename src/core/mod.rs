pub mod arrangement;
pub mod cache;
pub mod config;
pub mod digest;
pub mod error;
pub mod fabricator;
pub mod macro_main;
pub mod music;
pub mod pipeline;
pub mod scoring;
pub mod store;
pub mod time;
