pub mod archive;
pub mod bundler;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod naming;
pub mod prefs;
pub mod state;
pub mod types;
