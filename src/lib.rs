pub mod api;
pub mod cache;
pub mod config;
pub mod models;
pub mod plugin;
pub mod search;
pub mod state;
pub mod tg;
pub mod util;
