pub mod merger;
pub mod service;

pub use service::{SearchParams, SearchService};
