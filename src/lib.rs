pub mod accessor;
pub mod cache;
pub mod cli;
pub mod config;
pub mod flock;
pub mod git;
pub mod model;
pub mod nar;
pub mod store;

mod api;

pub use api::{Fetched, Srcfetch, SrcfetchBuilder};
