pub mod cache;
pub mod config;
pub mod error;
pub mod hierarchy;
pub mod migrate;
pub mod navigation;
pub mod page;
pub mod remote;
pub mod runtime;
pub mod search;
pub mod store;
pub mod sync;
pub mod transform;

#[cfg(test)]
mod test_http;
