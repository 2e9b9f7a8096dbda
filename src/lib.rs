//! Blob upload gateway: accepts multipart uploads, stores them in a
//! container and answers with a time-limited signed read URL.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
#[cfg(test)]
mod test_support;
