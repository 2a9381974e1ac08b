// Library for the binary, the demos and the tests

pub mod config;
pub mod error;
pub mod models;
pub mod query;
pub mod sampler;
pub mod session;
pub mod session_repo;
pub mod source;
pub mod store;
