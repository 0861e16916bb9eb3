pub mod config;
pub mod credentials;
pub mod error;
pub mod oauth;
pub mod operations;
pub mod replica;
pub mod runtime;
pub mod session;
