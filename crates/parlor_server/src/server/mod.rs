#![forbid(unsafe_code)]

pub mod auth;
pub mod engine;
pub mod http;
pub mod hub;
pub mod presence;
pub mod session;
pub mod store;
pub mod users;
