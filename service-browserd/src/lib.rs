pub mod api;
pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod hash;
pub mod hub;
pub mod pipeline;
pub mod registration;
pub mod session;
pub mod store;
