pub mod admin;
pub mod auth;
pub mod conversations;
pub mod error;
pub mod identity;
pub mod middleware;
pub mod routes;
pub mod service;
