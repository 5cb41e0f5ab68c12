pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod fanout;
pub mod files;
pub mod hub;
pub mod identity;
pub mod messages;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod router;
pub mod session;
pub mod ws;

#[cfg(test)]
mod testing;
