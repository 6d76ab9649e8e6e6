//! Sharing of discovered network services between friends.
//!
//! Owners publish the services found on their network, grant or revoke
//! access per friend, and every change is queued for the advertisement
//! daemon in the same transaction that applies it.

pub mod api;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod friends;
pub mod identity;
pub mod service;
pub mod store;
pub mod store_manager;
