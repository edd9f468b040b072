//! Support ticket service and client toolkit.
//!
//! The crate has two halves that share the wire types in [`api`]:
//! - a client side: a cached, de-duplicated resource fetch controller
//!   ([`fetch`]) and a typed API wrapper ([`api::client`]),
//! - a server side: the HTTP API with its relational store and the
//!   fallback path for temporary/demo tickets ([`server`]).

pub mod api;
pub mod config;
pub mod fetch;
pub mod resource;
pub mod server;
