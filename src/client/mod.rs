// src/client/mod.rs

//! The client layer (components C7-C11): one router implementation per
//! topology, unified behind the [`facade::Client`] sum type spec §9's
//! REDESIGN FLAGS calls for in place of the original's four-implementation
//! trait object.

pub mod cluster;
pub mod facade;
pub mod replicas;
pub mod sentinel;
pub mod single_node;

pub use facade::Client;
