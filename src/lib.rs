//! oastwatch - client-side monitor for out-of-band (OAST) interactions
//!
//! Registers encrypted sessions with Interactsh-protocol servers, mints
//! disposable subdomains under them, and polls each server for the
//! interactions (HTTP hits, DNS queries, SMTP connects, ...) that
//! external targets direct at the minted subdomains.

pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod http;
pub mod manager;
pub mod models;
pub mod persistence;
pub mod protocol;
