//! Devgate - a local supervisor for developer-run servers
//!
//! This library provides a daemon that:
//! - Starts, tracks and tears down server processes by name
//! - Fans one server definition out into variants, one per value of a
//!   declared env-subdomain variable, each on its own port
//! - Keeps a reverse proxy routing `name[.variant].<tld>` to whichever
//!   variants are currently alive
//! - Exposes a listing and control API over HTTP

pub mod api;
pub mod config;
pub mod daemon;
pub mod domain;
pub mod error;
pub mod logs;
pub mod ports;
pub mod process;
pub mod proxy;
pub mod routing;
pub mod store;
pub mod variant;
