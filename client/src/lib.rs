//! Paperd.ink TRMNL client core
//!
//! Device lifecycle, TRMNL protocol handling and the streaming PNG to 1-bit
//! render pipeline. Board specifics (radio, SD card, flash, panel) are reached
//! through the collaborator traits in [`http`], [`kv`], [`cache`] and [`render`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod api;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod identity;
pub mod image;
pub mod kv;
pub mod render;
pub mod screens;

#[cfg(test)]
mod testing;

pub use client::{Client, ConnectivityState, Refresh, Step};
pub use config::Config;
pub use error::ClientError;
