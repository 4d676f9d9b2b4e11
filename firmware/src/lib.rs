#![no_std]

extern crate alloc;

pub mod battery;
pub mod cache;
pub mod epd;
pub mod framebuffer;
pub mod heap;
pub mod http;
pub mod https;
pub mod net;
pub mod settings;
