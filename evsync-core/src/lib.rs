#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]

pub mod account;
pub mod api;
pub mod config;
pub mod deserializer;
pub mod entities;
pub mod events;
pub mod framework;
pub mod listener;
pub mod processors;
pub mod repository;
pub mod session;
pub mod utils;

#[cfg(test)]
mod testing;
