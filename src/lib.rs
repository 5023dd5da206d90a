// src/lib.rs

//! Changelog pipeline library.
//!
//! Watches package registries, crawls changed packages into a durable
//! change store, and keeps derived views (search index, feeds, homepage)
//! current.

pub mod bus;
pub mod config;
pub mod error;
#[cfg(feature = "lambda")]
pub mod lambda;
pub mod models;
pub mod pipeline;
pub mod registry;
pub mod services;
pub mod storage;
pub mod utils;
