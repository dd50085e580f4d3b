// src/cvm/mod.rs
pub mod client;
pub mod models;
pub mod selector;
