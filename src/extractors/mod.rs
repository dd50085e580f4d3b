// src/extractors/mod.rs
// Archive resolution and structured ESG extraction.

pub mod archive;
pub mod esg;
