// src/lib.rs
//
// Batch instruction answering with a pretrained causal language model.

pub mod config;
pub mod dataset;
pub mod evaluate;
pub mod generation;
pub mod model;
pub mod runner;
pub mod system_resources;
pub mod template;
pub mod tokenizer;
pub mod weights;
