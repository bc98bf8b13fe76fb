// Data model and configuration
pub mod config;
pub mod models;
pub mod pipeline_config;

// Rule generation pipeline
pub mod cluster_engine;
pub mod kmeans;
pub mod normalizer;
pub mod pipeline;
pub mod regex_synth;
pub mod rule_builder;
pub mod signature;
pub mod tfidf;

// Windowing, persistence and export
pub mod checkpoint;
pub mod exporter;
pub mod implementations;
pub mod sqlite_store;
pub mod traits;
