pub mod actuator;
pub mod anomaly_classifier;
pub mod capture;
pub mod config;
pub mod csv_loader;
pub mod dispenser;
pub mod drop_analyzer;
pub mod envelope;
pub mod model_store;
pub mod orchestrator;
pub mod reference_builder;
pub mod sensor;
pub mod signal;
pub mod similarity;
pub mod telemetry;
pub mod tuning;
pub mod types;
