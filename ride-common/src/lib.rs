pub mod artifacts;
pub mod config;
pub mod decode;
pub mod emitter;
pub mod events;
pub mod features;
pub mod health;
pub mod metrics;
pub mod predictor;
pub mod service;
pub mod stream;
