//! Error hierarchy shared across the dataplane.

mod types;

pub use types::{AdmissionError, DispatchError, OllaError};
