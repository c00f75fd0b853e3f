// QoS module: admission control for outbound sends

pub mod admission;

pub use admission::{AdmissionController, AdmissionError, RateBucket};
