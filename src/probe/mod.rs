pub mod worker;

pub use worker::{ProbeEvent, ProbeWorker};
