//! KPI gate: trend aggregation, threshold flags, root-cause ranking, weight
//! calibration and the insight/recommendation synthesis built on top of them.

pub mod calibration;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod flags;
pub mod models;
pub mod period;
pub mod rca;
pub mod report;
pub mod store;
pub mod synth;
pub mod trend;

pub use config::GateConfig;
pub use engine::Engine;
pub use error::{GateError, Result};
pub use period::{PeriodKey, PeriodRange, Window};
pub use store::{GateStore, InMemoryStore, ReadingSource, TargetSource};
