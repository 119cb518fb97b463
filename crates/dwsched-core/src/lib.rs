//! `dwsched-core`: configuration, clock and shared value types for the
//! pipeline scheduler.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{format_instant, parse_instant, CivilZone, Clock, ManualClock, SystemClock};
pub use config::DwschedConfig;
pub use error::{DwschedError, Result};
pub use types::{PipelineMode, RunOptions};
