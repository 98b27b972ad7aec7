pub mod classify;
pub mod config;
pub mod report;
pub mod timeline;
pub mod types;

pub use classify::classify;
pub use config::{ConfigError, RunConfiguration};
pub use report::{ReportError, RunReport};
pub use timeline::{TimelineKind, TimelineRow, TimelineWriter};
pub use types::*;
