pub mod config;
pub mod events;
mod pipeline;
pub mod report;
pub mod service;
pub mod state;

pub use config::{ScanSettings, ScannerConfig};
pub use events::{EventNotifier, ScanEvent, ScanEventKind};
pub use pipeline::EngineError;
pub use report::{format_elapsed, render_report, status_line, summary_line};
pub use service::ScanService;
pub use state::{
    FileOutcome, ScanLifecycle, ScanOutcome, ScanRejected, ScanState, ScanStats, ScanStatus,
};
