pub mod config;
pub mod error;
pub mod matcher;
pub mod pipeline;
pub mod rule;
pub mod sink;
pub mod throttle;
pub mod window;

pub use config::{load_dotenv, DetectConfig};
pub use error::DetectError;
pub use matcher::{ConsumerChain, FieldMatcher, MatchedRow, RowSink};
pub use pipeline::{
    DetectionPipeline, EventSource, ExecutionRecord, ExecutionStatus, ExecutionTracker,
    RunOutcome, RunStats, SourceState,
};
pub use rule::{FieldEqualsPredicate, NotificationConfig, OutputColumn, RowPredicate, Rule};
pub use sink::{DetectionSink, MemorySink};
pub use throttle::{NoopThrottle, NotificationThrottle, Throttle, ThrottlePolicy, ThrottleRegistry};
pub use window::{compute_window, ExecutionWindow, WindowParams};
