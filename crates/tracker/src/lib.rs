pub mod config;
pub mod error;
pub mod format;
pub mod schedule;
pub mod progress_log;
pub mod recorder;
pub mod instrument;
pub mod ffprobe;
pub mod task;
pub mod status;
pub mod scan;
pub mod pipeline;
pub mod recovery;

pub use config::{StageConfig, TrackerConfig};
pub use error::{TrackerError, TrackerResult};
pub use schedule::{compute_schedule, SkipRequest, StageDescriptor, StepSchedule, TimeBudget};
pub use progress_log::ProgressLog;
pub use recorder::ProgressRecorder;
pub use instrument::{instrument, DurationProbe, PipelineInstrumentor, TaskInputs};
pub use status::{derive_status, ProgressSnapshot, TaskState, TaskStatus};
pub use scan::TaskSummary;
