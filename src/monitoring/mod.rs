//! Run Monitoring
//!
//! - [`ExecutionTimeline`]: step start/end timing and the timing chart

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, Span, TimelineEvent};
