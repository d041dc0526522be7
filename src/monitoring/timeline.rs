//! Execution Timeline
//!
//! Records when each step of a run starts and ends, for the timing chart
//! printed with `--timeline`. Entries are labelled `job / N. step`, where
//! `N` is the step's position in its job.

use std::time::{Duration, Instant};

use indexmap::IndexMap;

use crate::report::StepStatus;

const CHART_WIDTH: f64 = 50.0;
const LABEL_WIDTH: usize = 28;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventType {
    Started,
    Finished(StepStatus),
}

#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub label: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Start and end of one labelled entry, relative to the timeline start.
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub start: Duration,
    pub end: Option<Duration>,
    pub status: Option<StepStatus>,
}

impl Span {
    pub fn duration(&self) -> Option<Duration> {
        self.end.map(|end| end.saturating_sub(self.start))
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    pub fn start(&mut self, label: impl Into<String>) {
        self.push(label.into(), EventType::Started);
    }

    pub fn finish(&mut self, label: impl Into<String>, status: StepStatus) {
        self.push(label.into(), EventType::Finished(status));
    }

    fn push(&mut self, label: String, event_type: EventType) {
        self.events.push(TimelineEvent {
            label,
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Spans in the order their entries started.
    pub fn spans(&self) -> IndexMap<String, Span> {
        let mut spans: IndexMap<String, Span> = IndexMap::new();

        for event in &self.events {
            let offset = event.timestamp.duration_since(self.start_time);
            match event.event_type {
                EventType::Started => {
                    spans.insert(
                        event.label.clone(),
                        Span {
                            start: offset,
                            end: None,
                            status: None,
                        },
                    );
                }
                EventType::Finished(status) => {
                    if let Some(span) = spans.get_mut(&event.label) {
                        span.end = Some(offset);
                        span.status = Some(status);
                    }
                }
            }
        }

        spans
    }

    /// ASCII chart: one bar per finished entry, scaled to the total run time.
    ///
    /// Bars use `#` for passed steps, `!` for failed ones; skipped steps
    /// are listed without a bar.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_ms = self.elapsed().as_millis().max(1);
        let scale = CHART_WIDTH / total_ms as f64;

        for (label, span) in self.spans() {
            let (Some(duration), Some(status)) = (span.duration(), span.status) else {
                continue;
            };

            let label = truncate(&label, LABEL_WIDTH);
            if status == StepStatus::Skipped {
                output.push_str(&format!("{} | (skipped)\n", label));
                continue;
            }

            let start_pos = (span.start.as_millis() as f64 * scale) as usize;
            let width = (duration.as_millis() as f64 * scale).max(1.0) as usize;
            let mark = if status == StepStatus::Failed { "!" } else { "#" };

            output.push_str(&format!(
                "{} |{}{}| ({} ms)\n",
                label,
                " ".repeat(start_pos),
                mark.repeat(width),
                duration.as_millis()
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", self.elapsed().as_millis()));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or cuts a label to `width` characters.
fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        format!("{:width$}", s, width = width)
    } else {
        let cut: String = s.chars().take(width - 3).collect();
        format!("{}...", cut)
    }
}
