// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Call tracing for public runtime operations.
//!
//! A [`Tracer`] is owned by the device registry and shared by every device
//! and stream created from it. When enabled, each traced call records a
//! [`TraceEvent`] with its start and end time relative to the tracer's
//! creation, a short argument summary and, depending on [`StackCapture`],
//! the caller's location or a full backtrace.
//!
//! [`Tracer::report`] renders the recorded events one per line as
//! `function;tstart;tend;tdiff;args;stack` and emits them under the
//! `offload::trace` target.

use crate::config::OffloadConfig;
use parking_lot::Mutex;
use std::backtrace::Backtrace;
use std::fmt;
use std::panic::Location;
use std::time::{Duration, Instant};

/// Granularity of call-stack capture in trace events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StackCapture {
    /// No stack information.
    None,
    /// Source location of the immediate caller.
    #[default]
    Compact,
    /// Full backtrace of the calling thread.
    Full,
}

impl StackCapture {
    /// Parse a capture mode name; unknown names select `Compact`.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "none" => Self::None,
            "full" => Self::Full,
            _ => Self::Compact,
        }
    }

    #[track_caller]
    fn capture(self) -> String {
        match self {
            Self::None => String::new(),
            Self::Compact => Location::caller().to_string(),
            Self::Full => Backtrace::force_capture()
                .to_string()
                .replace('\n', " | "),
        }
    }
}

/// One recorded call.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    /// Name of the traced operation.
    pub function: &'static str,
    /// Start offset from tracer creation.
    pub start: Duration,
    /// End offset from tracer creation.
    pub end: Duration,
    /// Argument summary.
    pub args: String,
    /// Captured stack, empty for [`StackCapture::None`].
    pub stack: String,
}

impl TraceEvent {
    /// Wall time spent in the call.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{};{:.9};{:.9};{:.9};{};{}",
            self.function,
            self.start.as_secs_f64(),
            self.end.as_secs_f64(),
            self.duration().as_secs_f64(),
            self.args,
            self.stack
        )
    }
}

/// Recorder for traced calls.
#[derive(Debug)]
pub struct Tracer {
    enabled: bool,
    capture: StackCapture,
    epoch: Instant,
    events: Mutex<Vec<TraceEvent>>,
}

impl Tracer {
    /// Create a tracer; it records only when `level >= 1`.
    #[must_use]
    pub fn new(level: u32, capture: StackCapture) -> Self {
        Self {
            enabled: level >= 1,
            capture,
            epoch: Instant::now(),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Tracer that records nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(0, StackCapture::None)
    }

    /// Tracer configured from the runtime configuration.
    #[must_use]
    pub fn from_config(config: &OffloadConfig) -> Self {
        Self::new(config.trace_level, config.trace_stacks)
    }

    /// Whether calls are being recorded.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Begin tracing a call; the event is recorded when the guard drops.
    ///
    /// `args` is only evaluated when tracing is enabled.
    #[track_caller]
    pub fn start(&self, function: &'static str, args: impl FnOnce() -> String) -> TraceGuard<'_> {
        if !self.enabled {
            return TraceGuard { active: None };
        }
        let stack = self.capture.capture();
        TraceGuard {
            active: Some(ActiveTrace {
                tracer: self,
                function,
                args: args(),
                stack,
                start: self.epoch.elapsed(),
            }),
        }
    }

    /// Snapshot of the recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    /// Discard recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Render all events and emit them under `offload::trace`.
    pub fn report(&self) -> String {
        let events = self.events.lock();
        let mut out = String::new();
        for event in events.iter() {
            let line = event.to_string();
            tracing::info!(target: "offload::trace", "{line}");
            out.push_str(&line);
            out.push('\n');
        }
        out
    }

    fn record(&self, event: TraceEvent) {
        self.events.lock().push(event);
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Records a [`TraceEvent`] when dropped.
#[must_use = "the call is recorded when the guard is dropped"]
pub struct TraceGuard<'a> {
    active: Option<ActiveTrace<'a>>,
}

struct ActiveTrace<'a> {
    tracer: &'a Tracer,
    function: &'static str,
    args: String,
    stack: String,
    start: Duration,
}

impl Drop for TraceGuard<'_> {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            let end = active.tracer.epoch.elapsed();
            active.tracer.record(TraceEvent {
                function: active.function,
                start: active.start,
                end,
                args: active.args,
                stack: active.stack,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_capture_names() {
        assert_eq!(StackCapture::from_name("none"), StackCapture::None);
        assert_eq!(StackCapture::from_name("FULL"), StackCapture::Full);
        assert_eq!(StackCapture::from_name("compact"), StackCapture::Compact);
        assert_eq!(StackCapture::from_name("bogus"), StackCapture::Compact);
    }

    #[test]
    fn test_disabled_tracer_records_nothing() {
        let tracer = Tracer::disabled();
        {
            let _guard = tracer.start("sync", || panic!("args must not be evaluated"));
        }
        assert!(tracer.events().is_empty());
        assert!(tracer.report().is_empty());
    }

    #[test]
    fn test_compact_trace_records_caller() {
        let tracer = Tracer::new(1, StackCapture::Compact);
        {
            let _guard = tracer.start("invoke", || "kernel=dfill".to_string());
        }
        let events = tracer.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].function, "invoke");
        assert_eq!(events[0].args, "kernel=dfill");
        assert!(events[0].stack.contains("trace.rs"));
        assert!(events[0].end >= events[0].start);

        let report = tracer.report();
        assert!(report.starts_with("invoke;"));
        assert_eq!(report.lines().next().unwrap().split(';').count(), 6);

        tracer.clear();
        assert!(tracer.events().is_empty());
    }

    #[test]
    fn test_no_stack_capture() {
        let tracer = Tracer::new(2, StackCapture::None);
        drop(tracer.start("bind", String::new));
        assert!(tracer.events()[0].stack.is_empty());
    }
}
