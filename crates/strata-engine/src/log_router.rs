//! Fan-out of user-visible log entries to registered destinations.
//!
//! Each registration is immutable once added: a destination, a minimum
//! level, an optional filter and a set of message ids whose warnings this
//! destination wants to see as information. [`LogRouter::write_message`]
//! walks the registrations in order under one lock, so every destination
//! sees entries in call order and never concurrently.

use std::collections::HashSet;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::filter::wildcard_match;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    Profiling,
    Verbose,
    Information,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Profiling => "Profiling",
            Self::Verbose => "Verbose",
            Self::Information => "Information",
            Self::Warning => "Warning",
            Self::Error => "Error",
        })
    }
}

/// One log event. Cheap to clone, never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Template with `{0}`, `{1}`... placeholders.
    pub message: String,
    pub arguments: Vec<String>,
    pub level: LogLevel,
    pub tag: String,
    /// Stable identifier used for filtering and suppression.
    pub message_id: String,
    pub exception: Option<String>,
}

impl LogEntry {
    pub fn new(
        level: LogLevel,
        tag: impl Into<String>,
        message_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            arguments: Vec::new(),
            level,
            tag: tag.into(),
            message_id: message_id.into(),
            exception: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.arguments = args.into_iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_exception(mut self, exception: impl fmt::Display) -> Self {
        self.exception = Some(exception.to_string());
        self
    }

    /// The message with placeholders substituted.
    pub fn formatted(&self) -> String {
        let mut out = self.message.clone();
        for (i, arg) in self.arguments.iter().enumerate() {
            out = out.replace(&format!("{{{}}}", i), arg);
        }
        out
    }

    /// `"{level}-{tag}-{message_id}"`, the string filters match against.
    pub fn filter_tag(&self) -> String {
        format!("{}-{}-{}", self.level, self.tag, self.message_id)
    }

    fn at_level(&self, level: LogLevel) -> Self {
        Self {
            level,
            ..self.clone()
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]: {}", self.filter_tag(), self.formatted())?;
        if let Some(exception) = &self.exception {
            write!(f, " ({})", exception)?;
        }
        Ok(())
    }
}

/// Anything that can receive log entries.
pub trait LogDestination: Send + Sync {
    fn write_message(&self, entry: &LogEntry) -> io::Result<()>;
}

/// Include/exclude patterns over [`LogEntry::filter_tag`].
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl LogFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries matching `pattern` are delivered even below the minimum level.
    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.include.push(pattern.into());
        self
    }

    /// Entries matching `pattern` are never delivered.
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude.push(pattern.into());
        self
    }

    fn excludes(&self, tag: &str) -> bool {
        self.exclude.iter().any(|p| wildcard_match(p, tag))
    }

    fn includes(&self, tag: &str) -> bool {
        self.include.iter().any(|p| wildcard_match(p, tag))
    }

    /// Whether the entry falls under this filter at all.
    fn matches(&self, tag: &str) -> bool {
        !self.excludes(tag) && (self.include.is_empty() || self.includes(tag))
    }
}

struct Registration {
    destination: Arc<dyn LogDestination>,
    minimum: LogLevel,
    filter: Option<LogFilter>,
    suppressed: HashSet<String>,
}

impl Registration {
    /// The entry as this destination should receive it, or `None`.
    fn view(&self, entry: &LogEntry) -> Option<LogEntry> {
        // The filter tag is computed at the original level so patterns like
        // "Warning-*" keep matching entries that end up downgraded.
        let tag = entry.filter_tag();
        if let Some(filter) = &self.filter {
            if filter.excludes(&tag) {
                return None;
            }
        }

        let in_scope = self.filter.as_ref().map(|f| f.matches(&tag)).unwrap_or(true);
        let level = if entry.level == LogLevel::Warning
            && in_scope
            && self.suppressed.contains(&entry.message_id)
        {
            LogLevel::Information
        } else {
            entry.level
        };

        let forced = self.filter.as_ref().map(|f| f.includes(&tag)).unwrap_or(false);
        if level < self.minimum && !forced {
            return None;
        }
        Some(if level == entry.level {
            entry.clone()
        } else {
            entry.at_level(level)
        })
    }
}

/// Routes each entry to every registered destination.
#[derive(Default)]
pub struct LogRouter {
    targets: Mutex<Vec<Registration>>,
}

impl LogRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a destination. `None` is accepted and ignored.
    pub fn add_target(
        &self,
        destination: Option<Arc<dyn LogDestination>>,
        minimum: LogLevel,
        filter: Option<LogFilter>,
    ) {
        self.add_target_with_suppression(destination, minimum, filter, Vec::<String>::new());
    }

    /// Register a destination that sees warnings with the given message
    /// ids as information.
    pub fn add_target_with_suppression<I, S>(
        &self,
        destination: Option<Arc<dyn LogDestination>>,
        minimum: LogLevel,
        filter: Option<LogFilter>,
        suppressed: I,
    ) where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let Some(destination) = destination else {
            return;
        };
        self.lock().push(Registration {
            destination,
            minimum,
            filter,
            suppressed: suppressed.into_iter().map(Into::into).collect(),
        });
    }

    pub fn target_count(&self) -> usize {
        self.lock().len()
    }

    /// Deliver to every target in registration order. A failing target is
    /// reported and skipped; the others still receive the entry.
    pub fn write_message(&self, entry: &LogEntry) {
        let targets = self.lock();
        for (index, target) in targets.iter().enumerate() {
            let Some(view) = target.view(entry) else {
                continue;
            };
            if let Err(e) = target.destination.write_message(&view) {
                tracing::warn!(target_index = index, error = %e, "log destination failed");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Registration>> {
        self.targets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Forwards entries to `tracing`.
#[derive(Debug, Default)]
pub struct TracingDestination;

impl LogDestination for TracingDestination {
    fn write_message(&self, entry: &LogEntry) -> io::Result<()> {
        let message = entry.formatted();
        let id = entry.message_id.as_str();
        let tag = entry.tag.as_str();
        match entry.level {
            LogLevel::Error => tracing::error!(tag, message_id = id, exception = ?entry.exception, "{}", message),
            LogLevel::Warning => tracing::warn!(tag, message_id = id, "{}", message),
            LogLevel::Information => tracing::info!(tag, message_id = id, "{}", message),
            LogLevel::Verbose => tracing::debug!(tag, message_id = id, "{}", message),
            LogLevel::Profiling => tracing::trace!(tag, message_id = id, "{}", message),
        }
        Ok(())
    }
}

/// Writes one line per entry to any writer, typically a log file.
pub struct StreamDestination {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl StreamDestination {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Append to the file at `path`, creating it if needed.
    pub fn append_to(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(Box::new(file)))
    }
}

impl LogDestination for StreamDestination {
    fn write_message(&self, entry: &LogEntry) -> io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{} {}", Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"), entry)?;
        writer.flush()
    }
}

/// Keeps every delivered entry in memory.
#[derive(Debug, Default)]
pub struct MemoryDestination {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl LogDestination for MemoryDestination {
    fn write_message(&self, entry: &LogEntry) -> io::Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl LogDestination for Failing {
        fn write_message(&self, _entry: &LogEntry) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"))
        }
    }

    fn warning(id: &str) -> LogEntry {
        LogEntry::new(LogLevel::Warning, "Backup", id, "something about {0}").with_args(["x"])
    }

    #[test]
    fn test_formatting() {
        let entry = LogEntry::new(LogLevel::Error, "Restore", "BlockMissing", "block {0} of {1}")
            .with_args(["abc", "/f"]);
        assert_eq!(entry.formatted(), "block abc of /f");
        assert_eq!(entry.filter_tag(), "Error-Restore-BlockMissing");
    }

    #[test]
    fn test_minimum_level() {
        let router = LogRouter::new();
        let sink = Arc::new(MemoryDestination::new());
        router.add_target(Some(sink.clone()), LogLevel::Warning, None);

        router.write_message(&LogEntry::new(LogLevel::Information, "T", "Info", "hello"));
        router.write_message(&warning("W"));
        router.write_message(&LogEntry::new(LogLevel::Error, "T", "E", "bad"));

        let seen: Vec<LogLevel> = sink.entries().iter().map(|e| e.level).collect();
        assert_eq!(seen, vec![LogLevel::Warning, LogLevel::Error]);
    }

    #[test]
    fn test_suppression_is_per_target() {
        let router = LogRouter::new();
        let suppressing = Arc::new(MemoryDestination::new());
        let plain = Arc::new(MemoryDestination::new());
        router.add_target_with_suppression(
            Some(suppressing.clone()),
            LogLevel::Information,
            None,
            ["Noisy"],
        );
        router.add_target(Some(plain.clone()), LogLevel::Information, None);

        router.write_message(&warning("Noisy"));
        router.write_message(&warning("Other"));

        let s = suppressing.entries();
        assert_eq!(s[0].level, LogLevel::Information);
        assert_eq!(s[1].level, LogLevel::Warning);
        let p = plain.entries();
        assert_eq!(p[0].level, LogLevel::Warning);
    }

    #[test]
    fn test_suppressed_warning_can_fall_below_minimum() {
        let router = LogRouter::new();
        let sink = Arc::new(MemoryDestination::new());
        router.add_target_with_suppression(Some(sink.clone()), LogLevel::Warning, None, ["Noisy"]);
        router.write_message(&warning("Noisy"));
        assert!(sink.entries().is_empty());
    }

    #[test]
    fn test_suppression_limited_to_filter_scope() {
        let router = LogRouter::new();
        let sink = Arc::new(MemoryDestination::new());
        router.add_target_with_suppression(
            Some(sink.clone()),
            LogLevel::Information,
            Some(LogFilter::new().include("*-Restore-*")),
            ["Noisy"],
        );
        router.write_message(&warning("Noisy"));
        assert_eq!(sink.entries()[0].level, LogLevel::Warning);
    }

    #[test]
    fn test_filter_include_and_exclude() {
        let router = LogRouter::new();
        let sink = Arc::new(MemoryDestination::new());
        let filter = LogFilter::new()
            .include("Verbose-Upload-*")
            .exclude("*-Upload-Retry");
        router.add_target(Some(sink.clone()), LogLevel::Warning, Some(filter));

        router.write_message(&LogEntry::new(LogLevel::Verbose, "Upload", "Done", "ok"));
        router.write_message(&LogEntry::new(LogLevel::Verbose, "Upload", "Retry", "again"));
        router.write_message(&LogEntry::new(LogLevel::Verbose, "Backup", "Done", "ok"));
        router.write_message(&LogEntry::new(LogLevel::Error, "Upload", "Retry", "gave up"));

        let ids: Vec<String> = sink.entries().into_iter().map(|e| e.message_id).collect();
        assert_eq!(ids, vec!["Done".to_string()]);
    }

    #[test]
    fn test_null_target_ignored() {
        let router = LogRouter::new();
        router.add_target(None, LogLevel::Profiling, None);
        assert_eq!(router.target_count(), 0);
        router.write_message(&warning("W"));
    }

    #[test]
    fn test_failing_target_does_not_block_others() {
        let router = LogRouter::new();
        let sink = Arc::new(MemoryDestination::new());
        router.add_target(Some(Arc::new(Failing)), LogLevel::Profiling, None);
        router.add_target(Some(sink.clone()), LogLevel::Profiling, None);

        router.write_message(&warning("A"));
        router.write_message(&warning("B"));
        assert_eq!(sink.entries().len(), 2);
    }

    #[test]
    fn test_stream_destination_writes_lines() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("logs/run.log");
        let router = LogRouter::new();
        router.add_target(
            Some(Arc::new(StreamDestination::append_to(&path).unwrap())),
            LogLevel::Information,
            None,
        );
        router.write_message(&warning("Disk"));
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("[Warning-Backup-Disk]: something about x"));
    }
}
