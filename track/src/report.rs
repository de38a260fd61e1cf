//! Leak reports: grouping, formatting and delivery.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Mutex, RwLock};

use fnv::FnvHashMap;
use heap_leak_types::{Config, LeakGroup, LeakReport, ReportEncoding, Statistics};

use crate::callstack::StackFilter;
use crate::error::Error;
use crate::registry::LeakCandidate;
use crate::symbols::SymbolGateway;
use crate::Result;

/// Destination of report text.
pub trait ReportSink: Send + Sync {
    fn write(&self, text: &str) -> Result<()>;
}

/// Writes to stderr, where a debugger attached to the process sees it.
#[derive(Debug, Default)]
pub struct StderrSink;

impl ReportSink for StderrSink {
    fn write(&self, text: &str) -> Result<()> {
        let mut stderr = io::stderr().lock();
        stderr.write_all(text.as_bytes())?;
        stderr.flush()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct StdoutSink;

impl ReportSink for StdoutSink {
    fn write(&self, text: &str) -> Result<()> {
        let mut stdout = io::stdout().lock();
        stdout.write_all(text.as_bytes())?;
        stdout.flush()?;
        Ok(())
    }
}

/// Appends to a file created when the sink is opened.
#[derive(Debug)]
pub struct FileSink {
    file: Mutex<File>,
    encoding: ReportEncoding,
}

impl FileSink {
    /// Create or truncate `path`. UTF-16 files start with a byte order mark.
    pub fn create(path: &Path, encoding: ReportEncoding) -> Result<Self> {
        let open = || -> io::Result<File> {
            let mut file = File::create(path)?;
            if encoding == ReportEncoding::Utf16Le {
                file.write_all(&[0xFF, 0xFE])?;
            }
            Ok(file)
        };
        let file = open().map_err(|source| Error::ReportFile {
            path: path.to_owned(),
            source,
        })?;
        Ok(Self {
            file: Mutex::new(file),
            encoding,
        })
    }
}

impl ReportSink for FileSink {
    fn write(&self, text: &str) -> Result<()> {
        let mut file = self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match self.encoding {
            ReportEncoding::Utf8 => file.write_all(text.as_bytes())?,
            ReportEncoding::Utf16Le => {
                let bytes: Vec<u8> = text.encode_utf16().flat_map(u16::to_le_bytes).collect();
                file.write_all(&bytes)?
            }
        }
        file.flush()?;
        Ok(())
    }
}

/// Hands report text to a closure.
pub struct CallbackSink<F>(pub F);

impl<F: Fn(&str) + Send + Sync> ReportSink for CallbackSink<F> {
    fn write(&self, text: &str) -> Result<()> {
        (self.0)(text);
        Ok(())
    }
}

/// Sends report text to another thread.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: crossbeam_channel::Sender<String>,
}

impl ChannelSink {
    pub fn new() -> (Self, crossbeam_channel::Receiver<String>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (Self { sender }, receiver)
    }
}

impl ReportSink for ChannelSink {
    fn write(&self, text: &str) -> Result<()> {
        // A dropped receiver means nobody is listening any more.
        let _ = self.sender.send(text.to_owned());
        Ok(())
    }
}

/// The configured sinks plus an optional host hook.
#[derive(Default)]
pub struct SinkSet {
    sinks: Vec<Box<dyn ReportSink>>,
    hook: RwLock<Option<Box<dyn ReportSink>>>,
}

impl SinkSet {
    /// Open the sinks `config` selects.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut sinks: Vec<Box<dyn ReportSink>> = Vec::new();
        if config.report_to_debugger {
            sinks.push(Box::new(StderrSink));
        }
        if config.report_to_stdout {
            sinks.push(Box::new(StdoutSink));
        }
        if let Some(path) = &config.report_file {
            sinks.push(Box::new(FileSink::create(path, config.encoding)?));
        }
        Ok(Self {
            sinks,
            hook: RwLock::new(None),
        })
    }

    pub fn push(&mut self, sink: Box<dyn ReportSink>) {
        self.sinks.push(sink);
    }

    /// Install a hook receiving every report, replacing the previous one.
    pub fn set_hook(&self, hook: Option<Box<dyn ReportSink>>) {
        *self.hook.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = hook;
    }

    /// Deliver `text` everywhere. Failing sinks are logged and skipped.
    pub fn emit(&self, text: &str) {
        for sink in &self.sinks {
            if let Err(err) = sink.write(text) {
                log::warn!("report sink failed: {}", err);
            }
        }
        let hook = self.hook.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(hook) = hook.as_ref() {
            if let Err(err) = hook.write(text) {
                log::warn!("report hook failed: {}", err);
            }
        }
    }
}

/// Turns leak candidates into a [`LeakReport`].
pub struct LeakReporter<'a> {
    pub gateway: &'a SymbolGateway,
    pub filter: &'a StackFilter,
    pub config: &'a Config,
}

impl LeakReporter<'_> {
    /// Resolve, filter and group `candidates`, which must be ordered by serial number.
    ///
    /// Stacks are resolved in place, so the caller can write the resolutions back.
    pub fn build(&self, candidates: &mut [LeakCandidate], statistics: Statistics) -> LeakReport {
        self.resolve(candidates);

        let mut retained = Vec::with_capacity(candidates.len());
        for (index, candidate) in candidates.iter_mut().enumerate() {
            if self.config.skip_startup_leaks
                && candidate.stack.is_startup_noise(self.gateway, self.filter)
            {
                continue;
            }
            retained.push(index);
        }

        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut buckets: FnvHashMap<u64, Vec<usize>> = FnvHashMap::default();
        for index in retained {
            if self.config.aggregate_duplicates {
                let stack = &candidates[index].stack;
                let bucket = buckets.entry(stack.hash_value()).or_default();
                let existing = bucket
                    .iter()
                    .copied()
                    .find(|group| candidates[groups[*group][0]].stack == *stack);
                if let Some(group) = existing {
                    groups[group].push(index);
                    continue;
                }
                bucket.push(groups.len());
            }
            groups.push(vec![index]);
        }

        let mut report = LeakReport {
            statistics,
            ..Default::default()
        };
        for members in groups {
            let first = &candidates[members[0]];
            let total_bytes = members.iter().map(|index| candidates[*index].size).sum();
            let frames = first
                .stack
                .retained_frames(self.config.show_internal_frames, self.config.max_resolved_frames)
                .into_iter()
                .map(|frame| frame.to_frame_line())
                .collect();
            report.leak_count += members.len();
            report.leaked_bytes += total_bytes;
            report.groups.push(LeakGroup {
                serial: first.serial,
                address: first.address as u64,
                size: first.size,
                thread_id: first.thread_id,
                count: members.len(),
                total_bytes,
                hash: first.stack.hash_value(),
                frames,
                data: first.data.clone(),
            });
        }
        report
    }

    /// Number of candidates a report would list.
    pub fn count(&self, candidates: &mut [LeakCandidate]) -> usize {
        if !self.config.skip_startup_leaks {
            return candidates.len();
        }
        self.resolve(candidates);
        candidates
            .iter_mut()
            .map(|candidate| !candidate.stack.is_startup_noise(self.gateway, self.filter))
            .filter(|kept| *kept)
            .count()
    }

    /// Resolve each distinct stack once; equal stacks adopt the first resolution.
    pub fn resolve(&self, candidates: &mut [LeakCandidate]) {
        let mut resolved: FnvHashMap<u64, Vec<usize>> = FnvHashMap::default();
        for index in 0..candidates.len() {
            let (done, rest) = candidates.split_at_mut(index);
            let candidate = &mut rest[0];
            if candidate.stack.is_resolved() {
                continue;
            }
            let hash = candidate.stack.hash_value();
            let equal = resolved.get(&hash).and_then(|indices| {
                indices
                    .iter()
                    .find(|other| done[**other].stack == candidate.stack)
                    .copied()
            });
            match equal {
                Some(other) => candidate.stack.adopt_resolution(&done[other].stack),
                None => {
                    candidate.stack.resolve_frames(self.gateway, self.filter);
                    resolved.entry(hash).or_default().push(index);
                }
            }
        }
    }
}

/// Hex and ASCII rendering of leaked bytes, 16 per line.
pub fn hex_dump(data: &[u8]) -> String {
    let mut text = String::new();
    for row in data.chunks(16) {
        text.push_str("    ");
        for column in 0..16 {
            match row.get(column) {
                Some(byte) => {
                    let _ = write!(text, "{:02X} ", byte);
                }
                None => text.push_str("   "),
            }
        }
        text.push_str("   ");
        text.extend(row.iter().map(|byte| {
            if byte.is_ascii_graphic() || *byte == b' ' {
                *byte as char
            } else {
                '.'
            }
        }));
        text.push('\n');
    }
    text
}

/// Render one leak group.
pub fn format_group(group: &LeakGroup) -> String {
    let mut text = String::new();
    let _ = writeln!(
        text,
        "---------- Block {} at 0x{:016X}: {} bytes ----------",
        group.serial, group.address, group.size
    );
    if group.count > 1 {
        let _ = writeln!(
            text,
            "  Leak Hash: 0x{:016X}, Count: {}, Total {} bytes",
            group.hash, group.count, group.total_bytes
        );
    }
    let _ = writeln!(text, "  Call Stack (TID {}):", group.thread_id);
    for frame in &group.frames {
        let _ = writeln!(text, "{}", frame);
    }
    if !group.data.is_empty() {
        text.push_str("  Data:\n");
        text.push_str(&hex_dump(&group.data));
    }
    text.push('\n');
    text
}

/// Render a whole report. `title` replaces the default heading.
pub fn format_report(report: &LeakReport, title: Option<&str>) -> String {
    let mut text = String::new();
    if !report.is_empty() {
        text.push_str(title.unwrap_or("WARNING: memory leaks detected!"));
        text.push('\n');
        for group in &report.groups {
            text.push_str(&format_group(group));
        }
    }
    text.push_str(&format_summary(report));
    text
}

/// The report as pretty-printed JSON.
pub fn to_json(report: &LeakReport) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

pub fn format_summary(report: &LeakReport) -> String {
    let mut text = if report.is_empty() {
        "No memory leaks detected.\n".to_owned()
    } else {
        format!(
            "Detected {} memory leaks ({} bytes).\n",
            report.leak_count, report.leaked_bytes
        )
    };
    let _ = writeln!(
        text,
        "Largest number used: {} bytes.",
        report.statistics.peak_bytes
    );
    let _ = writeln!(
        text,
        "Total allocations: {} bytes.",
        report.statistics.total_bytes
    );
    text
}
