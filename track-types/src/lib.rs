//! Types shared between the leak tracker and its hosts

#![forbid(missing_docs)]

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Environment symbol enabling duplicate leak aggregation.
pub static ENV_AGGREGATE_DUPLICATES: &str = "HEAP_LEAK_AGGREGATE_DUPLICATES";
/// Environment symbol selecting the safe (unwinder based) stack walk.
pub static ENV_SAFE_STACK_WALK: &str = "HEAP_LEAK_SAFE_STACK_WALK";
/// Environment symbol enabling reports to the debugger channel (stderr).
pub static ENV_REPORT_DEBUGGER: &str = "HEAP_LEAK_REPORT_DEBUGGER";
/// Environment symbol enabling reports to stdout.
pub static ENV_REPORT_STDOUT: &str = "HEAP_LEAK_REPORT_STDOUT";
/// Environment symbol naming a report file.
pub static ENV_REPORT_FILE: &str = "HEAP_LEAK_REPORT_FILE";
/// Environment symbol selecting the report file encoding, `utf8` or `utf16le`.
pub static ENV_REPORT_ENCODING: &str = "HEAP_LEAK_REPORT_ENCODING";
/// Environment symbol controlling startup noise filtering.
pub static ENV_SKIP_STARTUP_LEAKS: &str = "HEAP_LEAK_SKIP_STARTUP_LEAKS";
/// Environment symbol enabling heap/free pairing validation.
pub static ENV_VALIDATE_HEAPS: &str = "HEAP_LEAK_VALIDATE_HEAPS";
/// Environment symbol starting the tracker disabled.
pub static ENV_START_DISABLED: &str = "HEAP_LEAK_START_DISABLED";
/// Environment symbol showing frames internal to the tracker and allocator.
pub static ENV_SHOW_INTERNAL_FRAMES: &str = "HEAP_LEAK_SHOW_INTERNAL_FRAMES";
/// Environment symbol bounding the number of frames printed per leak.
pub static ENV_MAX_RESOLVED_FRAMES: &str = "HEAP_LEAK_MAX_RESOLVED_FRAMES";
/// Environment symbol bounding the number of user data bytes dumped per leak.
pub static ENV_MAX_DATA_DUMP: &str = "HEAP_LEAK_MAX_DATA_DUMP";
/// Environment symbol bounding the captured stack depth.
pub static ENV_MAX_STACK_DEPTH: &str = "HEAP_LEAK_MAX_STACK_DEPTH";
/// Environment symbol with a comma separated list of modules to track exclusively.
pub static ENV_INCLUDE_MODULES: &str = "HEAP_LEAK_INCLUDE_MODULES";
/// Environment symbol with a comma separated list of modules never to track.
pub static ENV_EXCLUDE_MODULES: &str = "HEAP_LEAK_EXCLUDE_MODULES";

/// Encoding of report files.
#[derive(Debug, Default, Copy, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ReportEncoding {
    /// Plain UTF-8.
    #[default]
    Utf8,
    /// UTF-16 little endian, prefixed with a byte order mark.
    Utf16Le,
}

/// Name based allow or deny list of modules.
///
/// An entry matches a module if the module's file name starts with the entry, so `libfoo.so`
/// matches `libfoo.so.1`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub enum ModuleList {
    /// Track every module except the listed ones.
    Exclude(Vec<String>),
    /// Track only the listed modules.
    Include(Vec<String>),
}

impl Default for ModuleList {
    fn default() -> Self {
        ModuleList::Exclude(Vec::new())
    }
}

impl ModuleList {
    /// Determine whether a module with the given file name may be tracked.
    pub fn allows(&self, name: &str) -> bool {
        match self {
            ModuleList::Exclude(names) => !names.iter().any(|entry| name.starts_with(entry)),
            ModuleList::Include(names) => names.iter().any(|entry| name.starts_with(entry)),
        }
    }
}

/// Tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Report leaks with identical call stacks once, with a count.
    pub aggregate_duplicates: bool,
    /// Walk stacks frame by frame through the unwinder instead of the bulk backtrace.
    pub safe_stack_walk: bool,
    /// Write reports to the debugger channel, which is stderr on Linux.
    pub report_to_debugger: bool,
    /// Write reports to stdout.
    pub report_to_stdout: bool,
    /// Write reports to this file.
    pub report_file: Option<PathBuf>,
    /// Encoding of the report file.
    pub encoding: ReportEncoding,
    /// Omit leaks whose stack shows runtime static initialization.
    pub skip_startup_leaks: bool,
    /// Abort when a block is freed through a heap that does not own it.
    pub validate_heaps: bool,
    /// Start with tracking disabled process-wide.
    pub start_disabled: bool,
    /// Print frames internal to the tracker and the allocator.
    pub show_internal_frames: bool,
    /// Maximum number of frames printed per leak.
    pub max_resolved_frames: usize,
    /// Maximum number of user data bytes dumped per leak.
    pub max_data_dump: usize,
    /// Maximum number of frames captured per allocation.
    pub max_stack_depth: usize,
    /// Modules to track.
    pub modules: ModuleList,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            aggregate_duplicates: true,
            safe_stack_walk: false,
            report_to_debugger: true,
            report_to_stdout: false,
            report_file: None,
            encoding: ReportEncoding::Utf8,
            skip_startup_leaks: true,
            validate_heaps: false,
            start_disabled: false,
            show_internal_frames: false,
            max_resolved_frames: 64,
            max_data_dump: 0,
            max_stack_depth: 64,
            modules: ModuleList::default(),
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect()
}

impl Config {
    /// Overlay the process environment on the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Overlay values obtained from `lookup` on the defaults.
    ///
    /// Unparseable values leave the default in place.
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let mut config = Self::default();
        let flag = |key: &str, target: &mut bool| {
            if let Some(value) = lookup(key).as_deref().and_then(parse_flag) {
                *target = value;
            }
        };
        flag(ENV_AGGREGATE_DUPLICATES, &mut config.aggregate_duplicates);
        flag(ENV_SAFE_STACK_WALK, &mut config.safe_stack_walk);
        flag(ENV_REPORT_DEBUGGER, &mut config.report_to_debugger);
        flag(ENV_REPORT_STDOUT, &mut config.report_to_stdout);
        flag(ENV_SKIP_STARTUP_LEAKS, &mut config.skip_startup_leaks);
        flag(ENV_VALIDATE_HEAPS, &mut config.validate_heaps);
        flag(ENV_START_DISABLED, &mut config.start_disabled);
        flag(ENV_SHOW_INTERNAL_FRAMES, &mut config.show_internal_frames);

        let number = |key: &str, target: &mut usize| {
            if let Some(value) = lookup(key).and_then(|value| value.trim().parse().ok()) {
                *target = value;
            }
        };
        number(ENV_MAX_RESOLVED_FRAMES, &mut config.max_resolved_frames);
        number(ENV_MAX_DATA_DUMP, &mut config.max_data_dump);
        number(ENV_MAX_STACK_DEPTH, &mut config.max_stack_depth);

        if let Some(path) = lookup(ENV_REPORT_FILE).filter(|path| !path.is_empty()) {
            config.report_file = Some(PathBuf::from(path));
        }
        match lookup(ENV_REPORT_ENCODING).as_deref().map(str::trim) {
            Some("utf16le") | Some("utf-16le") | Some("unicode") => {
                config.encoding = ReportEncoding::Utf16Le
            }
            Some("utf8") | Some("utf-8") => config.encoding = ReportEncoding::Utf8,
            _ => {}
        }
        if let Some(names) = lookup(ENV_INCLUDE_MODULES) {
            config.modules = ModuleList::Include(parse_list(&names));
        } else if let Some(names) = lookup(ENV_EXCLUDE_MODULES) {
            config.modules = ModuleList::Exclude(parse_list(&names));
        }
        config
    }
}

/// One resolved stack frame of a leak report.
///
/// The availability of some data depends on debug information, especially file and line.
#[derive(Debug, Default, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FrameLine {
    /// Instruction pointer.
    pub address: u64,
    /// Source file.
    pub file: Option<PathBuf>,
    /// Source line.
    pub line: Option<u32>,
    /// File name of the module containing `address`.
    pub module: Option<String>,
    /// Name of the function containing `address`.
    pub function: Option<String>,
    /// Distance of `address` from the start of its line or function.
    pub displacement: Option<u64>,
}

impl fmt::Display for FrameLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let module = self.module.as_deref().unwrap_or("<unknown module>");
        let function = self.function.as_deref().unwrap_or("<unknown function>");
        match (&self.file, self.line) {
            (Some(file), Some(line)) => {
                write!(f, "  {} ({}): {}!{}()", file.display(), line, module, function)?;
                if let Some(displacement) = self.displacement.filter(|d| *d != 0) {
                    write!(f, " + 0x{:X} bytes", displacement)?;
                }
                Ok(())
            }
            _ => write!(
                f,
                "  0x{:016X} (unavailable): {}!{}()",
                self.address, module, function
            ),
        }
    }
}

/// A group of leaked blocks sharing one call stack.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LeakGroup {
    /// Serial number of the first block in the group.
    pub serial: u64,
    /// Address of the first block in the group.
    pub address: u64,
    /// Size of the first block in the group.
    pub size: usize,
    /// Thread that allocated the first block.
    pub thread_id: usize,
    /// Number of blocks in the group.
    pub count: usize,
    /// Sum of the sizes of all blocks in the group.
    pub total_bytes: usize,
    /// Hash of the shared call stack.
    pub hash: u64,
    /// Frames retained for output, innermost first.
    pub frames: Vec<FrameLine>,
    /// Leading bytes of the first block.
    pub data: Vec<u8>,
}

/// Allocation statistics over the tracker's lifetime.
#[derive(Debug, Default, Copy, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Statistics {
    /// Number of allocations observed.
    pub total_allocations: u64,
    /// Sum of all bytes allocated.
    pub total_bytes: u64,
    /// Bytes currently outstanding.
    pub current_bytes: u64,
    /// Largest number of bytes outstanding at any time.
    pub peak_bytes: u64,
}

/// The result of one leak check.
#[derive(Debug, Default, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LeakReport {
    /// Leak groups, ordered by the serial number of their first block.
    pub groups: Vec<LeakGroup>,
    /// Number of leaked blocks, summed over the groups.
    pub leak_count: usize,
    /// Number of leaked bytes, summed over the groups.
    pub leaked_bytes: usize,
    /// Allocation statistics at the time of the report.
    pub statistics: Statistics,
}

impl LeakReport {
    /// `true` if no leaks were found.
    pub fn is_empty(&self) -> bool {
        self.leak_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn module_list_matches_prefixes() {
        let exclude = ModuleList::Exclude(vec!["libc.so".into()]);
        assert!(!exclude.allows("libc.so.6"));
        assert!(exclude.allows("libfoo.so"));

        let include = ModuleList::Include(vec!["libfoo".into()]);
        assert!(include.allows("libfoo.so.2"));
        assert!(!include.allows("libbar.so"));
    }

    #[test]
    fn config_overlays_lookup() {
        let env: HashMap<&str, &str> = [
            (ENV_SAFE_STACK_WALK, "yes"),
            (ENV_AGGREGATE_DUPLICATES, "0"),
            (ENV_MAX_DATA_DUMP, "32"),
            (ENV_MAX_STACK_DEPTH, "not a number"),
            (ENV_REPORT_FILE, "/tmp/leaks.txt"),
            (ENV_REPORT_ENCODING, "utf16le"),
            (ENV_EXCLUDE_MODULES, "libc.so, ld-linux ,"),
        ]
        .into_iter()
        .collect();
        let config = Config::from_lookup(|key| env.get(key).map(|value| value.to_string()));
        assert!(config.safe_stack_walk);
        assert!(!config.aggregate_duplicates);
        assert_eq!(config.max_data_dump, 32);
        assert_eq!(config.max_stack_depth, Config::default().max_stack_depth);
        assert_eq!(config.report_file, Some(PathBuf::from("/tmp/leaks.txt")));
        assert_eq!(config.encoding, ReportEncoding::Utf16Le);
        assert_eq!(
            config.modules,
            ModuleList::Exclude(vec!["libc.so".into(), "ld-linux".into()])
        );
    }

    #[test]
    fn config_deserializes_partially() {
        let config: Config = serde_json::from_str(r#"{"validate_heaps": true}"#).unwrap();
        assert!(config.validate_heaps);
        assert!(config.aggregate_duplicates);
    }

    #[test]
    fn frame_line_formats() {
        let resolved = FrameLine {
            address: 0x1234,
            file: Some("src/main.rs".into()),
            line: Some(42),
            module: Some("demo".into()),
            function: Some("demo::leak".into()),
            displacement: Some(0x1a),
        };
        assert_eq!(
            resolved.to_string(),
            "  src/main.rs (42): demo!demo::leak() + 0x1A bytes"
        );

        let unresolved = FrameLine {
            address: 0x1234,
            module: Some("libfoo.so".into()),
            function: Some("foo".into()),
            ..Default::default()
        };
        assert_eq!(
            unresolved.to_string(),
            "  0x0000000000001234 (unavailable): libfoo.so!foo()"
        );
    }
}
