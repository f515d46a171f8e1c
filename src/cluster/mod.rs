//! Stateful log clustering: raw, multi-format log text in, deduplicated and
//! ranked error clusters out.
//!
//! The parser makes a single forward scan over the lines, carrying one
//! transient block of state. A block opens when an entry-start line signals
//! an error, accumulates continuation lines, and is only reported once a
//! continuation line confirms a stack trace — single-line `ERROR` records
//! with no trace are dropped to keep non-fatal noise out of the results.
//!
//! Two entry formats are recognised:
//! - the legacy pipe-delimited format, marked by a leading `v1|`
//! - a timestamped format starting with `YYYY-MM-DD`, optionally preceded by
//!   a numeric log-multiplexer prefix (`1234-` or `1234:`) which is stripped
//!   before any further matching

use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::LazyLock;

/// A deduplicated group of log occurrences sharing an error message and,
/// when available, their first stack-trace line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorCluster {
    pub message: String,
    pub count: u32,
    pub trace: String,
}

/// Marker token of the legacy pipe-delimited entry format.
const LEGACY_MARKER: &str = "v1|";
/// Minimum field count for a legacy entry to be considered well-formed.
const LEGACY_MIN_FIELDS: usize = 10;
const LEGACY_LEVEL_FIELD: usize = 6;
const LEGACY_MESSAGE_FIELD: usize = 9;

/// Literal separator of the timestamped entry format.
const TIMESTAMPED_ERROR_SEP: &str = " - ERROR - ";

/// Line prefixes that confirm a continuation line is part of a stack trace.
const STACK_INDICATORS: &[&str] = &[
    "at ",
    "Caused by:",
    "... ",
    "File \"",
    "Traceback (",
    "During handling of",
];

/// The first trace line is truncated to this many characters when it is
/// folded into the clustering key.
const KEY_TRACE_LINE_MAX: usize = 100;

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("valid ANSI regex"));
static MUX_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+[-:]").expect("valid prefix regex"));
static DATE_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}").expect("valid date regex"));

/// Transient parser state for the block currently being scanned.
#[derive(Debug, Default)]
struct LogBlock {
    pending_message: Option<String>,
    pending_lines: Vec<String>,
    stack_confirmed: bool,
}

/// Parse `log_text` into clusters, sorted by occurrence count descending.
/// Ties keep the insertion order of their first occurrence.
pub fn cluster(log_text: &str) -> Vec<ErrorCluster> {
    let mut order: Vec<String> = Vec::new();
    let mut clusters: HashMap<String, ErrorCluster> = HashMap::new();
    let mut block = LogBlock::default();

    for raw in log_text.lines() {
        let stripped = ANSI_ESCAPE.replace_all(raw.trim_end_matches('\r'), "");
        let (is_entry_start, line) = classify(stripped.as_ref());

        if is_entry_start {
            finalize_block(&mut block, &mut clusters, &mut order);
            if let Some(message) = extract_error_message(line) {
                block.pending_message = Some(message);
                block.pending_lines.push(line.to_string());
            }
        } else if block.pending_message.is_some() {
            block.pending_lines.push(line.to_string());
            let trimmed = line.trim();
            if STACK_INDICATORS.iter().any(|p| trimmed.starts_with(p)) {
                block.stack_confirmed = true;
            }
        }
    }
    finalize_block(&mut block, &mut clusters, &mut order);

    let mut out: Vec<ErrorCluster> = order
        .into_iter()
        .filter_map(|key| clusters.remove(&key))
        .collect();
    // stable: equal counts keep first-seen order
    out.sort_by(|a, b| b.count.cmp(&a.count));
    out
}

/// Decide whether `line` opens a new log entry, and strip any multiplexer
/// decoration from it either way.
fn classify(line: &str) -> (bool, &str) {
    if line.starts_with(LEGACY_MARKER) {
        return (true, line);
    }
    if DATE_START.is_match(line) {
        return (true, line);
    }
    if let Some(m) = MUX_PREFIX.find(line) {
        let rest = &line[m.end()..];
        return (DATE_START.is_match(rest), rest);
    }
    (false, line)
}

/// Extract the error message from an entry-start line, if the line signals
/// an error at all.
fn extract_error_message(line: &str) -> Option<String> {
    if line.starts_with(LEGACY_MARKER) {
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() >= LEGACY_MIN_FIELDS && parts[LEGACY_LEVEL_FIELD].trim().contains("ERROR") {
            return Some(parts[LEGACY_MESSAGE_FIELD].trim().to_string());
        }
        return None;
    }
    line.find(TIMESTAMPED_ERROR_SEP)
        .map(|idx| line[idx + TIMESTAMPED_ERROR_SEP.len()..].to_string())
}

/// Close the current block: merge it into the cluster map when it carries
/// both an error message and a confirmed stack trace, then reset the state.
fn finalize_block(
    block: &mut LogBlock,
    clusters: &mut HashMap<String, ErrorCluster>,
    order: &mut Vec<String>,
) {
    let message = block.pending_message.take();
    let lines = std::mem::take(&mut block.pending_lines);
    let confirmed = std::mem::replace(&mut block.stack_confirmed, false);

    let Some(message) = message else { return };
    if !confirmed {
        return;
    }

    let key = if lines.len() > 1 {
        let first_trace_line: String = lines[1].trim().chars().take(KEY_TRACE_LINE_MAX).collect();
        format!("{message} \n {first_trace_line}")
    } else {
        message
    };

    match clusters.get_mut(&key) {
        Some(existing) => existing.count += 1,
        None => {
            let mut trace = lines.join("\n");
            trace.push('\n');
            order.push(key.clone());
            clusters.insert(
                key.clone(),
                ErrorCluster {
                    message: key,
                    count: 1,
                    trace,
                },
            );
        }
    }
}
