//! Parsing for `perf stat -I` interval output.
//!
//! Each non-comment line carries one counter reading:
//! timestamp, value, an optional unit column, the event name, and
//! possibly trailing columns (derived metrics, cgroup name) we ignore.
//! Uncounted events are reported with a `<not counted>` sentinel in
//! place of the value.

use std::collections::BTreeMap;

use thiserror::Error;

/// Sentinel perf prints when a counter could not be scheduled.
const NOT_COUNTED: &str = "<not counted>";

/// Unit column printed for RAPL energy events.
const ENERGY_UNIT: &str = "Joules";

/// Errors that can occur while parsing a single counter line.
///
/// Parse errors are per-line and never fatal: the session logs them
/// and keeps the rest of the interval's readings.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("unrecognized counter line: {line:?}")]
    UnrecognizedShape { line: String },

    #[error("bad numeric field {field:?} in line: {line:?}")]
    BadNumber { field: String, line: String },
}

/// One successfully parsed counter line.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    /// Interval timestamp in seconds, from the first column.
    pub timestamp: f64,
    /// Event name the reading belongs to.
    pub event: String,
    /// Counter value; 0.0 for uncounted events.
    pub value: f64,
}

/// One interval's readings for a single scope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedChunk {
    /// Timestamp of the first parsed line, if any line parsed.
    pub timestamp: Option<f64>,
    /// Counter values keyed by event name.
    pub counters: BTreeMap<String, f64>,
}

/// Parse one counter line into `(timestamp, event, value)`.
///
/// Shapes are tried in priority order: the `<not counted>` sentinel
/// (with or without a unit column), an energy reading with a `Joules`
/// unit column, then the plain `timestamp value event` layout.
pub fn parse_line(line: &str) -> Result<ParsedLine, ParseError> {
    // Trailing derived-metric annotations start with '#'.
    let body = line.split('#').next().unwrap_or("").trim();

    let fields: Vec<&str> = body.split_whitespace().collect();
    if fields.len() < 3 {
        return Err(ParseError::UnrecognizedShape {
            line: line.to_string(),
        });
    }

    let timestamp = parse_number(fields[0], line)?;

    if body.contains(NOT_COUNTED) {
        // "<ts> <not counted> [Joules] <event>": the event name sits
        // after the sentinel, shifted one column when a unit is present.
        let after = fields
            .iter()
            .position(|f| *f == "counted>")
            .map(|i| &fields[i + 1..])
            .unwrap_or(&[]);

        let event = match after {
            [unit, event, ..] if *unit == ENERGY_UNIT => event,
            [event, ..] => event,
            [] => {
                return Err(ParseError::UnrecognizedShape {
                    line: line.to_string(),
                })
            }
        };

        return Ok(ParsedLine {
            timestamp,
            event: (*event).to_string(),
            value: 0.0,
        });
    }

    if let Some(unit_pos) = fields.iter().position(|f| *f == ENERGY_UNIT) {
        // "<ts> <value> Joules <event>"
        let event = fields.get(unit_pos + 1).ok_or(ParseError::UnrecognizedShape {
            line: line.to_string(),
        })?;

        return Ok(ParsedLine {
            timestamp,
            event: (*event).to_string(),
            value: parse_number(fields[1], line)?,
        });
    }

    // "<ts> <value> <event>"
    Ok(ParsedLine {
        timestamp,
        event: fields[2].to_string(),
        value: parse_number(fields[1], line)?,
    })
}

/// Parse one chunk of raw lines into per-event counter values.
///
/// Malformed lines are collected as errors and skipped; one bad line
/// must not lose the rest of the interval.
pub fn parse_chunk(lines: &[String]) -> (ParsedChunk, Vec<ParseError>) {
    let mut chunk = ParsedChunk::default();
    let mut errors = Vec::new();

    for line in lines {
        match parse_line(line) {
            Ok(parsed) => {
                chunk.timestamp.get_or_insert(parsed.timestamp);
                chunk.counters.insert(parsed.event, parsed.value);
            }
            Err(e) => errors.push(e),
        }
    }

    (chunk, errors)
}

/// Parse a numeric field, stripping thousands separators.
fn parse_number(field: &str, line: &str) -> Result<f64, ParseError> {
    field
        .replace(',', "")
        .parse::<f64>()
        .map_err(|_| ParseError::BadNumber {
            field: field.to_string(),
            line: line.to_string(),
        })
}
