#![allow(clippy::too_many_arguments)]
use std::fmt::{Display, Write};

use indexmap::IndexMap;

use crate::common::LineEnding;

// <METRIC_NAME>:<VALUE>|<TYPE>
// <METRIC_NAME>:<VALUE>|<TYPE>|@<SAMPLE_RATE>
// <METRIC_NAME>:<VALUE>|<TYPE>|@<SAMPLE_RATE>|#<TAG_KEY_1>:<TAG_VALUE_1>,<TAG_2>

/// The kind of stat carried by a line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricKind {
    /// Durations, always sent as whole milliseconds.
    Timer,
    Gauge,
    Counter,
}

impl MetricKind {
    pub fn as_type_str(&self) -> &'static str {
        match self {
            Self::Timer => "ms",
            Self::Gauge => "g",
            Self::Counter => "c",
        }
    }
}

/// Renders global tags into `key:value` pairs, sanitizing both sides.
pub fn render_tags(tags: &IndexMap<String, String>) -> Vec<String> {
    tags.iter()
        .map(|(k, v)| format!("{}:{}", sanitize_label(k), sanitize_label_value(v)))
        .collect()
}

/// Renders a sample rate with a fixed number of decimals, e.g. `0.999000`.
pub fn format_sample_rate(rate: f32, precision: usize) -> String {
    format!("{:.*}", precision, rate)
}

/// Sanitizes a tag key: it must start with a letter and may contain alphanumerics and
/// `_ . : / -`, but must not end with a colon.
pub fn sanitize_label(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut is_invalid: fn(char) -> bool = invalid_label_start_character;
    let mut key_chars = key.chars().peekable();
    let mut first = true;
    while let Some(c) = key_chars.next() {
        if !first && key_chars.peek().is_none() {
            is_invalid = invalid_label_last_character;
        }
        if is_invalid(c) {
            out.push('_');
        } else {
            out.push(c);
        }
        is_invalid = invalid_label_character;
        first = false;
    }
    out
}

pub fn sanitize_label_value(value: &str) -> String {
    value
        .chars()
        .map(|c| if invalid_label_character(c) { '_' } else { c })
        .collect()
}

/// Stat names go on the wire as given, except for the characters that delimit a line (`:`, `|`,
/// `@`, `\r` and `\n`), which are replaced with an underscore.
pub fn sanitize_metric_name(name: &str) -> String {
    name.chars()
        .map(|c| if breaks_line_framing(c) { '_' } else { c })
        .collect()
}

pub fn write_metric_line<T>(
    buffer: &mut String,
    prefix: Option<&str>,
    name: &str,
    value: T,
    kind: MetricKind,
    sample_rate: Option<&str>,
    labels: &[String],
    line_ending: LineEnding,
) where
    T: Display,
{
    if let Some(pref) = prefix {
        buffer.push_str(sanitize_metric_name(pref).as_str());
        buffer.push('.');
    }
    buffer.push_str(sanitize_metric_name(name).as_str());

    buffer.push(':');
    // writing into a String never fails
    let _ = write!(buffer, "{}", value);
    buffer.push('|');
    buffer.push_str(kind.as_type_str());

    if let Some(rate) = sample_rate {
        buffer.push_str("|@");
        buffer.push_str(rate);
    }

    if !labels.is_empty() {
        buffer.push_str("|#");

        let mut first = true;
        for label in labels {
            if first {
                first = false;
            } else {
                buffer.push(',');
            }
            buffer.push_str(label);
        }
    }

    buffer.push_str(line_ending.as_str());
}

#[inline]
fn breaks_line_framing(c: char) -> bool {
    matches!(c, ':' | '|' | '@' | '\r' | '\n')
}

#[inline]
fn invalid_label_start_character(c: char) -> bool {
    !c.is_alphabetic()
}

#[inline]
fn invalid_label_character(c: char) -> bool {
    !(c.is_alphanumeric() || c == '_' || c == '.' || c == ':' || c == '/' || c == '-')
}

#[inline]
fn invalid_label_last_character(c: char) -> bool {
    !(c.is_alphanumeric() || c == '_' || c == '.' || c == '/' || c == '-')
}
