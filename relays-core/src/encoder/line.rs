//! InfluxDB 1.x line protocol.
//!
//! <https://docs.influxdata.com/influxdb/v1.7/write_protocols/line_protocol_reference/>
//!
//! ```text
//! <measurement>[,<tag_key>=<tag_value>...] <field_key>=<field_value>[,<field_key>=<field_value>...] <timestamp>
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};

use crate::event::Event;

pub const MEASUREMENT: &str = "nais.deployment";

/// Indexed by InfluxDB.
const TAG_KEYS: [&str; 7] = [
    "application",
    "cluster",
    "environment",
    "namespace",
    "platform_type",
    "rollout_status",
    "team",
];

/// Stored but not indexed, queries on these do a table scan.
const FIELD_KEYS: [&str; 10] = [
    "correlation_id",
    "deployer_email",
    "deployer_ident",
    "deployer_name",
    "image_hash",
    "image_name",
    "image_tag",
    "skya_environment",
    "source",
    "version",
];

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Tag or field set. Iteration order is the serialization order.
pub type TagField = BTreeMap<String, String>;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum LineError {
    #[error("InfluxDB line format requires a measurement name")]
    EmptyMeasurement,

    #[error("InfluxDB line format requires at least one field in a measurement")]
    NoFields,

    #[error("writing InfluxDB line: {0}")]
    Write(#[from] fmt::Error),

    #[error("timestamp {0}s does not fit in Unix nanoseconds")]
    Timestamp(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub measurement: String,
    pub tags: TagField,
    pub fields: TagField,
    pub timestamp: DateTime<Utc>,
}

impl From<&Event> for Line {
    fn from(event: &Event) -> Self {
        let flat = event.flatten();
        let select = |keys: &[&str]| -> TagField {
            keys.iter()
                .filter_map(|key| flat.get(*key).map(|value| (key.to_string(), value.clone())))
                .collect()
        };

        Line {
            measurement: MEASUREMENT.to_string(),
            tags: select(&TAG_KEYS),
            fields: select(&FIELD_KEYS),
            timestamp: event.timestamp_as_time(),
        }
    }
}

impl Line {
    /// Encodes the line, terminated by a newline.
    pub fn marshal(&self) -> Result<Vec<u8>, LineError> {
        let mut buf = String::with_capacity(256);
        self.write_to(&mut buf)?;
        Ok(buf.into_bytes())
    }

    /// Writes the encoded line into `w`. Nothing is written when the line is invalid.
    pub fn write_to<W: fmt::Write>(&self, w: W) -> Result<(), LineError> {
        if self.measurement.is_empty() {
            return Err(LineError::EmptyMeasurement);
        }
        if self.fields.is_empty() {
            return Err(LineError::NoFields);
        }

        let seconds = self.timestamp.timestamp();
        let nanos = seconds
            .checked_mul(NANOS_PER_SECOND)
            .ok_or(LineError::Timestamp(seconds))?;

        let mut writer = ErrorWriter::new(w);

        writer.write_str(&self.measurement);
        for (key, value) in &self.tags {
            writer.write_fmt(format_args!(",{key}={value}"));
        }

        writer.write_str(" ");
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                writer.write_str(",");
            }
            writer.write_fmt(format_args!("{key}={}", quote(value)));
        }

        writer.write_str(" ");
        writer.write_fmt(format_args!("{nanos}\n"));

        writer.finish().map(|_| ())
    }
}

/// Forwards writes until the first failure. Later writes are dropped and the first
/// error is the result of the whole sequence.
struct ErrorWriter<W> {
    inner: W,
    error: Option<fmt::Error>,
}

impl<W: fmt::Write> ErrorWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, error: None }
    }

    fn write_str(&mut self, s: &str) {
        if self.error.is_none() {
            self.error = self.inner.write_str(s).err();
        }
    }

    fn write_fmt(&mut self, args: fmt::Arguments<'_>) {
        if self.error.is_none() {
            self.error = self.inner.write_fmt(args).err();
        }
    }

    fn finish(self) -> Result<W, LineError> {
        match self.error {
            Some(e) => Err(LineError::Write(e)),
            None => Ok(self.inner),
        }
    }
}

/// Double-quotes `value` using the escapes of Go's `strconv.Quote`.
fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\u{07}' => quoted.push_str("\\a"),
            '\u{08}' => quoted.push_str("\\b"),
            '\u{0c}' => quoted.push_str("\\f"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            '\u{0b}' => quoted.push_str("\\v"),
            c if c.is_control() && (c as u32) < 0x80 => {
                let _ = write!(quoted, "\\x{:02x}", c as u32);
            }
            c if c.is_control() => {
                let _ = write!(quoted, "\\u{:04x}", c as u32);
            }
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}
