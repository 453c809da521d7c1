//! Error types for the runtime core.
//!
//! A single hand-rolled `Error` carries everything downstream callers need:
//! a coarse `ErrorKind` for matching, the underlying engine's numeric code
//! and extended code, a severity, a message, and a free-form info map for
//! context (path, sql, tag, source table, ...). See spec §7.

use std::collections::BTreeMap;
use std::fmt;
use std::io;

/// Coarse error classification, mirroring the underlying engine's result
/// codes plus a handful of wrapper-level ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Ok,
    Generic,
    Misuse,
    Busy,
    Locked,
    Corrupt,
    Full,
    IOErr,
    Constraint,
    Interrupt,
    /// Cipher key mismatch or unrecognized file header.
    NotADatabase,
    Warning,
    Notice,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Ok => "ok",
            ErrorKind::Generic => "error",
            ErrorKind::Misuse => "misuse",
            ErrorKind::Busy => "busy",
            ErrorKind::Locked => "locked",
            ErrorKind::Corrupt => "corrupt",
            ErrorKind::Full => "full",
            ErrorKind::IOErr => "io error",
            ErrorKind::Constraint => "constraint",
            ErrorKind::Interrupt => "interrupt",
            ErrorKind::NotADatabase => "not a database",
            ErrorKind::Warning => "warning",
            ErrorKind::Notice => "notice",
        };
        f.write_str(s)
    }
}

/// Severity, ordered low to high. `Severity::Warning` and above are routed
/// to the error tracer (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Ignore,
    Debug,
    Notice,
    Warning,
    Error,
    Fatal,
}

/// Which subsystem tagged this error, for the `ErrorStringKeyType` surfaced
/// to callers per §6.3. `None` for ordinary handle/statement errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Migrate,
    Backup,
    Checkpoint,
    Integrity,
    Assemble,
}

/// A contextual info value attached to an error (path, sql text, row counts, ...).
#[derive(Debug, Clone, PartialEq)]
pub enum InfoValue {
    Text(String),
    Int(i64),
}

impl From<&str> for InfoValue {
    fn from(s: &str) -> Self {
        InfoValue::Text(s.to_string())
    }
}

impl From<String> for InfoValue {
    fn from(s: String) -> Self {
        InfoValue::Text(s)
    }
}

impl From<i64> for InfoValue {
    fn from(v: i64) -> Self {
        InfoValue::Int(v)
    }
}

impl fmt::Display for InfoValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InfoValue::Text(s) => f.write_str(s),
            InfoValue::Int(v) => write!(f, "{v}"),
        }
    }
}

/// Unified error type for the runtime core.
#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    /// Underlying engine result code, 0 if not applicable.
    pub code: i32,
    /// Underlying engine extended result code, 0 if not applicable.
    pub extended_code: i32,
    pub severity: Severity,
    pub message: String,
    pub source: Option<ErrorSource>,
    infos: BTreeMap<&'static str, InfoValue>,
}

impl Error {
    fn new(kind: ErrorKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: 0,
            extended_code: 0,
            severity,
            message: message.into(),
            source: None,
            infos: BTreeMap::new(),
        }
    }

    pub fn misuse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Misuse, Severity::Error, message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy, Severity::Warning, message)
    }

    pub fn locked(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Locked, Severity::Warning, message)
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Corrupt, Severity::Fatal, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IOErr, Severity::Fatal, message)
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Constraint, Severity::Error, message)
    }

    pub fn interrupt(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Interrupt, Severity::Notice, message)
    }

    pub fn not_a_database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotADatabase, Severity::Fatal, message)
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Generic, Severity::Error, message)
    }

    /// Construct from a raw engine result code, classifying the kind from
    /// the low byte per SQLite's primary-code convention.
    pub fn from_engine_code(code: i32, extended_code: i32, message: impl Into<String>) -> Self {
        let primary = code & 0xff;
        let kind = match primary {
            0 | 100 | 101 => ErrorKind::Ok, // SQLITE_OK / DONE / ROW
            5 => ErrorKind::Busy,
            6 => ErrorKind::Locked,
            11 => ErrorKind::Corrupt,
            13 => ErrorKind::Full,
            10 => ErrorKind::IOErr,
            19 => ErrorKind::Constraint,
            9 => ErrorKind::Interrupt,
            21 => ErrorKind::Misuse,
            26 => ErrorKind::NotADatabase,
            _ => ErrorKind::Generic,
        };
        let severity = match kind {
            ErrorKind::Ok => Severity::Ignore,
            ErrorKind::Busy | ErrorKind::Locked | ErrorKind::Interrupt => Severity::Warning,
            ErrorKind::Corrupt | ErrorKind::IOErr | ErrorKind::NotADatabase => Severity::Fatal,
            _ => Severity::Error,
        };
        Self {
            kind,
            code,
            extended_code,
            severity,
            message: message.into(),
            source: None,
            infos: BTreeMap::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.kind, ErrorKind::Ok)
    }

    /// Whether this error should be silently downgraded rather than
    /// propagated (e.g. "table already exists" during assembly, §4.7).
    pub fn is_ignorable_during_assemble(&self) -> bool {
        matches!(self.kind, ErrorKind::Constraint)
            || self.message.contains("already exists")
    }

    pub fn tagged(mut self, source: ErrorSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_info(mut self, key: &'static str, value: impl Into<InfoValue>) -> Self {
        self.infos.insert(key, value.into());
        self
    }

    pub fn info(&self, key: &str) -> Option<&InfoValue> {
        self.infos.get(key)
    }

    pub fn infos(&self) -> &BTreeMap<&'static str, InfoValue> {
        &self.infos
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(source) = self.source {
            write!(f, " ({source:?})")?;
        }
        for (k, v) in &self.infos {
            write!(f, " {k}={v}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::corrupt(format!("material metadata is not valid json: {e}"))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::corrupt(format!("material metadata is not valid bincode: {e}"))
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
