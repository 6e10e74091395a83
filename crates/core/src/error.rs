//! Error taxonomy shared by the compiler and the runtime.
//!
//! Every fallible operation in this workspace returns `Result<T, Error>`.
//! Variants mirror the kinds named in the specification's error-handling
//! section rather than the particular Rust type that produced them, so a
//! host embedding the runtime can match on `kind()` without caring whether
//! the failure came from the parser or a running script.

use std::fmt;

/// Where an error occurred, for host-side reporting.
///
/// `context_name` identifies the call frame (e.g. a function name or
/// `"<global>"`); `line_num` is 0-indexed into that frame's source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub context_name: String,
    pub line_num: usize,
}

impl Location {
    pub fn new(context_name: impl Into<String>, line_num: usize) -> Self {
        Location {
            context_name: context_name.into(),
            line_num,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.context_name, self.line_num + 1)
    }
}

/// The kind of failure, independent of where it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Raised by the parser; always fatal to the current parse.
    Compile,
    /// Name resolution failed after local/outer/global/intrinsic lookup.
    UndefinedIdentifier,
    /// Operand types incompatible with an operation.
    Type,
    /// Numeric index outside the valid range for a string/list.
    Index,
    /// Map lookup failed and the `__isa` chain did not supply a value.
    Key,
    /// Catch-all: bad L-value, assignment to a reserved name, etc.
    Runtime,
    /// A list/string/call-argument size cap was exceeded.
    LimitExceeded,
    /// A call supplied more arguments than the callee accepts.
    TooManyArguments,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Compile => "Compile Error",
            ErrorKind::UndefinedIdentifier => "Undefined Identifier",
            ErrorKind::Type => "Type Error",
            ErrorKind::Index => "Index Error",
            ErrorKind::Key => "Key Error",
            ErrorKind::Runtime => "Runtime Error",
            ErrorKind::LimitExceeded => "Limit Exceeded",
            ErrorKind::TooManyArguments => "Too Many Arguments",
        };
        write!(f, "{s}")
    }
}

/// A MiniScript error: a kind, a human-readable message, and an optional
/// source location filled in (if missing) by the Machine as it unwinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    location: Option<Location>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
            location: None,
        }
    }

    pub fn compile(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Compile, message)
    }

    pub fn undefined_identifier(name: &str) -> Self {
        Error::new(ErrorKind::UndefinedIdentifier, format!("Undefined identifier '{name}'"))
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Type, message)
    }

    pub fn index_error(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Index, message)
    }

    pub fn key_error(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Key, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Runtime, message)
    }

    pub fn limit_exceeded(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::LimitExceeded, message)
    }

    pub fn too_many_arguments(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::TooManyArguments, message)
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }

    /// Annotate this error with a location, but only if it doesn't already
    /// carry one closer to the fault (the Machine calls this as it walks
    /// the call stack, innermost frame first).
    pub fn with_location_if_missing(mut self, location: Location) -> Self {
        if self.location.is_none() {
            self.location = Some(location);
        }
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "{}: {} [{loc}]", self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
