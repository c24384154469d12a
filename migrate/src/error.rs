//! Error types and result definitions for migration operations.
//!
//! [`MigrateError`] carries a classification ([`ErrorKind`]), a static description, optional
//! dynamic detail and the callsite it was created at. Several errors can be aggregated into one,
//! which is how the orchestrator reports multiple failed branches of the stage graph.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::Arc;

use crate::status::StageError;

/// Convenient result type for migration operations.
pub type MigrateResult<T> = Result<T, MigrateError>;

#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    code: Option<i64>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type for migration operations.
#[derive(Debug, Clone)]
pub struct MigrateError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    /// Multiple aggregated errors, e.g. from several failed stage branches.
    Many {
        errors: Vec<MigrateError>,
        location: &'static Location<'static>,
    },
}

/// Categories of errors that can occur during a migration.
///
/// The grouping follows how the error is handled: cancellation is terminal and never retried,
/// transient errors may be retried by the component that raised them, everything else stops the
/// branch of the stage graph it happened in.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Cancellation
    Aborted,

    // Transient Errors
    CloudApiTransient,
    RemoteHelperTransient,
    RemoteHelperNotReady,
    ExportRetryable,

    // Fatal External Errors
    CloudApiFailed,
    WorkRequestFailed,
    WorkRequestCanceled,
    RemoteHelperFailed,
    ExportFailed,
    ImportFailed,
    ExternalToolFailed,

    // Consistency Errors
    GtidParseError,
    ReplicationDiverged,

    // State & Workflow Errors
    InvalidState,
    StagePanic,
    StageTimeout,
    DependencyFailed,
    UnknownCommand,
    MissingResource,

    // IO, Serialization & Configuration Errors
    IoError,
    SerializationError,
    DeserializationError,
    ConfigError,
    InvalidData,

    Unknown,

    // Used by tests that inject failures through fail points.
    #[cfg(feature = "failpoints")]
    InjectedFailure,
}

impl ErrorKind {
    /// Returns `true` for errors the raising component is allowed to retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::CloudApiTransient
                | ErrorKind::RemoteHelperTransient
                | ErrorKind::RemoteHelperNotReady
                | ErrorKind::ExportRetryable
        )
    }
}

impl MigrateError {
    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For aggregated errors, returns the kind of the first error or [`ErrorKind::Unknown`]
    /// when the aggregate is empty.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns all [`ErrorKind`]s present in this error, flattened.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.kinds()).collect()
            }
        }
    }

    /// Returns `true` when every contained error is a cancellation.
    pub fn is_aborted(&self) -> bool {
        let kinds = self.kinds();
        !kinds.is_empty() && kinds.iter().all(|kind| *kind == ErrorKind::Aborted)
    }

    pub fn description(&self) -> &str {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.description.as_ref(),
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.description())
                .unwrap_or("multiple errors"),
        }
    }

    /// Returns the detail of this error, or of the first aggregated error that has one.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Returns the numeric code reported by the external system, if any.
    pub fn code(&self) -> Option<i64> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.code,
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.code()),
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches an originating error, exposed through [`error::Error::source`].
    ///
    /// Has no effect on aggregated errors.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    /// Attaches the numeric code reported by the external system.
    pub fn with_code(mut self, code: i64) -> Self {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.code = Some(code);
        }
        self
    }

    /// Builds the record persisted in the stage's error history.
    ///
    /// Aggregates produce one record per contained error.
    pub fn to_stage_errors(&self) -> Vec<StageError> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![StageError::new(
                format!("{:?}", payload.kind),
                payload
                    .detail
                    .as_deref()
                    .unwrap_or(payload.description.as_ref())
                    .to_owned(),
                payload.detail.as_ref().map(|_| payload.description.to_string()),
                payload.code,
            )],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.to_stage_errors()).collect()
            }
        }
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        MigrateError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                code: None,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for MigrateError {
    fn eq(&self, other: &MigrateError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl Hash for MigrateError {
    /// Hashes the kind and static description only, so repeated occurrences group together.
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.repr).hash(state);
        match &self.repr {
            ErrorRepr::Single(payload) => {
                payload.kind.hash(state);
                payload.description.hash(state);
            }
            ErrorRepr::Many { errors, .. } => {
                errors.len().hash(state);
                for error in errors {
                    error.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for MigrateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if let Some(code) = payload.code {
                    write!(f, "\n  Code: {code}")?;
                }
                write_block("Detail", payload.detail.as_deref(), f)?;

                let backtrace = payload.backtrace.to_string();
                if !backtrace.trim().is_empty() {
                    write_block("Backtrace", Some(&backtrace), f)?;
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    write!(f, "\n  {}. {}", index + 1, lines.next().unwrap_or_default())?;
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for MigrateError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

fn write_block(title: &str, content: Option<&str>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let Some(content) = content else {
        return Ok(());
    };

    if content.trim().is_empty() {
        return write!(f, "\n  {title}: <empty>");
    }

    write!(f, "\n  {title}:")?;
    for line in content.lines() {
        write!(f, "\n    {line}")?;
    }

    Ok(())
}

impl From<(ErrorKind, &'static str)> for MigrateError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> MigrateError {
        MigrateError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for MigrateError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> MigrateError {
        MigrateError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates several errors. A single error is returned unwrapped.
impl<E> From<Vec<E>> for MigrateError
where
    E: Into<MigrateError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> MigrateError {
        let location = Location::caller();

        let mut errors: Vec<MigrateError> = errors.into_iter().map(Into::into).collect();
        if errors.len() == 1 {
            if let Some(error) = errors.pop() {
                return error;
            }
        }

        MigrateError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for MigrateError {
    #[track_caller]
    fn from(err: std::io::Error) -> MigrateError {
        let detail = err.to_string();
        MigrateError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<serde_json::Error> for MigrateError {
    #[track_caller]
    fn from(err: serde_json::Error) -> MigrateError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        let detail = err.to_string();
        MigrateError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<std::num::ParseIntError> for MigrateError {
    #[track_caller]
    fn from(err: std::num::ParseIntError) -> MigrateError {
        let detail = err.to_string();
        MigrateError::from_components(
            ErrorKind::InvalidData,
            Cow::Borrowed("Integer parsing failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<crate::gtid::ParseGtidError> for MigrateError {
    #[track_caller]
    fn from(err: crate::gtid::ParseGtidError) -> MigrateError {
        let detail = err.to_string();
        MigrateError::from_components(
            ErrorKind::GtidParseError,
            Cow::Borrowed("Invalid GTID set"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// A panicking or cancelled task surfaces as [`ErrorKind::StagePanic`].
impl From<tokio::task::JoinError> for MigrateError {
    #[track_caller]
    fn from(err: tokio::task::JoinError) -> MigrateError {
        let detail = err.to_string();
        MigrateError::from_components(
            ErrorKind::StagePanic,
            Cow::Borrowed("A stage worker panicked"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<config::LoadConfigError> for MigrateError {
    #[track_caller]
    fn from(err: config::LoadConfigError) -> MigrateError {
        let detail = err.to_string();
        MigrateError::from_components(
            ErrorKind::ConfigError,
            Cow::Borrowed("Configuration could not be loaded"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<config::shared::ValidationError> for MigrateError {
    #[track_caller]
    fn from(err: config::shared::ValidationError) -> MigrateError {
        let detail = err.to_string();
        MigrateError::from_components(
            ErrorKind::ConfigError,
            Cow::Borrowed("Configuration is invalid"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}
