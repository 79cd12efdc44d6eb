//! Error and result types for the `covfuzz` crate.

use crate::param::ValueKind;
use std::{borrow::Cow, fmt, io};

/// A result that is either `Ok(T)` or `Err(covfuzz::Error)`.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An extension trait for [`covfuzz::Result`][crate::Result] that provides
/// additional methods.
pub trait ResultExt {
    /// Ignores the error if it is [`Exhausted`][ErrorKind::Exhausted],
    /// returning `Ok(())` instead.
    ///
    /// # Examples
    ///
    /// ```
    /// use covfuzz::{Error, Result, ResultExt};
    ///
    /// let result: Result<()> = Err(Error::exhausted());
    /// let result = result.ignore_exhausted();
    /// assert!(result.is_ok());
    /// ```
    fn ignore_exhausted(self) -> Result<()>;
}

impl<T> ResultExt for Result<T> {
    #[inline]
    fn ignore_exhausted(self) -> Result<()> {
        match self {
            Ok(_) => Ok(()),
            Err(err) if err.is_exhausted() => Ok(()),
            Err(err) => Err(err),
        }
    }
}

enum ErrorInner {
    Kind(Box<ErrorKind>),

    /// For internal usage only: break out of and early exit from tweak
    /// enumeration, after we've already applied our chosen tweak. This isn't an
    /// `ErrorKind` because we don't want to allocate for this variant.
    EarlyExit,
}

/// An error that can occur when using the `covfuzz` crate.
///
/// This type is a thin wrapper around [`ErrorKind`], which contains the
/// specific kind of error that occurred.
///
/// # Examples
///
/// ```
/// use covfuzz::{Error, ErrorKind};
///
/// let error: Error = {
///     // ...
/// #   Error::shutdown()
/// };
///
/// match error.kind() {
///     ErrorKind::FirstRunFailed { expected, actual } => {
///         println!("harness misconfigured: wanted {expected:?}, got {actual:?}")
///     }
///     ErrorKind::Shutdown => println!("the invoker was already shut down"),
///
///     // The `ErrorKind` type is not exhaustive, so we always need a catch-all arm.
///     unknown => println!("unknown! {unknown:?}"),
/// }
/// ```
pub struct Error {
    inner: ErrorInner,
}

impl From<ErrorKind> for Error {
    #[inline]
    fn from(kind: ErrorKind) -> Self {
        Self {
            inner: ErrorInner::Kind(Box::new(kind)),
        }
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(err).into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorInner::Kind(kind) => match &**kind {
                ErrorKind::Exhausted => write!(f, "no tweak applies to the input"),
                ErrorKind::FirstRunFailed { expected, actual } => write!(
                    f,
                    "first run failed to start: target expects parameters {expected:?} \
                     but was given {actual:?}"
                ),
                ErrorKind::MalformedDictionary { line, message } => {
                    write!(f, "malformed dictionary entry on line {line}: {message}")
                }
                ErrorKind::Shutdown => write!(f, "the invoker has been shut down"),
                ErrorKind::Corrupt(msg) => write!(f, "corrupt persisted state: {msg}"),
                ErrorKind::Io(err) => write!(f, "i/o error: {err}"),
                ErrorKind::Other(msg) => write!(f, "an unknown error occurred: {msg}"),
            },
            ErrorInner::EarlyExit => {
                write!(f, "internal error variant: early exit from tweak loop")
            }
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.inner {
            ErrorInner::Kind(kind) => match &**kind {
                ErrorKind::Io(err) => Some(err),
                _ => None,
            },
            ErrorInner::EarlyExit => None,
        }
    }
}

impl Error {
    #[inline]
    pub(crate) fn early_exit() -> Self {
        Self {
            inner: ErrorInner::EarlyExit,
        }
    }

    #[inline]
    pub(crate) fn is_early_exit(&self) -> bool {
        matches!(self.inner, ErrorInner::EarlyExit)
    }

    /// Returns a new error indicating that no tweak could be applied.
    #[must_use]
    pub fn exhausted() -> Self {
        ErrorKind::Exhausted.into()
    }

    /// Returns a new error indicating that the first execution was handed
    /// parameters that do not match the target's signature.
    #[must_use]
    pub fn first_run_failed(expected: Vec<ValueKind>, actual: Vec<ValueKind>) -> Self {
        ErrorKind::FirstRunFailed { expected, actual }.into()
    }

    /// Returns a new error for a malformed dictionary line.
    ///
    /// `line` is 1-based.
    #[must_use]
    pub fn malformed_dictionary(line: usize, message: impl Into<ErrorMessage>) -> Self {
        ErrorKind::MalformedDictionary {
            line,
            message: message.into(),
        }
        .into()
    }

    /// Returns a new error indicating that work was submitted to an invoker
    /// after it was shut down.
    #[must_use]
    pub fn shutdown() -> Self {
        ErrorKind::Shutdown.into()
    }

    /// Returns a new error indicating that persisted state could not be
    /// decoded.
    #[must_use]
    pub fn corrupt(msg: impl Into<ErrorMessage>) -> Self {
        ErrorKind::Corrupt(msg.into()).into()
    }

    /// Returns a new error with the given message.
    #[must_use]
    pub fn other(msg: impl Into<ErrorMessage>) -> Self {
        ErrorKind::Other(msg.into()).into()
    }

    /// Returns the kind of this error.
    #[must_use]
    pub fn kind(&self) -> &ErrorKind {
        match &self.inner {
            ErrorInner::Kind(kind) => kind,
            ErrorInner::EarlyExit => unreachable!(),
        }
    }

    /// Returns `true` if the error's kind is
    /// [`Exhausted`][ErrorKind::Exhausted].
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self.kind(), ErrorKind::Exhausted)
    }

    /// Returns `true` if the error's kind is
    /// [`FirstRunFailed`][ErrorKind::FirstRunFailed].
    #[must_use]
    pub fn is_first_run_failed(&self) -> bool {
        matches!(self.kind(), ErrorKind::FirstRunFailed { .. })
    }

    /// Returns `true` if the error's kind is
    /// [`MalformedDictionary`][ErrorKind::MalformedDictionary].
    #[must_use]
    pub fn is_malformed_dictionary(&self) -> bool {
        matches!(self.kind(), ErrorKind::MalformedDictionary { .. })
    }

    /// Returns `true` if the error's kind is [`Shutdown`][ErrorKind::Shutdown].
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        matches!(self.kind(), ErrorKind::Shutdown)
    }

    /// Returns `true` if the error's kind is [`Corrupt`][ErrorKind::Corrupt].
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        matches!(self.kind(), ErrorKind::Corrupt(_))
    }

    /// Returns `true` if the error's kind is [`Io`][ErrorKind::Io].
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self.kind(), ErrorKind::Io(_))
    }

    /// Returns `true` if the error's kind is [`Other`][ErrorKind::Other].
    #[must_use]
    pub fn is_other(&self) -> bool {
        matches!(self.kind(), ErrorKind::Other(_))
    }
}

/// The kind of an error that can occur when using the `covfuzz` crate.
///
/// This enum is not exhaustive, and new variants may be added in the future.
/// When matching on this enum, a catch-all arm should be used to handle any
/// new variants that are added.
#[non_exhaustive]
#[derive(Debug)]
pub enum ErrorKind {
    /// No tweak applies to the input.
    Exhausted,

    /// The first execution failed because its parameters did not match the
    /// target's declared parameter kinds. This is a harness configuration
    /// error, not a bug in the target.
    FirstRunFailed {
        /// The parameter kinds the target declares.
        expected: Vec<ValueKind>,
        /// The parameter kinds that were actually supplied.
        actual: Vec<ValueKind>,
    },

    /// A dictionary line could not be parsed.
    MalformedDictionary {
        /// The 1-based line number of the offending line.
        line: usize,
        /// What was wrong with it.
        message: ErrorMessage,
    },

    /// Work was submitted to an invoker after it was shut down.
    Shutdown,

    /// Persisted queue or cache state could not be decoded.
    Corrupt(ErrorMessage),

    /// An I/O error from a persistence backend or dictionary file.
    Io(io::Error),

    /// Some other error occurred.
    Other(ErrorMessage),
}

impl From<Error> for ErrorKind {
    #[inline]
    fn from(err: Error) -> Self {
        match err.inner {
            ErrorInner::Kind(kind) => *kind,
            ErrorInner::EarlyExit => unreachable!(),
        }
    }
}

/// A message that can be attached to an error.
///
/// # Examples
///
/// ```
/// use covfuzz::error::ErrorMessage;
///
/// let msg = ErrorMessage::new("something went wrong");
/// assert_eq!(msg.as_str(), "something went wrong");
/// ```
#[derive(Debug)]
pub struct ErrorMessage {
    inner: Cow<'static, str>,
}

impl ErrorMessage {
    /// Returns a new error message with the given string.
    #[must_use]
    pub fn new(msg: impl Into<ErrorMessage>) -> Self {
        msg.into()
    }

    /// Returns the message as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&'static str> for ErrorMessage {
    #[inline]
    fn from(s: &'static str) -> Self {
        Self {
            inner: Cow::Borrowed(s),
        }
    }
}

impl From<Cow<'static, str>> for ErrorMessage {
    #[inline]
    fn from(s: Cow<'static, str>) -> Self {
        Self { inner: s }
    }
}

impl From<String> for ErrorMessage {
    #[inline]
    fn from(s: String) -> Self {
        Self { inner: s.into() }
    }
}

/// Accumulates the outcomes of closing several resources, keeping the first
/// failure and logging any later ones.
///
/// Every resource should be closed regardless of earlier failures; feed each
/// result in and call [`finish`][CloseErrors::finish] at the end.
#[derive(Debug, Default)]
pub(crate) struct CloseErrors {
    first: Option<Error>,
}

impl CloseErrors {
    pub(crate) fn record(&mut self, what: &str, result: Result<()>) {
        if let Err(e) = result {
            if self.first.is_some() {
                log::error!("additional failure closing {what}: {e}");
            } else {
                log::debug!("failed to close {what}: {e}");
                self.first = Some(e);
            }
        }
    }

    pub(crate) fn finish(self) -> Result<()> {
        match self.first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
