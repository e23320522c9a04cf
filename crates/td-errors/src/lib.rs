//! Error classification shared by every worker-runtime crate.
//!
//! [`WorkerError`] tags every failure with a [`Kind`] from the taxonomy in
//! the runtime's error handling design: each kind maps to a fixed disposition
//! (fatal-per-run, retryable-at-a-higher-layer, or surfaced-as-exit-code) and
//! carries a `short_msg` (stable, ScreamingCamelCase, safe for tests and the
//! exception file) plus a human-facing `msg`.

use std::borrow::Cow;

use thiserror::Error;

/// Exit code written by the worker on a non-user exception.
pub const EXIT_GENERAL_ERROR: i32 = 201;
/// Exit code written by the worker when user code raised a tabular/pipeline
/// exception.
pub const EXIT_TABSDATA_ERROR: i32 = 202;

/// Coarse failure category. Does not drive retries inside this core; it only
/// tells a caller how to react (fatal vs. surfaced-for-reschedule).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Configuration,
    Bundle,
    Environment,
    Integrity,
    Io,
    User,
    Other,
}

impl Kind {
    /// The exit status this error kind maps to when it escapes the worker
    /// process uncaught.
    pub fn exit_status(self) -> i32 {
        match self {
            Kind::User => EXIT_TABSDATA_ERROR,
            _ => EXIT_GENERAL_ERROR,
        }
    }
}

/// The single error type threaded through every worker-runtime crate.
///
/// Mirrors the shape of a tagged error-metadata object: a classification
/// plus a short, stable string usable in tests and exception payloads, and a
/// longer developer-facing message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{msg}")]
pub struct WorkerError {
    pub kind: Kind,
    /// ScreamingCamelCase, stable across releases. e.g. `BundleCorrupt`.
    pub short_msg: Cow<'static, str>,
    pub msg: Cow<'static, str>,
    /// Present only for `Kind::User` errors raised via a platform-visible
    /// `error_code`.
    pub error_code: Option<Cow<'static, str>>,
}

impl WorkerError {
    fn new(
        kind: Kind,
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            kind,
            short_msg: short_msg.into(),
            msg: msg.into(),
            error_code: None,
        }
    }

    pub fn configuration(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::new(Kind::Configuration, short_msg, msg)
    }

    pub fn bundle(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::new(Kind::Bundle, short_msg, msg)
    }

    pub fn environment(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::new(Kind::Environment, short_msg, msg)
    }

    pub fn integrity(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::new(Kind::Integrity, short_msg, msg)
    }

    pub fn io(short_msg: impl Into<Cow<'static, str>>, msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Kind::Io, short_msg, msg)
    }

    pub fn other(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::new(Kind::Other, short_msg, msg)
    }

    /// A `CustomException` raised by user code, with an optional
    /// platform-visible error code (truncated to 16 bytes per the exception
    /// schema).
    pub fn user(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
        error_code: Option<String>,
    ) -> Self {
        Self {
            kind: Kind::User,
            short_msg: short_msg.into(),
            msg: msg.into(),
            error_code: error_code.map(|c| Cow::Owned(truncate(&c, 16))),
        }
    }

    pub fn exit_status(&self) -> i32 {
        self.kind.exit_status()
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
