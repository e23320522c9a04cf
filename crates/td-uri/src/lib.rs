//! Classifies and converts between location URIs (`file://`, `s3://`,
//! `az://`, `gs://`, and JDBC-like `dialect://host:port/db` SQL URIs) and
//! platform paths.

use std::path::{Path, PathBuf};

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UriError {
    #[error("uri {0:?} has no recognized scheme")]
    UnknownScheme(String),
    #[error("uri {0:?} is not a file:// uri")]
    NotAFileUri(String),
    #[error("uri {0:?} could not be parsed: {1}")]
    Malformed(String, String),
    #[error("path {0:?} is not valid UTF-8")]
    NonUtf8Path(String),
}

/// The classification of a [`Location`]'s URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UriKind {
    Local,
    S3,
    Azure,
    Gcs,
    Sql { dialect: String },
}

/// Classifies a URI by scheme. Does not validate the rest of the URI.
pub fn classify(uri: &str) -> Result<UriKind, UriError> {
    let scheme = scheme_of(uri)?;
    Ok(match scheme.as_str() {
        "file" => UriKind::Local,
        "s3" => UriKind::S3,
        "az" => UriKind::Azure,
        "gs" => UriKind::Gcs,
        other => UriKind::Sql {
            dialect: other.to_owned(),
        },
    })
}

fn scheme_of(uri: &str) -> Result<String, UriError> {
    uri.split_once("://")
        .map(|(scheme, _)| scheme.to_ascii_lowercase())
        .ok_or_else(|| UriError::UnknownScheme(uri.to_owned()))
}

const FRAGMENT: &AsciiSet = &CONTROLS.add(b'%');

/// Converts a `file://` URI to an OS path, percent-decoding it and
/// preserving a trailing separator (significant for "this is a directory"
/// semantics elsewhere in the core).
pub fn to_path(file_uri: &str) -> Result<PathBuf, UriError> {
    let rest = file_uri
        .strip_prefix("file://")
        .ok_or_else(|| UriError::NotAFileUri(file_uri.to_owned()))?;
    let had_trailing_slash = rest.len() > 1 && rest.ends_with('/');
    let decoded = percent_decode_str(rest)
        .decode_utf8()
        .map_err(|e| UriError::Malformed(file_uri.to_owned(), e.to_string()))?;
    let mut path = PathBuf::from(decoded.as_ref());
    if had_trailing_slash && !decoded.ends_with('/') {
        path.push("");
    }
    Ok(path)
}

/// Converts an OS path to a `file://` URI, percent-encoding it. Inverse of
/// [`to_path`] modulo trailing-slash handling: a path without a trailing
/// separator round-trips exactly; a directory path's trailing separator is
/// preserved as a trailing `/` in the URI.
pub fn to_uri(path: &Path) -> Result<String, UriError> {
    let s = path
        .to_str()
        .ok_or_else(|| UriError::NonUtf8Path(path.display().to_string()))?;
    let encoded = utf8_percent_encode(s, FRAGMENT).to_string();
    Ok(format!("file://{encoded}"))
}

/// Normalizes a SQL location URI: aliases `postgres` to `postgresql` and
/// `mariadb` to `mysql`, injecting the platform's default MariaDB collation
/// when the caller didn't already specify one.
pub fn normalize_sql_uri(uri: &str) -> Result<String, UriError> {
    let mut parsed =
        url::Url::parse(uri).map_err(|e| UriError::Malformed(uri.to_owned(), e.to_string()))?;
    let original_scheme = parsed.scheme().to_ascii_lowercase();
    let (new_scheme, is_mariadb) = match original_scheme.as_str() {
        "postgres" => ("postgresql", false),
        "mariadb" => ("mysql", true),
        other => (other, false),
    };
    if new_scheme != original_scheme {
        parsed
            .set_scheme(new_scheme)
            .map_err(|_| UriError::Malformed(uri.to_owned(), "bad scheme".to_owned()))?;
    }
    if is_mariadb {
        let has_collation = parsed
            .query_pairs()
            .any(|(k, _)| k.eq_ignore_ascii_case("collation"));
        if !has_collation {
            parsed
                .query_pairs_mut()
                .append_pair("collation", "utf8mb4_unicode_520_ci");
        }
    }
    Ok(parsed.to_string())
}
