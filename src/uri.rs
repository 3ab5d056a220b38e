use std::sync::OnceLock;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;

use crate::error::ODataError;

/// Unreserved characters plus sub-delimiters, `:` and `@`: everything a path segment may carry
/// literally. `/` is escaped.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'!')
    .remove(b'$')
    .remove(b'&')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'*')
    .remove(b'+')
    .remove(b',')
    .remove(b';')
    .remove(b'=')
    .remove(b':')
    .remove(b'@');

const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'*')
    .remove(b'-')
    .remove(b':')
    .remove(b',')
    .remove(b'/')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'.');

/// Batch sub-requests are written as literal request lines, so almost everything is escaped.
const BATCH: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'~')
    .remove(b'-')
    .remove(b'.');

/// How path segments and query values are percent-encoded when building a URI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum UriEncodingStrategy {
    /// No escaping at all. Only suitable for display.
    None,
    #[default]
    Regular,
    /// Minimal escaper for URIs embedded in a batch body.
    Batch,
}

impl UriEncodingStrategy {
    /// Escape a single path segment. Slashes are escaped too.
    pub fn escape_path_segment(self, segment: &str) -> String {
        match self {
            Self::None => segment.to_owned(),
            Self::Regular => utf8_percent_encode(segment, PATH_SEGMENT).to_string(),
            Self::Batch => utf8_percent_encode(segment, BATCH).to_string(),
        }
    }

    /// Escape a query parameter value.
    pub fn escape_query(self, value: &str) -> String {
        match self {
            Self::None => value.to_owned(),
            Self::Regular => utf8_percent_encode(value, QUERY_VALUE).to_string(),
            Self::Batch => utf8_percent_encode(value, BATCH).to_string(),
        }
    }
}

fn valid_query_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9/?:@\-._~!$&'()*+,;=%]*$").expect("query regex must compile")
    })
}

fn delta_token_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(r"(?i)\$deltatoken=([^&]+)").expect("delta token regex must compile")
    })
}

fn skip_token_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(r"(?i)\$skiptoken=([^&]+)").expect("skip token regex must compile")
    })
}

fn duplicate_slashes_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| Regex::new(r"//+").expect("slash regex must compile"))
}

/// Whether `query` only contains characters allowed in an already encoded query.
pub fn is_encoded_query(query: &str) -> bool {
    valid_query_regex().is_match(query)
}

/// Encode every `/`-separated segment of `path` individually. Separators are kept.
pub fn encode_path(path: &str, strategy: UriEncodingStrategy) -> String {
    path.split('/')
        .map(|segment| strategy.escape_path_segment(segment))
        .collect::<Vec<_>>()
        .join("/")
}

/// Bring a path into the form `/a/b/c`: leading slash, no repeated slashes, no trailing slash.
/// An empty path stays empty.
pub fn sanitize_path(path: &str) -> String {
    let prefixed = format!("/{path}");
    let collapsed = duplicate_slashes_regex()
        .replace_all(&prefixed, "/")
        .into_owned();
    match collapsed.strip_suffix('/') {
        Some(trimmed) => trimmed.to_owned(),
        None => collapsed,
    }
}

/// Build a relative URI from an unencoded service path, an encoded resource path and an
/// optional encoded query.
///
/// Fails when the query carries characters that cannot appear in an encoded query, which
/// usually means it was never encoded.
pub fn create_and_encode_uri(
    service_path: &str,
    encoded_resource_path: &str,
    encoded_query: Option<&str>,
    strategy: UriEncodingStrategy,
) -> Result<String, ODataError> {
    let mut uri = sanitize_path(&encode_path(service_path, strategy));
    if !encoded_resource_path.starts_with('/') {
        uri.push('/');
    }
    uri.push_str(encoded_resource_path);

    match encoded_query.filter(|query| !query.is_empty()) {
        Some(query) if !is_encoded_query(query) => Err(ODataError::request_construction(format!(
            "the query part of the OData request is not correctly encoded: \"{query}\""
        ))),
        Some(query) => {
            uri.push('?');
            uri.push_str(query);
            Ok(uri)
        }
        None => Ok(uri),
    }
}

/// Encoded service path with a trailing slash, e.g. `service-path/` becomes `/service-path/`.
pub fn encoded_service_path(service_path: &str, strategy: UriEncodingStrategy) -> String {
    let mut uri = sanitize_path(&encode_path(service_path, strategy));
    uri.push('/');
    uri
}

/// Raw query component of a URI or link, without the leading `?` and any fragment.
pub fn raw_query(uri: &str) -> Option<&str> {
    let (_, rest) = uri.split_once('?')?;
    let query = rest.split_once('#').map_or(rest, |(query, _)| query);
    Some(query)
}

/// Percent-decode a URI component, replacing invalid UTF-8 sequences.
pub fn decode(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

/// Value of the `$deltatoken` query option in `url`, if any.
pub fn extract_delta_token(url: &str) -> Option<String> {
    delta_token_regex()
        .captures(url)
        .and_then(|captures| captures.get(1))
        .map(|token| token.as_str().to_owned())
}

/// Value of the `$skiptoken` query option in `url`, if any.
pub fn extract_skip_token(url: &str) -> Option<String> {
    skip_token_regex()
        .captures(url)
        .and_then(|captures| captures.get(1))
        .map(|token| token.as_str().to_owned())
}
