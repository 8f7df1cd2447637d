use std::{
    borrow::Cow,
    collections::{BTreeMap, BTreeSet},
    sync::OnceLock,
};

use serde_json::Value;
use url::Url;

use crate::fixture::{PostData, RequestShape, ResponseDescriptor};

const PLACEHOLDER_ORIGIN: &str = "http://mockreplay.invalid";
const READ_ONLY_METHODS: [&str; 3] = ["GET", "HEAD", "OPTIONS"];

#[derive(Debug)]
enum NormalizeError {
    Parse(url::ParseError),
    Decode(std::string::FromUtf8Error),
}

impl std::fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(err) => write!(f, "parse URL: {err}"),
            Self::Decode(err) => write!(f, "percent-decode URL path: {err}"),
        }
    }
}

impl std::error::Error for NormalizeError {}

/// Canonical `path?query` form used for every URL comparison.
///
/// # Normalization pipeline
///
/// - scheme, authority and fragment are dropped
/// - the path is percent-decoded (dot segments are resolved by the URL parser)
/// - query parameters are form-decoded, parameters named in `ignore_params` are removed and the
///   rest are stable-sorted by name, so repeated names keep their relative order
/// - characters whose decoded form would change meaning on a second pass are re-escaped, which
///   keeps the function idempotent
///
/// Malformed input is returned unchanged.
pub fn normalize_url(raw: &str, ignore_params: &BTreeSet<String>) -> String {
    match try_normalize_url(raw, ignore_params) {
        Ok(normalized) => normalized,
        Err(err) => {
            tracing::trace!(url = raw, "keeping raw URL for matching: {err}");
            raw.to_owned()
        }
    }
}

fn try_normalize_url(raw: &str, ignore_params: &BTreeSet<String>) -> Result<String, NormalizeError> {
    let parsed = parse_with_placeholder_base(raw)?;
    let path = urlencoding::decode(parsed.path()).map_err(NormalizeError::Decode)?;

    let mut params: Vec<(Cow<'_, str>, Cow<'_, str>)> = parsed
        .query_pairs()
        .filter(|(name, _)| !ignore_params.contains(&**name))
        .collect();
    params.sort_by(|(a, _), (b, _)| a.cmp(b));

    let mut normalized = escape_path(&path);
    for (idx, (name, value)) in params.iter().enumerate() {
        normalized.push(if idx == 0 { '?' } else { '&' });
        normalized.push_str(&escape_query_component(name));
        normalized.push('=');
        normalized.push_str(&escape_query_component(value));
    }
    Ok(normalized)
}

/// Parses absolute URLs as-is and everything else against a placeholder origin.
///
/// Input starting with `/` is appended to the origin rather than resolved as a relative
/// reference, so a path like `//api/students` never has its first segment read as a host.
fn parse_with_placeholder_base(raw: &str) -> Result<Url, NormalizeError> {
    static BASE: OnceLock<Option<Url>> = OnceLock::new();
    let raw = raw.trim();
    if raw.starts_with('/') {
        return Url::parse(&format!("{PLACEHOLDER_ORIGIN}{raw}")).map_err(NormalizeError::Parse);
    }
    let base = BASE.get_or_init(|| Url::parse(&format!("{PLACEHOLDER_ORIGIN}/")).ok());
    Url::options()
        .base_url(base.as_ref())
        .parse(raw)
        .map_err(NormalizeError::Parse)
}

fn escape_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for ch in path.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '?' => out.push_str("%3F"),
            '#' => out.push_str("%23"),
            '\\' => out.push_str("%5C"),
            other => out.push(other),
        }
    }
    out
}

fn escape_query_component(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for ch in component.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '&' => out.push_str("%26"),
            '=' => out.push_str("%3D"),
            '#' => out.push_str("%23"),
            '+' => out.push_str("%2B"),
            other => out.push(other),
        }
    }
    out
}

/// Decoded path of `raw`, or `raw` itself when it cannot be parsed.
pub fn url_path(raw: &str) -> String {
    parse_with_placeholder_base(raw)
        .ok()
        .and_then(|parsed| {
            urlencoding::decode(parsed.path())
                .ok()
                .map(Cow::into_owned)
        })
        .unwrap_or_else(|| raw.to_owned())
}

/// Decoded, multi-valued query parameters of `raw`.
pub fn query_params(raw: &str) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let Ok(parsed) = parse_with_placeholder_base(raw) else {
        return out;
    };
    for (name, value) in parsed.query_pairs() {
        out.entry(name.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    out
}

pub fn is_read_only_method(method: &str) -> bool {
    READ_ONLY_METHODS
        .iter()
        .any(|read_only| method.eq_ignore_ascii_case(read_only))
}

/// Whether two requests describe the same logical call.
///
/// URLs are compared after [`normalize_url`] with the same `ignore_params` applied to both
/// sides, methods are compared case-sensitively, and bodies structurally (see
/// [`contents_equal`]). The relation is symmetric.
pub fn requests_equal<A, B>(a: &A, b: &B, ignore_params: &BTreeSet<String>) -> bool
where
    A: RequestShape + ?Sized,
    B: RequestShape + ?Sized,
{
    a.request_method() == b.request_method()
        && normalize_url(a.request_url(), ignore_params)
            == normalize_url(b.request_url(), ignore_params)
        && request_bodies_equal(a.request_method(), a.request_body(), b.request_body())
}

fn request_bodies_equal(method: &str, a: Option<&PostData>, b: Option<&PostData>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(present), None) | (None, Some(present)) => {
            is_read_only_method(method) || content_is_empty(&present.text)
        }
        (Some(a), Some(b)) => contents_equal(&a.text, &b.text),
    }
}

pub fn responses_equal(a: &ResponseDescriptor, b: &ResponseDescriptor) -> bool {
    a.status == b.status
        && a.file == b.file
        && optional_contents_equal(a.content.as_deref(), b.content.as_deref())
}

fn optional_contents_equal(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(present), None) | (None, Some(present)) => content_is_empty(present),
        (Some(a), Some(b)) => contents_equal(a, b),
    }
}

/// Deep structural equality for JSON bodies; exact string equality otherwise.
///
/// Object keys whose value is `null` are treated as absent on both sides and key order is
/// irrelevant at every nesting level.
pub fn contents_equal(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    match (parse_json(a), parse_json(b)) {
        (Some(a), Some(b)) => strip_null_fields(a) == strip_null_fields(b),
        _ => false,
    }
}

fn content_is_empty(text: &str) -> bool {
    if text.trim().is_empty() {
        return true;
    }
    match parse_json(text).map(strip_null_fields) {
        Some(Value::Null) => true,
        Some(Value::Object(map)) => map.is_empty(),
        _ => false,
    }
}

fn parse_json(text: &str) -> Option<Value> {
    serde_json::from_str(text).ok()
}

fn strip_null_fields(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, value)| !value.is_null())
                .map(|(key, value)| (key, strip_null_fields(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_null_fields).collect()),
        other => other,
    }
}

/// Folds `(name, value)` pairs into a lowercase-keyed header map.
///
/// Repeated names are joined with `", "`. Names listed in `excluded` or `configured_excluded`
/// are dropped, compared case-insensitively.
pub fn header_map_from_list<I, N, V>(
    pairs: I,
    excluded: &[&str],
    configured_excluded: &[String],
) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (N, V)>,
    N: AsRef<str>,
    V: AsRef<str>,
{
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in pairs {
        let name_lc = name.as_ref().trim().to_ascii_lowercase();
        if name_lc.is_empty()
            || excluded
                .iter()
                .any(|excluded| excluded.eq_ignore_ascii_case(&name_lc))
            || configured_excluded
                .iter()
                .any(|excluded| excluded.eq_ignore_ascii_case(&name_lc))
        {
            continue;
        }
        out.entry(name_lc)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value.as_ref());
            })
            .or_insert_with(|| value.as_ref().to_owned());
    }
    out
}
