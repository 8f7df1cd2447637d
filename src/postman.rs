use std::{collections::BTreeMap, path::Path};

use serde::Deserialize;

use crate::{
    fixture::{
        PostData, REQUEST_EXCLUDED_HEADERS, RESPONSE_EXCLUDED_HEADERS, RequestDescriptor,
        ResponseDescriptor,
    },
    normalize,
    reconcile::{CaptureBatch, CapturedExchange, IdentityRule, ReconcileError},
};

const DEFAULT_EXAMPLE_STATUS: u16 = 200;

#[derive(Debug, Deserialize)]
struct Collection {
    #[serde(default)]
    info: Option<serde_json::Value>,
    item: Vec<Item>,
    #[serde(default)]
    variable: Vec<Variable>,
}

#[derive(Debug, Deserialize)]
struct Variable {
    key: String,
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    disabled: bool,
}

#[derive(Debug, Deserialize)]
struct Item {
    #[serde(default)]
    name: String,
    #[serde(default)]
    item: Option<Vec<Item>>,
    #[serde(default)]
    request: Option<RequestField>,
    #[serde(default)]
    response: Vec<SavedResponse>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RequestField {
    Url(String),
    Full(Request),
}

#[derive(Debug, Clone, Deserialize)]
struct Request {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    header: Option<Vec<KeyValue>>,
    #[serde(default)]
    body: Option<Body>,
    #[serde(default)]
    url: Option<UrlField>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum UrlField {
    Raw(String),
    Parts(UrlParts),
}

#[derive(Debug, Clone, Deserialize)]
struct UrlParts {
    #[serde(default)]
    raw: Option<String>,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    host: Option<StringOrList>,
    #[serde(default)]
    port: Option<String>,
    #[serde(default)]
    path: Option<StringOrList>,
    #[serde(default)]
    query: Vec<KeyValue>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    fn join(&self, separator: &str) -> String {
        match self {
            Self::One(value) => value.clone(),
            Self::Many(values) => values.join(separator),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct KeyValue {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    disabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct Body {
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    raw: Option<String>,
    #[serde(default)]
    urlencoded: Vec<KeyValue>,
    #[serde(default)]
    options: Option<BodyOptions>,
}

#[derive(Debug, Clone, Deserialize)]
struct BodyOptions {
    #[serde(default)]
    raw: Option<RawOptions>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawOptions {
    #[serde(default)]
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SavedResponse {
    #[serde(default)]
    name: String,
    #[serde(default)]
    original_request: Option<RequestField>,
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    header: Option<Vec<KeyValue>>,
    #[serde(default)]
    body: Option<String>,
}

/// Collection-level `{{name}}` substitutions.
struct Variables(BTreeMap<String, String>);

impl Variables {
    fn from_collection(variables: &[Variable]) -> Self {
        Self(
            variables
                .iter()
                .filter(|variable| !variable.disabled)
                .map(|variable| {
                    let value = match &variable.value {
                        Some(serde_json::Value::String(value)) => value.clone(),
                        Some(serde_json::Value::Null) | None => String::new(),
                        Some(other) => other.to_string(),
                    };
                    (variable.key.clone(), value)
                })
                .collect(),
        )
    }

    /// Replaces every known `{{name}}`; unknown placeholders are left in place.
    fn substitute(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after_open = &rest[start + 2..];
            let Some(end) = after_open.find("}}") else {
                out.push_str(&rest[start..]);
                return out;
            };
            let name = after_open[..end].trim();
            match self.0.get(name) {
                Some(value) => out.push_str(value),
                None => out.push_str(&rest[start..start + 2 + end + 2]),
            }
            rest = &after_open[end + 2..];
        }
        out.push_str(rest);
        out
    }
}

pub async fn load_collection(
    path: &Path,
    excluded_headers: &[String],
) -> Result<CaptureBatch, ReconcileError> {
    let text = tokio::fs::read_to_string(path).await.map_err(|err| {
        ReconcileError::InvalidCapture(format!(
            "read Postman collection {}: {err}",
            path.display()
        ))
    })?;
    parse_collection(&path.display().to_string(), &text, excluded_headers)
}

/// Translates a Postman v2.x collection into a capture batch with request-only identity.
///
/// Every saved response example becomes one exchange; requests without examples are skipped.
pub fn parse_collection(
    source: &str,
    text: &str,
    excluded_headers: &[String],
) -> Result<CaptureBatch, ReconcileError> {
    let collection: Collection = serde_json::from_str(text).map_err(|err| {
        ReconcileError::InvalidCapture(format!("parse Postman collection {source}: {err}"))
    })?;
    if collection.info.is_none() {
        tracing::debug!(source, "Postman collection has no `info` block");
    }

    let variables = Variables::from_collection(&collection.variable);
    let mut batch = CaptureBatch::new(source, IdentityRule::Request);
    let mut trail = Vec::new();
    collect_items(
        &collection.item,
        &variables,
        excluded_headers,
        &mut trail,
        &mut batch,
    )
    .map_err(|message| ReconcileError::InvalidCapture(format!("{source}: {message}")))?;
    Ok(batch)
}

fn collect_items<'a>(
    items: &'a [Item],
    variables: &Variables,
    excluded_headers: &[String],
    trail: &mut Vec<&'a str>,
    batch: &mut CaptureBatch,
) -> Result<(), String> {
    for item in items {
        trail.push(&item.name);
        if let Some(children) = &item.item {
            collect_items(children, variables, excluded_headers, trail, batch)?;
        } else if item.response.is_empty() {
            tracing::debug!(item = %trail.join(" / "), "skipping request without saved responses");
        } else {
            for example in &item.response {
                let request = example
                    .original_request
                    .as_ref()
                    .or(item.request.as_ref())
                    .ok_or_else(|| {
                        format!(
                            "`{}` example `{}` has no request",
                            trail.join(" / "),
                            example.name
                        )
                    })?;
                let exchange = translate_example(request, example, variables, excluded_headers)
                    .map_err(|message| format!("`{}`: {message}", trail.join(" / ")))?;
                batch.exchanges.push(exchange);
            }
        }
        trail.pop();
    }
    Ok(())
}

fn translate_example(
    request: &RequestField,
    example: &SavedResponse,
    variables: &Variables,
    excluded_headers: &[String],
) -> Result<CapturedExchange, String> {
    let (method, headers, body, url) = match request {
        RequestField::Url(url) => (None, None, None, Some(UrlField::Raw(url.clone()))),
        RequestField::Full(request) => (
            request.method.clone(),
            request.header.clone(),
            request.body.clone(),
            request.url.clone(),
        ),
    };
    let url = url
        .map(|url| resolve_url(&url, variables))
        .filter(|url| !url.is_empty())
        .ok_or_else(|| "request has no URL".to_owned())?;
    let method = method
        .map(|method| method.trim().to_ascii_uppercase())
        .filter(|method| !method.is_empty())
        .unwrap_or_else(|| "GET".to_owned());

    let headers = normalize::header_map_from_list(
        enabled_pairs(headers.as_deref().unwrap_or_default(), variables),
        REQUEST_EXCLUDED_HEADERS,
        excluded_headers,
    );
    let post_data = body.and_then(|body| translate_body(&body, &headers, variables));

    let response = ResponseDescriptor {
        status: example.code.unwrap_or(DEFAULT_EXAMPLE_STATUS),
        headers: normalize::header_map_from_list(
            enabled_pairs(example.header.as_deref().unwrap_or_default(), variables),
            RESPONSE_EXCLUDED_HEADERS,
            excluded_headers,
        ),
        content: example.body.clone().filter(|body| !body.is_empty()),
        ..ResponseDescriptor::default()
    };

    Ok(CapturedExchange::new(
        RequestDescriptor::new(url, method, headers, post_data),
        response,
    ))
}

fn enabled_pairs(pairs: &[KeyValue], variables: &Variables) -> Vec<(String, String)> {
    pairs
        .iter()
        .filter(|pair| !pair.disabled)
        .filter_map(|pair| {
            let key = pair.key.as_deref()?;
            Some((
                variables.substitute(key),
                variables.substitute(pair.value.as_deref().unwrap_or_default()),
            ))
        })
        .collect()
}

fn translate_body(
    body: &Body,
    headers: &BTreeMap<String, String>,
    variables: &Variables,
) -> Option<PostData> {
    match body.mode.as_deref() {
        Some("raw") => {
            let text = variables.substitute(body.raw.as_deref().unwrap_or_default());
            let language = body
                .options
                .as_ref()
                .and_then(|options| options.raw.as_ref())
                .and_then(|raw| raw.language.as_deref());
            let mime_type = headers
                .get("content-type")
                .cloned()
                .unwrap_or_else(|| match language {
                    Some("json") => "application/json".to_owned(),
                    Some("xml") => "application/xml".to_owned(),
                    _ => "text/plain".to_owned(),
                });
            Some(PostData { mime_type, text })
        }
        Some("urlencoded") => {
            let text = enabled_pairs(&body.urlencoded, variables)
                .into_iter()
                .map(|(key, value)| {
                    format!(
                        "{}={}",
                        urlencoding::encode(&key),
                        urlencoding::encode(&value)
                    )
                })
                .collect::<Vec<_>>()
                .join("&");
            Some(PostData {
                mime_type: "application/x-www-form-urlencoded".to_owned(),
                text,
            })
        }
        other => {
            if let Some(mode) = other {
                tracing::debug!(mode, "ignoring unsupported Postman body mode");
            }
            None
        }
    }
}

fn resolve_url(url: &UrlField, variables: &Variables) -> String {
    let raw = match url {
        UrlField::Raw(raw) => raw.clone(),
        UrlField::Parts(parts) => parts.raw.clone().unwrap_or_else(|| assemble_url(parts)),
    };
    let substituted = variables.substitute(raw.trim());
    let without_placeholder = drop_leading_placeholder(&substituted);

    if without_placeholder.is_empty()
        || without_placeholder.starts_with('/')
        || without_placeholder.contains("://")
    {
        without_placeholder.to_owned()
    } else {
        format!("http://{without_placeholder}")
    }
}

/// `{{baseUrl}}/api/x` with no known `baseUrl` replays as `/api/x`.
fn drop_leading_placeholder(url: &str) -> &str {
    if url.starts_with("{{")
        && let Some(end) = url.find("}}")
    {
        return &url[end + 2..];
    }
    url
}

fn assemble_url(parts: &UrlParts) -> String {
    let mut url = String::new();
    if let Some(protocol) = &parts.protocol {
        url.push_str(protocol);
        url.push_str("://");
    }
    if let Some(host) = &parts.host {
        url.push_str(&host.join("."));
    }
    if let Some(port) = &parts.port {
        url.push(':');
        url.push_str(port);
    }
    if let Some(path) = &parts.path {
        url.push('/');
        url.push_str(path.join("/").trim_start_matches('/'));
    }
    let query: Vec<String> = parts
        .query
        .iter()
        .filter(|pair| !pair.disabled)
        .filter_map(|pair| {
            let key = pair.key.as_deref()?;
            Some(format!("{key}={}", pair.value.as_deref().unwrap_or_default()))
        })
        .collect();
    if !query.is_empty() {
        url.push('?');
        url.push_str(&query.join("&"));
    }
    url
}
