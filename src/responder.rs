use std::time::Duration;

use base64::Engine as _;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    Response, StatusCode,
    header::{self, HeaderName, HeaderValue},
};

use crate::{
    fixture::{Fixture, is_png_mime},
    resolver::Resolution,
    store::{FixtureStore, StoreError},
};

const NOT_FOUND_MESSAGE: &str = "Not found";
const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";
const JSON_CONTENT_TYPE: &str = "application/json";

/// Stored headers that are recomputed or meaningless once the body is rebuilt.
const DROPPED_STORED_HEADERS: &[&str] = &["content-encoding", "content-length"];

#[derive(Debug)]
pub enum ResponseError {
    Asset(StoreError),
    InvalidBase64(String),
    InvalidStatus(u16),
    InvalidHeader(String),
}

impl std::fmt::Display for ResponseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Asset(err) => write!(f, "read response asset: {err}"),
            Self::InvalidBase64(message) => write!(f, "decode base64 response body: {message}"),
            Self::InvalidStatus(status) => write!(f, "invalid stored status code {status}"),
            Self::InvalidHeader(message) => write!(f, "invalid stored header: {message}"),
        }
    }
}

impl std::error::Error for ResponseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Asset(err) => Some(err),
            Self::InvalidBase64(_) | Self::InvalidStatus(_) | Self::InvalidHeader(_) => None,
        }
    }
}

/// Turns a resolution into the HTTP response sent to the client. Never fails: preparation
/// errors become a JSON 500.
pub async fn respond(resolution: &Resolution) -> Response<Full<Bytes>> {
    let (fixture, store) = match resolution {
        Resolution::Scenario { fixture, store } | Resolution::Default { fixture, store } => {
            (fixture, store)
        }
        Resolution::NoMatch => return not_found_response(),
    };

    if let Some(delay_ms) = fixture.response.delay.filter(|delay_ms| *delay_ms > 0) {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    match fixture_response(fixture, store).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(
                store = %store.label(),
                fixture_id = %fixture.id,
                "failed to build fixture response: {err}"
            );
            internal_error_response()
        }
    }
}

pub async fn fixture_response(
    fixture: &Fixture,
    store: &FixtureStore,
) -> Result<Response<Full<Bytes>>, ResponseError> {
    let stored = &fixture.response;
    let status = StatusCode::from_u16(stored.status)
        .map_err(|_| ResponseError::InvalidStatus(stored.status))?;

    let mut headers = hyper::HeaderMap::new();
    for (name, value) in &stored.headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| ResponseError::InvalidHeader(format!("`{name}`: {err}")))?;
        if DROPPED_STORED_HEADERS.contains(&header_name.as_str()) {
            continue;
        }
        let header_value = HeaderValue::from_str(value)
            .map_err(|err| ResponseError::InvalidHeader(format!("`{name}` value: {err}")))?;
        headers.append(header_name, header_value);
    }
    strip_hop_by_hop_headers(&mut headers);

    let body = if let Some(file) = stored.file.as_deref() {
        Bytes::from(store.read_asset(file).await.map_err(ResponseError::Asset)?)
    } else if stored.header("content-type").is_some_and(is_png_mime) {
        let encoded = stored.content.as_deref().unwrap_or_default();
        Bytes::from(
            base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|err| ResponseError::InvalidBase64(err.to_string()))?,
        )
    } else {
        match stored.content.as_deref() {
            Some(content) => match serde_json::from_str::<serde_json::Value>(content) {
                Ok(value) => {
                    if !headers.contains_key(header::CONTENT_TYPE) {
                        headers.insert(
                            header::CONTENT_TYPE,
                            HeaderValue::from_static(JSON_CONTENT_TYPE),
                        );
                    }
                    Bytes::from(value.to_string())
                }
                Err(_) => Bytes::from(content.to_owned()),
            },
            None => Bytes::new(),
        }
    };

    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

pub fn not_found_response() -> Response<Full<Bytes>> {
    json_error_response(StatusCode::NOT_FOUND, NOT_FOUND_MESSAGE)
}

pub fn internal_error_response() -> Response<Full<Bytes>> {
    json_error_response(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_MESSAGE)
}

pub fn json_error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": message }).to_string();
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(JSON_CONTENT_TYPE),
    );
    response
}

fn strip_hop_by_hop_headers(headers: &mut hyper::HeaderMap) {
    let mut to_remove = Vec::new();
    for value in headers.get_all(header::CONNECTION).iter() {
        let Ok(value) = value.to_str() else { continue };
        for name in value.split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            to_remove.push(header_name);
        }
    }

    for header_name in to_remove {
        headers.remove(header_name);
    }

    const STANDARD: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ];
    for header_name in STANDARD {
        headers.remove(*header_name);
    }
    headers.remove("proxy-connection");
}
