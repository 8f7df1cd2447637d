use std::path::Path;

use base64::Engine as _;
use serde::Deserialize;

use crate::{
    fixture::{
        PostData, REQUEST_EXCLUDED_HEADERS, RESPONSE_EXCLUDED_HEADERS, RequestDescriptor,
        ResponseDescriptor,
    },
    normalize,
    reconcile::{CaptureBatch, CapturedExchange, IdentityRule, ReconcileError},
};

#[derive(Debug, Deserialize)]
struct HarDocument {
    log: HarLog,
}

#[derive(Debug, Deserialize)]
struct HarLog {
    #[serde(default)]
    entries: Vec<HarEntry>,
}

#[derive(Debug, Deserialize)]
struct HarEntry {
    request: HarRequest,
    response: HarResponse,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HarRequest {
    method: String,
    url: String,
    #[serde(default)]
    headers: Vec<HarHeader>,
    #[serde(default)]
    post_data: Option<HarPostData>,
}

#[derive(Debug, Deserialize)]
struct HarHeader {
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HarPostData {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HarResponse {
    status: i64,
    #[serde(default)]
    headers: Vec<HarHeader>,
    #[serde(default)]
    content: HarContent,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HarContent {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

pub async fn load_har(
    path: &Path,
    excluded_headers: &[String],
) -> Result<CaptureBatch, ReconcileError> {
    let text = tokio::fs::read_to_string(path).await.map_err(|err| {
        ReconcileError::InvalidCapture(format!("read HAR file {}: {err}", path.display()))
    })?;
    parse_har(&path.display().to_string(), &text, excluded_headers)
}

/// Translates a HAR document into a capture batch with request-and-response identity.
///
/// Entries whose URL is not `http`/`https`, or that never received a response, are skipped.
pub fn parse_har(
    source: &str,
    text: &str,
    excluded_headers: &[String],
) -> Result<CaptureBatch, ReconcileError> {
    let document: HarDocument = serde_json::from_str(text)
        .map_err(|err| ReconcileError::InvalidCapture(format!("parse HAR {source}: {err}")))?;

    let mut batch = CaptureBatch::new(source, IdentityRule::RequestAndResponse);
    for (idx, entry) in document.log.entries.into_iter().enumerate() {
        if !is_http_url(&entry.request.url) {
            tracing::debug!(source, entry = idx, url = %entry.request.url, "skipping non-HTTP HAR entry");
            continue;
        }
        if entry.response.status <= 0 {
            tracing::debug!(source, entry = idx, url = %entry.request.url, "skipping HAR entry without a response");
            continue;
        }
        let exchange = translate_entry(&mut batch, entry, excluded_headers)
            .map_err(|message| ReconcileError::InvalidCapture(format!("{source}: entry {idx}: {message}")))?;
        batch.exchanges.push(exchange);
    }
    Ok(batch)
}

fn translate_entry(
    batch: &mut CaptureBatch,
    entry: HarEntry,
    excluded_headers: &[String],
) -> Result<CapturedExchange, String> {
    let HarEntry { request, response } = entry;

    let request = RequestDescriptor::new(
        request.url,
        request.method,
        normalize::header_map_from_list(
            request.headers.iter().map(|header| (&header.name, &header.value)),
            REQUEST_EXCLUDED_HEADERS,
            excluded_headers,
        ),
        request.post_data.map(|post_data| PostData {
            mime_type: post_data.mime_type,
            text: post_data.text.unwrap_or_default(),
        }),
    );

    let status = u16::try_from(response.status)
        .map_err(|_| format!("response status {} is out of range", response.status))?;
    let mut descriptor = ResponseDescriptor {
        status,
        headers: normalize::header_map_from_list(
            response.headers.iter().map(|header| (&header.name, &header.value)),
            RESPONSE_EXCLUDED_HEADERS,
            excluded_headers,
        ),
        ..ResponseDescriptor::default()
    };

    let HarContent {
        mime_type,
        text,
        encoding,
    } = response.content;
    match (text, encoding.as_deref()) {
        (Some(text), Some(encoding)) if encoding.eq_ignore_ascii_case("base64") => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(text.trim())
                .map_err(|err| format!("decode base64 response body: {err}"))?;
            batch.attach_body(&mut descriptor, &mime_type, bytes);
        }
        (Some(text), _) if !text.is_empty() => descriptor.content = Some(text),
        _ => {}
    }

    Ok(CapturedExchange::new(request, descriptor))
}

fn is_http_url(url: &str) -> bool {
    url::Url::parse(url).is_ok_and(|parsed| matches!(parsed.scheme(), "http" | "https"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_har;
    use crate::reconcile::{IdentityRule, ReconcileError};

    fn har(entries: serde_json::Value) -> String {
        json!({"log": {"version": "1.2", "entries": entries}}).to_string()
    }

    fn entry(method: &str, url: &str, status: i64, content: serde_json::Value) -> serde_json::Value {
        json!({
            "request": {
                "method": method,
                "url": url,
                "headers": [
                    {"name": "Accept", "value": "application/json"},
                    {"name": "Cookie", "value": "session=secret"}
                ]
            },
            "response": {
                "status": status,
                "headers": [
                    {"name": "Content-Type", "value": "application/json"},
                    {"name": "Set-Cookie", "value": "session=secret"}
                ],
                "content": content
            }
        })
    }

    #[test]
    fn translates_entries_and_drops_cookies() {
        let text = har(json!([entry(
            "GET",
            "http://localhost:3000/api/students?page=1",
            200,
            json!({"mimeType": "application/json", "text": "[]"})
        )]));

        let batch = parse_har("capture.har", &text, &[]).unwrap();

        assert_eq!(batch.identity, IdentityRule::RequestAndResponse);
        assert_eq!(batch.exchanges.len(), 1);
        let exchange = &batch.exchanges[0];
        assert_eq!(exchange.url, "/api/students?page=1");
        assert_eq!(exchange.request.path, "/api/students");
        assert_eq!(exchange.request.headers.get("accept").map(String::as_str), Some("application/json"));
        assert!(!exchange.request.headers.contains_key("cookie"));
        assert!(!exchange.response.headers.contains_key("set-cookie"));
        assert_eq!(exchange.response.content.as_deref(), Some("[]"));
    }

    #[test]
    fn skips_non_http_and_unanswered_entries() {
        let text = har(json!([
            entry("GET", "data:image/png;base64,AAAA", 200, json!({})),
            entry("GET", "ws://localhost:3000/socket", 101, json!({})),
            entry("GET", "http://localhost:3000/blocked", 0, json!({})),
            entry("POST", "https://api.example.com/api/students", 201, json!({"text": "{\"id\":6}"}))
        ]));

        let batch = parse_har("capture.har", &text, &[]).unwrap();
        assert_eq!(batch.exchanges.len(), 1);
        assert_eq!(batch.exchanges[0].method, "POST");
    }

    #[test]
    fn base64_bodies_become_text_png_or_assets() {
        let text = har(json!([
            entry("GET", "http://h/text", 200, json!({"mimeType": "application/json", "text": "eyJhIjoxfQ==", "encoding": "base64"})),
            entry("GET", "http://h/logo.png", 200, json!({"mimeType": "image/png", "text": "iVBORw==", "encoding": "base64"})),
            entry("GET", "http://h/font", 200, json!({"mimeType": "font/woff2", "text": "//4A", "encoding": "base64"}))
        ]));

        let batch = parse_har("capture.har", &text, &[]).unwrap();

        assert_eq!(batch.exchanges[0].response.content.as_deref(), Some(r#"{"a":1}"#));
        assert_eq!(batch.exchanges[1].response.content.as_deref(), Some("iVBORw=="));
        let asset = batch.exchanges[2].response.file.clone().expect("binary asset");
        assert_eq!(batch.assets.len(), 1);
        assert_eq!(batch.assets[0].name, asset);
        assert_eq!(batch.assets[0].bytes, vec![0xff, 0xfe, 0x00]);
    }

    #[test]
    fn configured_header_exclusions_apply_to_both_sides() {
        let text = har(json!([entry("GET", "http://h/a", 200, json!({}))]));
        let batch = parse_har("capture.har", &text, &["accept".to_owned(), "content-type".to_owned()]).unwrap();
        assert!(batch.exchanges[0].request.headers.is_empty());
        assert!(batch.exchanges[0].response.headers.is_empty());
    }

    #[test]
    fn malformed_documents_are_rejected() {
        assert!(matches!(
            parse_har("bad.har", "{\"log\": 5}", &[]),
            Err(ReconcileError::InvalidCapture(_))
        ));
        let bad_base64 = har(json!([entry("GET", "http://h/a", 200, json!({"text": "!!!", "encoding": "base64"}))]));
        let err = parse_har("bad.har", &bad_base64, &[]).unwrap_err();
        assert!(err.to_string().contains("entry 0"), "error: {err}");
    }
}
