use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::normalize;

/// Request headers never persisted or compared.
pub const REQUEST_EXCLUDED_HEADERS: &[&str] = &["cookie"];
/// Response headers never persisted or replayed.
pub const RESPONSE_EXCLUDED_HEADERS: &[&str] = &["set-cookie"];
const PNG_MIME_TYPE: &str = "image/png";

/// Request body as captured: mime type plus raw text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PostData {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RequestDescriptor {
    #[serde(default)]
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub query_params: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_data: Option<PostData>,
}

impl RequestDescriptor {
    /// Builds a descriptor, deriving `path` and `queryParams` from `url`.
    pub fn new(
        url: impl Into<String>,
        method: impl Into<String>,
        headers: BTreeMap<String, String>,
        post_data: Option<PostData>,
    ) -> Self {
        let url = url.into();
        Self {
            path: normalize::url_path(&url),
            query_params: normalize::query_params(&url),
            url,
            method: method.into(),
            headers,
            post_data,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResponseDescriptor {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Asset file name under the store's `_files/` directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Artificial delay in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
}

impl ResponseDescriptor {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// One recorded request/response pair available for replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Fixture {
    pub id: String,
    pub url: String,
    pub method: String,
    pub request: RequestDescriptor,
    pub response: ResponseDescriptor,
    #[serde(default)]
    pub ignore_params: BTreeSet<String>,
    #[serde(default)]
    pub wait_for_previous: bool,
    #[serde(default)]
    pub served: bool,
}

impl Fixture {
    pub fn file_name(&self) -> String {
        fixture_file_name(&self.id)
    }

    pub fn summary(&self) -> IndexEntry {
        IndexEntry {
            id: self.id.clone(),
            file_name: self.file_name(),
            method: self.method.clone(),
            url: self.url.clone(),
            post_data: self.request.post_data.clone(),
        }
    }
}

/// Whether a mime type (parameters ignored) is `image/png`, whose content is stored as base64.
pub fn is_png_mime(mime_type: &str) -> bool {
    mime_type
        .split(';')
        .next()
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case(PNG_MIME_TYPE))
}

pub fn fixture_file_name(id: &str) -> String {
    format!("mock_{id}.json")
}

/// Summary record in a store's ordered index file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub id: String,
    pub file_name: String,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub post_data: Option<PostData>,
}

/// The request dimensions compared by [`crate::normalize::requests_equal`].
///
/// Fixtures, incoming requests and captured exchanges all expose the same three dimensions so
/// the matcher does not care which side of the comparison it was handed.
pub trait RequestShape {
    fn request_url(&self) -> &str;
    fn request_method(&self) -> &str;
    fn request_body(&self) -> Option<&PostData>;
}

impl RequestShape for Fixture {
    fn request_url(&self) -> &str {
        &self.url
    }

    fn request_method(&self) -> &str {
        &self.method
    }

    fn request_body(&self) -> Option<&PostData> {
        self.request.post_data.as_ref()
    }
}

impl RequestShape for RequestDescriptor {
    fn request_url(&self) -> &str {
        &self.url
    }

    fn request_method(&self) -> &str {
        &self.method
    }

    fn request_body(&self) -> Option<&PostData> {
        self.post_data.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{Fixture, IndexEntry, RequestDescriptor, is_png_mime};

    #[test]
    fn request_descriptor_derives_path_and_query() {
        let request = RequestDescriptor::new(
            "http://localhost:3000/api/students?page=2&tag=a&tag=b",
            "GET",
            BTreeMap::new(),
            None,
        );
        assert_eq!(request.path, "/api/students");
        assert_eq!(request.query_params["tag"], vec!["a".to_owned(), "b".to_owned()]);
        assert_eq!(request.query_params["page"], vec!["2".to_owned()]);
    }

    #[test]
    fn png_mime_ignores_parameters_and_case() {
        assert!(is_png_mime("image/png"));
        assert!(is_png_mime("Image/PNG; charset=binary"));
        assert!(!is_png_mime("image/jpeg"));
    }

    #[test]
    fn fixture_deserializes_camel_case_with_defaults() {
        let fixture: Fixture = serde_json::from_str(
            r#"{
                "id": "abc",
                "url": "/api/students?page=1",
                "method": "GET",
                "request": {"url": "http://localhost/api/students?page=1", "method": "GET"},
                "response": {"status": 200, "content": "[]"}
            }"#,
        )
        .expect("fixture should parse");

        assert!(!fixture.served);
        assert!(!fixture.wait_for_previous);
        assert!(fixture.ignore_params.is_empty());
        assert_eq!(fixture.response.delay, None);
        assert_eq!(fixture.file_name(), "mock_abc.json");
    }

    #[test]
    fn summary_mirrors_fixture_identity() {
        let fixture: Fixture = serde_json::from_str(
            r#"{
                "id": "xyz",
                "url": "/api/students",
                "method": "POST",
                "request": {"method": "POST", "postData": {"mimeType": "application/json", "text": "{}"}},
                "response": {"status": 201}
            }"#,
        )
        .expect("fixture should parse");

        let summary = fixture.summary();
        assert_eq!(
            serde_json::to_value(&summary).unwrap(),
            serde_json::json!({
                "id": "xyz",
                "fileName": "mock_xyz.json",
                "method": "POST",
                "url": "/api/students",
                "postData": {"mimeType": "application/json", "text": "{}"}
            })
        );
        let round_trip: IndexEntry = serde_json::from_value(serde_json::to_value(&summary).unwrap())
            .expect("index entry should parse");
        assert_eq!(round_trip, summary);
    }
}
