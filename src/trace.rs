use std::{
    collections::BTreeMap,
    fs,
    io::Read as _,
    path::{Component, Path, PathBuf},
};

use serde::Deserialize;

use crate::{
    fixture::{
        PostData, REQUEST_EXCLUDED_HEADERS, RESPONSE_EXCLUDED_HEADERS, RequestDescriptor,
        ResponseDescriptor,
    },
    normalize,
    reconcile::{CaptureBatch, CapturedExchange, IdentityRule, ReconcileError},
};

const NETWORK_FILE_EXTENSION: &str = "network";
const RESOURCES_DIRNAME: &str = "resources";
const RESOURCE_SNAPSHOT_EVENT: &str = "resource-snapshot";

#[derive(Debug, Deserialize)]
struct TraceEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    snapshot: Option<ResourceSnapshot>,
}

#[derive(Debug, Deserialize)]
struct ResourceSnapshot {
    request: SnapshotRequest,
    response: SnapshotResponse,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotRequest {
    method: String,
    url: String,
    #[serde(default)]
    headers: Vec<SnapshotHeader>,
    #[serde(default)]
    post_data: Option<SnapshotBody>,
}

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    status: i64,
    #[serde(default)]
    headers: Vec<SnapshotHeader>,
    #[serde(default)]
    content: Option<SnapshotBody>,
}

#[derive(Debug, Deserialize)]
struct SnapshotHeader {
    name: String,
    #[serde(default)]
    value: String,
}

/// Body either inline or stored under `resources/` by content hash.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotBody {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "_sha1")]
    sha1: Option<String>,
}

/// Where trace files come from: an extracted directory or the `.zip` archive itself.
enum TraceSource {
    Dir(PathBuf),
    Archive(BTreeMap<String, Vec<u8>>),
}

impl TraceSource {
    fn open(path: &Path) -> Result<Self, ReconcileError> {
        if path.is_dir() {
            return Ok(Self::Dir(path.to_path_buf()));
        }
        let file = fs::File::open(path).map_err(|err| {
            ReconcileError::InvalidCapture(format!("open trace {}: {err}", path.display()))
        })?;
        let mut archive = zip::ZipArchive::new(file).map_err(|err| {
            ReconcileError::InvalidCapture(format!("read trace archive {}: {err}", path.display()))
        })?;
        let mut entries = BTreeMap::new();
        for idx in 0..archive.len() {
            let mut entry = archive.by_index(idx).map_err(|err| {
                ReconcileError::InvalidCapture(format!(
                    "read trace archive {} entry {idx}: {err}",
                    path.display()
                ))
            })?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_owned();
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).map_err(|err| {
                ReconcileError::InvalidCapture(format!(
                    "read `{name}` from trace archive {}: {err}",
                    path.display()
                ))
            })?;
            entries.insert(name, bytes);
        }
        Ok(Self::Archive(entries))
    }

    /// `*.network` files at the top level, in name order, as `(label, text)`.
    fn network_files(&self) -> Result<Vec<(String, String)>, ReconcileError> {
        match self {
            Self::Dir(dir) => network_files(dir)?
                .into_iter()
                .map(|path| {
                    fs::read_to_string(&path)
                        .map(|text| (path.display().to_string(), text))
                        .map_err(|err| {
                            ReconcileError::InvalidCapture(format!("read {}: {err}", path.display()))
                        })
                })
                .collect(),
            Self::Archive(entries) => entries
                .iter()
                .filter(|(name, _)| {
                    !name.contains('/') && name.ends_with(&format!(".{NETWORK_FILE_EXTENSION}"))
                })
                .map(|(name, bytes)| {
                    String::from_utf8(bytes.clone())
                        .map(|text| (name.clone(), text))
                        .map_err(|err| {
                            ReconcileError::InvalidCapture(format!("{name} is not UTF-8: {err}"))
                        })
                })
                .collect(),
        }
    }

    fn resource(&self, name: &str) -> Result<Vec<u8>, String> {
        let mut components = Path::new(name).components();
        if !matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) {
            return Err(format!("resource name `{name}` must be a plain file name"));
        }
        match self {
            Self::Dir(dir) => {
                let path = dir.join(RESOURCES_DIRNAME).join(name);
                fs::read(&path).map_err(|err| format!("read resource {}: {err}", path.display()))
            }
            Self::Archive(entries) => entries
                .get(&format!("{RESOURCES_DIRNAME}/{name}"))
                .cloned()
                .ok_or_else(|| format!("resource `{name}` is missing from the trace archive")),
        }
    }
}

pub async fn load_trace(
    path: &Path,
    excluded_headers: &[String],
) -> Result<CaptureBatch, ReconcileError> {
    let path = path.to_path_buf();
    let excluded_headers = excluded_headers.to_vec();
    tokio::task::spawn_blocking(move || parse_trace(&path, &excluded_headers))
        .await
        .map_err(|err| ReconcileError::Internal(format!("join trace parse task failed: {err}")))?
}

/// Reads a browser trace from a `.zip` archive or its extracted directory.
///
/// Every top-level `*.network` file is read in name order. Bodies referenced by `_sha1` are
/// loaded from `resources/`. The batch uses request-and-response identity.
pub fn parse_trace(
    path: &Path,
    excluded_headers: &[String],
) -> Result<CaptureBatch, ReconcileError> {
    let source = path.display().to_string();
    let trace = TraceSource::open(path)?;
    let network_files = trace.network_files()?;
    if network_files.is_empty() {
        return Err(ReconcileError::InvalidCapture(format!(
            "{source}: no *.{NETWORK_FILE_EXTENSION} files found"
        )));
    }

    let mut batch = CaptureBatch::new(source.as_str(), IdentityRule::RequestAndResponse);
    for (label, text) in network_files {
        for (line_idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let location = format!("{label}:{}", line_idx + 1);
            let event: TraceEvent = serde_json::from_str(line).map_err(|err| {
                ReconcileError::InvalidCapture(format!("parse trace event at {location}: {err}"))
            })?;
            if event.kind != RESOURCE_SNAPSHOT_EVENT {
                continue;
            }
            let Some(snapshot) = event.snapshot else {
                return Err(ReconcileError::InvalidCapture(format!(
                    "{location}: resource snapshot without a `snapshot` body"
                )));
            };
            if !is_http_url(&snapshot.request.url) || snapshot.response.status <= 0 {
                tracing::debug!(%location, url = %snapshot.request.url, "skipping trace resource");
                continue;
            }
            let exchange = translate_snapshot(&mut batch, snapshot, &trace, excluded_headers)
                .map_err(|message| ReconcileError::InvalidCapture(format!("{location}: {message}")))?;
            batch.exchanges.push(exchange);
        }
    }
    Ok(batch)
}

fn network_files(dir: &Path) -> Result<Vec<PathBuf>, ReconcileError> {
    let entries = fs::read_dir(dir).map_err(|err| {
        ReconcileError::InvalidCapture(format!("read trace dir {}: {err}", dir.display()))
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|err| {
                ReconcileError::InvalidCapture(format!("iterate trace dir {}: {err}", dir.display()))
            })?
            .path();
        if path.is_file()
            && path
                .extension()
                .is_some_and(|extension| extension == NETWORK_FILE_EXTENSION)
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn translate_snapshot(
    batch: &mut CaptureBatch,
    snapshot: ResourceSnapshot,
    trace: &TraceSource,
    excluded_headers: &[String],
) -> Result<CapturedExchange, String> {
    let ResourceSnapshot { request, response } = snapshot;

    let post_data = match request.post_data {
        Some(body) => {
            let bytes = read_body(&body, trace)?;
            Some(PostData {
                mime_type: body.mime_type,
                text: String::from_utf8_lossy(&bytes).into_owned(),
            })
        }
        None => None,
    };
    let request = RequestDescriptor::new(
        request.url,
        request.method,
        normalize::header_map_from_list(
            request.headers.iter().map(|header| (&header.name, &header.value)),
            REQUEST_EXCLUDED_HEADERS,
            excluded_headers,
        ),
        post_data,
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
    if let Some(content) = response.content {
        let bytes = read_body(&content, trace)?;
        batch.attach_body(&mut descriptor, &content.mime_type, bytes);
    }

    Ok(CapturedExchange::new(request, descriptor))
}

fn read_body(body: &SnapshotBody, trace: &TraceSource) -> Result<Vec<u8>, String> {
    if let Some(text) = &body.text {
        return Ok(text.clone().into_bytes());
    }
    match body.sha1.as_deref() {
        Some(name) => trace.resource(name),
        None => Ok(Vec::new()),
    }
}

fn is_http_url(url: &str) -> bool {
    url::Url::parse(url).is_ok_and(|parsed| matches!(parsed.scheme(), "http" | "https"))
}
