use std::collections::{BTreeSet, HashSet};

use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::{
    fixture::{
        Fixture, IndexEntry, PostData, RequestDescriptor, RequestShape, ResponseDescriptor,
        is_png_mime,
    },
    normalize,
    store::{FixtureStore, StoreError, new_fixture_id},
};

/// How a captured exchange is matched against an existing fixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityRule {
    /// Same request signature is the same fixture; the newest response wins.
    Request,
    /// Request and response must both be equal, so before/after pairs stay distinct.
    RequestAndResponse,
}

/// One observed request/response pair, already translated out of its capture format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedExchange {
    pub url: String,
    pub method: String,
    pub request: RequestDescriptor,
    pub response: ResponseDescriptor,
}

impl CapturedExchange {
    pub fn new(request: RequestDescriptor, response: ResponseDescriptor) -> Self {
        Self {
            url: normalize::normalize_url(&request.url, &BTreeSet::new()),
            method: request.method.clone(),
            request,
            response,
        }
    }

    fn into_fixture(self, id: String, previous: Option<&Fixture>) -> Fixture {
        let mut response = self.response;
        let (ignore_params, wait_for_previous) = match previous {
            Some(previous) => {
                if response.delay.is_none() {
                    response.delay = previous.response.delay;
                }
                (previous.ignore_params.clone(), previous.wait_for_previous)
            }
            None => (BTreeSet::new(), false),
        };
        Fixture {
            id,
            url: self.url,
            method: self.method,
            request: self.request,
            response,
            ignore_params,
            wait_for_previous,
            served: false,
        }
    }
}

impl RequestShape for CapturedExchange {
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

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedAsset {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Normalized output of every capture adapter.
#[derive(Debug, Clone)]
pub struct CaptureBatch {
    pub source: String,
    pub identity: IdentityRule,
    pub exchanges: Vec<CapturedExchange>,
    pub assets: Vec<CapturedAsset>,
}

impl CaptureBatch {
    pub fn new(source: impl Into<String>, identity: IdentityRule) -> Self {
        Self {
            source: source.into(),
            identity,
            exchanges: Vec::new(),
            assets: Vec::new(),
        }
    }

    /// Registers a binary asset under its SHA-256 name and returns that name.
    pub fn add_binary_asset(&mut self, bytes: Vec<u8>) -> String {
        let name = format!("{:x}", Sha256::digest(&bytes));
        if !self.assets.iter().any(|asset| asset.name == name) {
            self.assets.push(CapturedAsset {
                name: name.clone(),
                bytes,
            });
        }
        name
    }

    /// Stores a decoded response body on `response`.
    ///
    /// PNG payloads stay inline as base64, UTF-8 payloads become text and anything else is
    /// moved into an asset referenced by `response.file`.
    pub fn attach_body(&mut self, response: &mut ResponseDescriptor, mime_type: &str, bytes: Vec<u8>) {
        response.file = None;
        if bytes.is_empty() {
            response.content = None;
        } else if is_png_mime(mime_type) {
            response.content = Some(base64::engine::general_purpose::STANDARD.encode(&bytes));
        } else {
            match String::from_utf8(bytes) {
                Ok(text) => response.content = Some(text),
                Err(err) => {
                    response.content = None;
                    response.file = Some(self.add_binary_asset(err.into_bytes()));
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOptions {
    /// Discard exchanges already covered by the default store.
    pub avoid_default_duplicates: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: usize,
    pub refreshed: usize,
    pub skipped_defaults: usize,
    pub total_fixtures: usize,
    /// Fixture id assigned to each imported exchange, in batch order; skipped ones are absent.
    pub fixture_ids: Vec<String>,
}

#[derive(Debug)]
pub enum ReconcileError {
    InvalidCapture(String),
    Store(StoreError),
    Internal(String),
}

impl std::fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidCapture(message) | Self::Internal(message) => f.write_str(message),
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ReconcileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::InvalidCapture(_) | Self::Internal(_) => None,
        }
    }
}

impl From<StoreError> for ReconcileError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotOrigin {
    Untouched,
    Refreshed,
    Created,
}

/// Merges `batch` into `target`, preserving the identity of fixtures seen before.
///
/// The whole batch is validated before the store is read, and nothing is written unless every
/// staged file could be prepared. Callers serialize imports against live traffic on the same
/// store.
pub async fn reconcile(
    target: &FixtureStore,
    defaults: Option<&FixtureStore>,
    batch: CaptureBatch,
    options: ReconcileOptions,
) -> Result<ReconcileReport, ReconcileError> {
    validate_batch(&batch)?;

    let target = target.clone();
    let defaults = defaults.cloned();
    tokio::task::spawn_blocking(move || {
        reconcile_blocking(&target, defaults.as_ref(), batch, options)
    })
    .await
    .map_err(|err| ReconcileError::Internal(format!("join reconcile task failed: {err}")))?
}

fn validate_batch(batch: &CaptureBatch) -> Result<(), ReconcileError> {
    for (idx, exchange) in batch.exchanges.iter().enumerate() {
        if exchange.method.trim().is_empty() {
            return Err(ReconcileError::InvalidCapture(format!(
                "{}: entry {idx} has an empty request method",
                batch.source
            )));
        }
        if exchange.url.trim().is_empty() {
            return Err(ReconcileError::InvalidCapture(format!(
                "{}: entry {idx} has an empty request URL",
                batch.source
            )));
        }
        if !(100..=999).contains(&exchange.response.status) {
            return Err(ReconcileError::InvalidCapture(format!(
                "{}: entry {idx} has invalid response status {}",
                batch.source, exchange.response.status
            )));
        }
    }
    Ok(())
}

fn same_identity(existing: &Fixture, exchange: &CapturedExchange, identity: IdentityRule) -> bool {
    normalize::requests_equal(existing, exchange, &existing.ignore_params)
        && match identity {
            IdentityRule::Request => true,
            IdentityRule::RequestAndResponse => {
                normalize::responses_equal(&existing.response, &exchange.response)
            }
        }
}

fn reconcile_blocking(
    target: &FixtureStore,
    defaults: Option<&FixtureStore>,
    batch: CaptureBatch,
    options: ReconcileOptions,
) -> Result<ReconcileReport, ReconcileError> {
    let original_index = target.list_blocking()?;
    let mut working = target.load_all_blocking()?;
    let mut origins = vec![SlotOrigin::Untouched; working.len()];
    let default_fixtures = match defaults {
        Some(defaults) if options.avoid_default_duplicates => defaults.load_all_blocking()?,
        _ => Vec::new(),
    };

    let mut report = ReconcileReport::default();
    for exchange in batch.exchanges {
        if default_fixtures
            .iter()
            .any(|default| same_identity(default, &exchange, batch.identity))
        {
            tracing::debug!(
                source = %batch.source,
                method = %exchange.method,
                url = %exchange.url,
                "capture already covered by default fixtures; skipping"
            );
            report.skipped_defaults += 1;
            continue;
        }

        match working
            .iter()
            .position(|existing| same_identity(existing, &exchange, batch.identity))
        {
            Some(position) => {
                let id = working[position].id.clone();
                working[position] = exchange.into_fixture(id.clone(), Some(&working[position]));
                if origins[position] == SlotOrigin::Untouched {
                    origins[position] = SlotOrigin::Refreshed;
                    report.refreshed += 1;
                }
                report.fixture_ids.push(id);
            }
            None => {
                let fixture = exchange.into_fixture(new_fixture_id(), None);
                report.fixture_ids.push(fixture.id.clone());
                working.push(fixture);
                origins.push(SlotOrigin::Created);
                report.created += 1;
            }
        }
    }

    let touched: Vec<Fixture> = working
        .iter()
        .zip(&origins)
        .filter(|(_, origin)| **origin != SlotOrigin::Untouched)
        .map(|(fixture, _)| fixture.clone())
        .collect();
    let index = collapse_duplicate_entries(
        working
            .iter()
            .zip(&origins)
            .enumerate()
            .map(|(position, (fixture, origin))| match origin {
                SlotOrigin::Untouched => original_index[position].clone(),
                SlotOrigin::Refreshed | SlotOrigin::Created => fixture.summary(),
            }),
    );
    report.total_fixtures = index.len();

    let assets: Vec<(String, Vec<u8>)> = batch
        .assets
        .into_iter()
        .map(|asset| (asset.name, asset.bytes))
        .collect();
    if touched.is_empty() && assets.is_empty() && index == original_index {
        return Ok(report);
    }
    target.commit_batch_blocking(&touched, &assets, &index)?;

    tracing::info!(
        source = %batch.source,
        store = %target.label(),
        created = report.created,
        refreshed = report.refreshed,
        skipped_defaults = report.skipped_defaults,
        total = report.total_fixtures,
        "reconciled capture batch"
    );
    Ok(report)
}

fn collapse_duplicate_entries(entries: impl Iterator<Item = IndexEntry>) -> Vec<IndexEntry> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for entry in entries {
        let key = serde_json::to_string(&entry).unwrap_or_else(|_| entry.id.clone());
        if seen.insert(key) {
            out.push(entry);
        }
    }
    out
}
