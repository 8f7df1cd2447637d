use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Instant};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Request, Response, StatusCode,
    body::Incoming,
    header,
    http::request::Parts,
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use tokio::{net::TcpListener, sync::oneshot};

use crate::{
    config::Config,
    fixture::{PostData, REQUEST_EXCLUDED_HEADERS, RequestDescriptor},
    normalize,
    resolver::{Resolution, Resolver},
    responder,
    store::ScenarioManager,
};

const PAYLOAD_TOO_LARGE_MESSAGE: &str = "Request body too large";
const BAD_REQUEST_MESSAGE: &str = "Bad request";

#[derive(Debug)]
pub struct ServerHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

#[derive(Debug)]
struct ServerState {
    manager: ScenarioManager,
    resolver: Resolver,
    active_scenario_override: Option<String>,
    max_body_bytes: usize,
    excluded_headers: Vec<String>,
}

impl ServerState {
    /// The scenario served for the current request: the process override, else the pointer
    /// file's `testName`, re-read every time.
    async fn active_scenario(&self) -> Option<String> {
        if let Some(scenario) = &self.active_scenario_override {
            return Some(scenario.clone());
        }
        match self.manager.read_pointer().await {
            Ok(pointer) => pointer.and_then(|pointer| pointer.test_name),
            Err(err) => {
                tracing::warn!("failed to read scenario pointer: {err}");
                None
            }
        }
    }
}

pub async fn serve(config: &Config) -> anyhow::Result<ServerHandle> {
    let manager = ScenarioManager::from_config(config)?;
    let pointer_port = if config.server.listen.is_none() {
        manager
            .read_pointer()
            .await
            .map_err(|err| anyhow::anyhow!("read scenario pointer: {err}"))?
            .and_then(|pointer| pointer.port)
    } else {
        None
    };
    let bind_addr = config.listen_addr(pointer_port);

    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|err| anyhow::anyhow!("bind {bind_addr}: {err}"))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get local_addr: {err}"))?;

    let state = Arc::new(ServerState {
        resolver: Resolver::new(manager.clone()),
        manager,
        active_scenario_override: config.storage.active_scenario.clone(),
        max_body_bytes: config.server.max_body_bytes,
        excluded_headers: config.matching.excluded_headers.clone(),
    });

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| mock_handler(req, Arc::clone(&state)));
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    Ok(ServerHandle {
        listen_addr,
        shutdown_tx,
        join,
    })
}

#[derive(Debug)]
enum BodyReadOutcome {
    Buffered(Bytes),
    TooLarge,
}

async fn read_body_with_limit(
    mut body: Incoming,
    max_body_bytes: usize,
) -> Result<BodyReadOutcome, hyper::Error> {
    let mut buffered = Vec::new();
    while let Some(frame_result) = body.frame().await {
        let frame = frame_result?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        if buffered.len().saturating_add(data.len()) > max_body_bytes {
            return Ok(BodyReadOutcome::TooLarge);
        }
        buffered.extend_from_slice(&data);
    }
    Ok(BodyReadOutcome::Buffered(Bytes::from(buffered)))
}

async fn mock_handler(
    req: Request<Incoming>,
    state: Arc<ServerState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let started = Instant::now();
    let (parts, body) = req.into_parts();
    let method = parts.method.as_str().to_owned();
    let url = request_url(&parts);

    let body = match read_body_with_limit(body, state.max_body_bytes).await {
        Ok(BodyReadOutcome::Buffered(body)) => body,
        Ok(BodyReadOutcome::TooLarge) => {
            let response = responder::json_error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                PAYLOAD_TOO_LARGE_MESSAGE,
            );
            emit_mock_request_log(&method, &url, None, &Resolution::NoMatch, started, response.status());
            return Ok(response);
        }
        Err(err) => {
            tracing::debug!(method = %method, url = %url, "failed to read request body: {err}");
            let response =
                responder::json_error_response(StatusCode::BAD_REQUEST, BAD_REQUEST_MESSAGE);
            emit_mock_request_log(&method, &url, None, &Resolution::NoMatch, started, response.status());
            return Ok(response);
        }
    };

    let request = request_descriptor(&parts, url.clone(), body, &state.excluded_headers);
    let scenario = state.active_scenario().await;
    let resolution = state.resolver.resolve(scenario.as_deref(), &request).await;
    let response = responder::respond(&resolution).await;
    emit_mock_request_log(
        &method,
        &url,
        scenario.as_deref(),
        &resolution,
        started,
        response.status(),
    );
    Ok(response)
}

fn request_url(parts: &Parts) -> String {
    parts
        .uri
        .path_and_query()
        .map(|path_and_query| path_and_query.as_str().to_owned())
        .unwrap_or_else(|| parts.uri.path().to_owned())
}

fn request_descriptor(
    parts: &Parts,
    url: String,
    body: Bytes,
    excluded_headers: &[String],
) -> RequestDescriptor {
    let headers = normalize::header_map_from_list(
        parts.headers.iter().filter_map(|(name, value)| {
            value.to_str().ok().map(|value| (name.as_str(), value))
        }),
        REQUEST_EXCLUDED_HEADERS,
        excluded_headers,
    );
    let post_data = (!body.is_empty()).then(|| PostData {
        mime_type: parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned(),
        text: String::from_utf8_lossy(&body).into_owned(),
    });
    RequestDescriptor::new(url, parts.method.as_str(), headers, post_data)
}

fn emit_mock_request_log(
    method: &str,
    url: &str,
    scenario: Option<&str>,
    resolution: &Resolution,
    started: Instant,
    status: StatusCode,
) {
    let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    tracing::info!(
        method = method,
        url = url,
        scenario = scenario.unwrap_or("none"),
        source = resolution.source(),
        fixture_id = resolution.fixture_id().unwrap_or("none"),
        latency_ms,
        status = status.as_u16(),
        "mock request completed",
    );
}
