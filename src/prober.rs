use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use ::time::{format_description::well_known, OffsetDateTime};
use anyhow::{Context, Result};
use http_body_util::{BodyExt, Empty, Limited};
use hyper::body::Bytes;
use hyper::client::conn::http1;
use hyper::header::{self, HeaderValue};
use hyper::{Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_native_tls::TlsConnector;

use crate::config::{ProbeConfig, ProbeMode};
use crate::error::{ProbeError, Stage};
use crate::location::LocationMap;
use crate::types::{Endpoint, ProbeOutcome};

pub const TRACE_PATH: &str = "/cdn-cgi/trace";
pub const UPGRADE_PATH: &str = "/ws";
/// The trace document echoes our user agent back; a body without it is not the service we want.
pub const USER_AGENT_MARKER: &str = "uag=Mozilla/5.0";

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";
const WEBSOCKET_KEY: &str = "B5ReGbZ38Rrogrznmh1TFQ==";
const MAX_RESPONSE_BYTES: usize = 64 * 1024;

static COLO_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"colo=([A-Z]+)").expect("static regex"));

trait ProbeStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProbeStream for T {}

type ProbeRequest = Request<Empty<Bytes>>;

/// Runs the probe sequence for a single endpoint.
///
/// One `Prober` is shared by all workers of a run; it holds no per-probe state.
pub struct Prober {
    config: ProbeConfig,
    locations: Arc<LocationMap>,
    tls: Option<TlsConnector>,
    host: HeaderValue,
}

impl Prober {
    pub fn new(config: ProbeConfig, locations: Arc<LocationMap>) -> Result<Self> {
        let tls = if config.tls && config.mode == ProbeMode::TraceFetch {
            // Endpoints are addressed by raw IP, so the certificate never matches.
            let connector = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .context("failed to build TLS connector")?;
            Some(TlsConnector::from(connector))
        } else {
            None
        };
        let host = HeaderValue::from_str(&config.trace_host)
            .with_context(|| format!("trace host is not a valid Host header: {}", config.trace_host))?;
        Ok(Self { config, locations, tls, host })
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Probe one endpoint with the configured strategy.
    pub async fn probe(&self, endpoint: Endpoint) -> Result<ProbeOutcome, ProbeError> {
        match self.config.mode {
            ProbeMode::RawConnect => self.probe_connect(endpoint).await,
            ProbeMode::TraceFetch => self.probe_trace(endpoint).await,
        }
    }

    async fn probe_connect(&self, endpoint: Endpoint) -> Result<ProbeOutcome, ProbeError> {
        let start = Instant::now();
        let _stream = self.tcp_connect(endpoint).await?;
        Ok(ProbeOutcome {
            endpoint,
            data_center: None,
            region: None,
            country_code: None,
            city: None,
            latency: start.elapsed(),
            probed_at: now_rfc3339(),
        })
    }

    async fn probe_trace(&self, endpoint: Endpoint) -> Result<ProbeOutcome, ProbeError> {
        let (stream, latency) = self.open(endpoint).await?;
        let body = self
            .bounded(Stage::Request, fetch_body(stream, self.trace_request()))
            .await?;
        let code = parse_trace(&body)?;

        // The trace connection is closed by now; the upgrade check needs its own.
        if self.config.validate_upgrade {
            match self.check_upgrade(endpoint).await {
                Ok(true) => {}
                Ok(false) => {
                    return Err(ProbeError::UpgradeFailed(
                        "endpoint did not switch protocols".into(),
                    ))
                }
                Err(e) => return Err(ProbeError::UpgradeFailed(e.to_string())),
            }
        }

        let location = self.locations.get(&code);
        Ok(ProbeOutcome {
            endpoint,
            region: location.map(|l| l.region.clone()),
            country_code: location.map(|l| l.country_code.clone()),
            city: location.map(|l| l.city.clone()),
            data_center: Some(code),
            latency,
            probed_at: now_rfc3339(),
        })
    }

    /// Open a fresh connection and ask the endpoint to switch to WebSocket.
    ///
    /// `Ok(true)` only for a 101 response. `Ok(false)` for any other status;
    /// `Err` carries the transport failure for diagnostics.
    pub async fn check_upgrade(&self, endpoint: Endpoint) -> Result<bool, ProbeError> {
        let (stream, _) = self.open(endpoint).await?;
        let status = self
            .bounded(Stage::Upgrade, fetch_status(stream, self.upgrade_request()))
            .await?;
        debug!("upgrade check {endpoint}: status {status}");
        Ok(status == StatusCode::SWITCHING_PROTOCOLS)
    }

    async fn tcp_connect(&self, endpoint: Endpoint) -> Result<TcpStream, ProbeError> {
        let after = self.config.connect_timeout;
        match time::timeout(after, TcpStream::connect(endpoint.socket_addr())).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ProbeError::Connect { endpoint, source }),
            Err(_) => Err(ProbeError::Timeout { stage: Stage::Connect, after }),
        }
    }

    /// TCP connect, plus a TLS handshake when enabled.
    ///
    /// The returned latency covers connection establishment: the TCP connect,
    /// and in TLS mode the handshake as well. No HTTP time is included.
    async fn open(&self, endpoint: Endpoint) -> Result<(Box<dyn ProbeStream>, Duration), ProbeError> {
        let start = Instant::now();
        let tcp = self.tcp_connect(endpoint).await?;
        if let Err(e) = tcp.set_nodelay(true) {
            debug!("set_nodelay on {endpoint} failed: {e}");
        }
        let Some(tls) = &self.tls else {
            return Ok((Box::new(tcp), start.elapsed()));
        };
        let after = self.config.connect_timeout;
        match time::timeout(after, tls.connect(&self.config.trace_host, tcp)).await {
            Ok(Ok(stream)) => Ok((Box::new(stream), start.elapsed())),
            Ok(Err(e)) => Err(ProbeError::Connect { endpoint, source: io::Error::other(e) }),
            Err(_) => Err(ProbeError::Timeout { stage: Stage::Connect, after }),
        }
    }

    async fn bounded<T>(
        &self,
        stage: Stage,
        fut: impl Future<Output = Result<T, ProbeError>>,
    ) -> Result<T, ProbeError> {
        let after = self.config.request_timeout;
        match time::timeout(after, fut).await {
            Ok(res) => res,
            Err(_) => Err(ProbeError::Timeout { stage, after }),
        }
    }

    fn trace_request(&self) -> ProbeRequest {
        let mut req = self.base_request(TRACE_PATH);
        let headers = req.headers_mut();
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        req
    }

    fn upgrade_request(&self) -> ProbeRequest {
        let mut req = self.base_request(UPGRADE_PATH);
        let headers = req.headers_mut();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        headers.insert(header::SEC_WEBSOCKET_KEY, HeaderValue::from_static(WEBSOCKET_KEY));
        req
    }

    fn base_request(&self, path: &'static str) -> ProbeRequest {
        let mut req = Request::new(Empty::new());
        *req.uri_mut() = Uri::from_static(path);
        let headers = req.headers_mut();
        headers.insert(header::HOST, self.host.clone());
        headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        req
    }
}

/// Drives one HTTP/1 connection in the background and aborts it when
/// dropped, so the socket is closed on every exit path.
struct ConnectionTask(JoinHandle<()>);

impl ConnectionTask {
    fn spawn<F>(conn: F) -> Self
    where
        F: Future<Output = Result<(), hyper::Error>> + Send + 'static,
    {
        Self(tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("probe connection ended: {e}");
            }
        }))
    }
}

impl Drop for ConnectionTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Send `req` over an established stream and read the body, capped at
/// `MAX_RESPONSE_BYTES`.
async fn fetch_body(stream: Box<dyn ProbeStream>, req: ProbeRequest) -> Result<Bytes, ProbeError> {
    let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
    let _conn = ConnectionTask::spawn(conn);
    let resp = sender.send_request(req).await?;
    let body = Limited::new(resp.into_body(), MAX_RESPONSE_BYTES)
        .collect()
        .await
        .map_err(|e| ProbeError::Transport(io::Error::other(e)))?;
    Ok(body.to_bytes())
}

/// Send `req` and return only the response status.
async fn fetch_status(stream: Box<dyn ProbeStream>, req: ProbeRequest) -> Result<StatusCode, ProbeError> {
    let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
    let _conn = ConnectionTask::spawn(conn.with_upgrades());
    let resp = sender.send_request(req).await?;
    Ok(resp.status())
}

/// Extract the data-center code from a decoded trace body.
fn parse_trace(body: &[u8]) -> Result<String, ProbeError> {
    let body = String::from_utf8_lossy(body);
    if !body.contains(USER_AGENT_MARKER) {
        return Err(ProbeError::NoMatch("user agent echo missing"));
    }
    COLO_RE
        .captures(&body)
        .map(|c| c[1].to_string())
        .ok_or(ProbeError::NoMatch("colo code missing"))
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
