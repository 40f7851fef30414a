use std::net::SocketAddr;
use std::process::exit;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use http_body::SizeHint;
use http_body_util::Full;
use hyper::body::{Body, Incoming};
use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS,
    ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE,
    CONTENT_TYPE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;

mod metrics;
mod proxy;
mod route;
mod rule;
mod runtime_config;

use crate::metrics::{commit_http_metrics, commit_upstream_error, init_metrics_prefix};
use crate::proxy::{Proxy, ProxyError};
use crate::route::Router;
use crate::runtime_config::RUNTIME_CONFIG;

#[macro_use]
extern crate log;

static OK: &[u8] = b"Ok";
static NOT_FOUND: &[u8] = b"Not Found";
static BAD_REQUEST: &[u8] = b"Bad Request";
static PAYLOAD_TOO_LARGE: &[u8] = b"Payload Too Large";
static BAD_GATEWAY: &[u8] = b"Bad Gateway";
static NO_CONTENT: &[u8] = b"";

/// Metrics label of requests no rule matched.
const NO_RULE: &str = "";
/// Metrics label of requests sent to the fallback upstream.
const FALLBACK_RULE: &str = "fallback";

/// Everything a request handler needs, shared by all connections.
struct Gateway {
    router: Router,
    proxy: Proxy,
    fallback: Option<String>,
}

/// True when a segment of `path` is `.` or `..`, raw or percent-encoded.
fn has_dot_segment(path: &str) -> bool {
    path.split('/').any(|segment| {
        let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
        decoded == "." || decoded == ".."
    })
}

#[inline(always)]
fn get_response(
    rule: &str,
    method: &Method,
    status_code: StatusCode,
    content: &'static [u8],
    start_time: &Instant,
    req_size: &SizeHint,
) -> Result<Response<Full<Bytes>>> {
    let response: Response<Full<Bytes>> = Response::builder()
        .status(status_code)
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(ACCESS_CONTROL_ALLOW_HEADERS, "*")
        .header(ACCESS_CONTROL_ALLOW_METHODS, "*")
        .header(ACCESS_CONTROL_ALLOW_CREDENTIALS, "true")
        .header(ACCESS_CONTROL_MAX_AGE, 86400)
        .body(content.into())?;

    commit_http_metrics(
        rule,
        method,
        start_time,
        status_code,
        req_size,
        &response.body().size_hint(),
    );

    debug!("event='Response built'");
    Ok(response)
}

fn inject_cors(headers: &mut HeaderMap<HeaderValue>) {
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
}

async fn metrics() -> Result<Response<Full<Bytes>>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, encoder.format_type())
        .body(buffer.into())?;

    Ok(response)
}

async fn health() -> Result<Response<Full<Bytes>>> {
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(ACCESS_CONTROL_ALLOW_HEADERS, "*")
        .header(ACCESS_CONTROL_ALLOW_METHODS, "*")
        .body(OK.into())?;

    Ok(response)
}

async fn call(
    req: Request<Incoming>,
    proxy: &Proxy,
    rule: &str,
    destination: &str,
    client_addr: &SocketAddr,
    start_time: &Instant,
    req_size: &SizeHint,
) -> Result<Response<Full<Bytes>>> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let request_start_time = Instant::now();

    let response = proxy.forward(req, destination, client_addr).await;

    let request_duration_ms = request_start_time.elapsed().as_millis();

    match response {
        Ok(mut response) => {
            inject_cors(response.headers_mut());

            commit_http_metrics(
                rule,
                &method,
                start_time,
                response.status(),
                req_size,
                &response.body().size_hint(),
            );

            info!(
                "method='{}' path='{}' uri='{}' rule='{}' status_code='{}' duration='{}ms'",
                method,
                path,
                destination,
                rule,
                response.status().as_u16(),
                request_duration_ms,
            );

            Ok(response)
        }
        Err(ProxyError::PayloadTooLarge(limit)) => {
            warn!(
                "method='{}' path='{}' uri='{}' rule='{}' status_code='413' error='Body exceeds {} bytes'",
                method, path, destination, rule, limit,
            );

            get_response(
                rule,
                &method,
                StatusCode::PAYLOAD_TOO_LARGE,
                PAYLOAD_TOO_LARGE,
                start_time,
                req_size,
            )
        }
        Err(ProxyError::Body(error)) => {
            warn!(
                "method='{}' path='{}' uri='{}' rule='{}' status_code='400' error='{}'",
                method, path, destination, rule, error,
            );

            get_response(
                rule,
                &method,
                StatusCode::BAD_REQUEST,
                BAD_REQUEST,
                start_time,
                req_size,
            )
        }
        Err(ProxyError::Upstream(error)) => {
            warn!(
                "method='{}' path='{}' uri='{}' rule='{}' status_code='502' error='{:?}' duration='{}ms'",
                method, path, destination, rule, error, request_duration_ms,
            );
            commit_upstream_error(rule);

            get_response(
                rule,
                &method,
                StatusCode::BAD_GATEWAY,
                BAD_GATEWAY,
                start_time,
                req_size,
            )
        }
    }
}

async fn response(
    req: Request<Incoming>,
    gateway: Arc<Gateway>,
    client_addr: SocketAddr,
) -> Result<Response<Full<Bytes>>> {
    match req.uri().path() {
        "/metrics" => {
            debug!("event='Metrics endpoint'");
            return metrics().await;
        }
        "/health" => {
            debug!("event='Health endpoint'");
            return health().await;
        }
        _ => (),
    };

    let start_time = Instant::now();

    let path = req.uri().path().to_owned();
    let req_size = req.size_hint();

    // to handle CORS pre flights
    if req.method() == Method::OPTIONS {
        info!(
            "method='{}' path='{}' status_code='204'",
            req.method(),
            path
        );
        return get_response(
            NO_RULE,
            req.method(),
            StatusCode::NO_CONTENT,
            NO_CONTENT,
            &start_time,
            &req_size,
        );
    }

    if has_dot_segment(&path) {
        warn!(
            "method='{}' path='{}' status_code='400' error='Dot segment in path'",
            req.method(),
            path
        );
        return get_response(
            NO_RULE,
            req.method(),
            StatusCode::BAD_REQUEST,
            BAD_REQUEST,
            &start_time,
            &req_size,
        );
    }

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|x| x.as_str().to_owned())
        .unwrap_or_else(|| path.clone());

    let (rule, destination) = match gateway.router.route(&path_and_query) {
        Some((rule, destination)) => (rule.name(), destination),
        None => match &gateway.fallback {
            Some(fallback) => (FALLBACK_RULE, format!("{fallback}{path_and_query}")),
            None => {
                info!(
                    "method='{}' path='{}' status_code='404' error='No rewrite rule matched'",
                    req.method(),
                    path
                );
                return get_response(
                    NO_RULE,
                    req.method(),
                    StatusCode::NOT_FOUND,
                    NOT_FOUND,
                    &start_time,
                    &req_size,
                );
            }
        },
    };

    call(
        req,
        &gateway.proxy,
        rule,
        &destination,
        &client_addr,
        &start_time,
        &req_size,
    )
    .await
}

async fn serve(listener: TcpListener, gateway: Arc<Gateway>) -> Result<()> {
    loop {
        let (stream, client_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!("Failed to accept connection: {err:?}");
                continue;
            }
        };

        let io = TokioIo::new(stream);
        let gateway = gateway.clone();
        let service = service_fn(move |req| response(req, gateway.clone(), client_addr));

        tokio::task::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .preserve_header_case(true)
                .title_case_headers(true)
                .serve_connection(io, service)
                .await
            {
                error!("Failed to serve connection: {err:?}");
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    init_metrics_prefix(&RUNTIME_CONFIG.metrics_prefix);

    let addr: SocketAddr = match RUNTIME_CONFIG.bind_to.parse() {
        Ok(addr) => addr,
        Err(_) => {
            error!("event='Address bind_to is not valid'");
            exit(1);
        }
    };

    let router = match RUNTIME_CONFIG.build_router() {
        Ok(router) => router,
        Err(e) => {
            error!("event='Rewrite rules are not valid: {e}'");
            exit(1);
        }
    };
    for rule in router.rules() {
        info!(
            "event='Rewrite rule loaded' rule='{}' source='{}' destination='{}' capture='{}'",
            rule.name(),
            rule.source(),
            rule.destination(),
            rule.capture()
        );
    }

    let fallback = RUNTIME_CONFIG.fallback_base();
    if let Some(fallback) = &fallback {
        info!("event='Unmatched requests go to {fallback}'");
    }

    let proxy = Proxy::new(RUNTIME_CONFIG.upstream_timeout(), RUNTIME_CONFIG.max_body_size)
        .map_err(|err| anyhow!("Could not build upstream client: {err}"))?;

    let gateway = Arc::new(Gateway {
        router,
        proxy,
        fallback,
    });

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|err| anyhow!("Could not listen on {addr}: {err}"))?;

    info!("event='Listening on http://{}'", addr);

    serve(listener, gateway).await
}
