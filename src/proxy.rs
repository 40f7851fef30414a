use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{HeaderName, HeaderValue, HOST};
use hyper::{HeaderMap, Request, Response};
use thiserror::Error;

const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),
    #[error("could not read request body: {0}")]
    Body(String),
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

/// Forwards requests to absolute destination URLs through a shared client.
pub struct Proxy {
    client: reqwest::Client,
    max_body_size: usize,
}

fn strip_hop_by_hop(headers: &mut HeaderMap<HeaderValue>) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

fn inject_forwarded_headers(
    headers: &mut HeaderMap<HeaderValue>,
    host: Option<HeaderValue>,
    client_addr: &SocketAddr,
) {
    let client_ip = client_addr.ip().to_string();
    let forwarded_for = match headers.get(X_FORWARDED_FOR).map(HeaderValue::to_str) {
        Some(Ok(previous)) => format!("{previous}, {client_ip}"),
        _ => client_ip,
    };
    if let Ok(value) = forwarded_for.parse() {
        headers.insert(HeaderName::from_static(X_FORWARDED_FOR), value);
    }

    if let Some(host) = host {
        headers.insert(HeaderName::from_static(X_FORWARDED_HOST), host);
    }
    headers.insert(
        HeaderName::from_static(X_FORWARDED_PROTO),
        HeaderValue::from_static("http"),
    );
}

impl Proxy {
    pub fn new(timeout: Duration, max_body_size: usize) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            max_body_size,
        })
    }

    /// Sends `req` to `destination` and returns the upstream response.
    ///
    /// The request body is buffered up to `max_body_size` bytes. Redirects
    /// are passed back to the client untouched.
    pub async fn forward<B>(
        &self,
        req: Request<B>,
        destination: &str,
        client_addr: &SocketAddr,
    ) -> Result<Response<Full<Bytes>>, ProxyError>
    where
        B: Body,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let (parts, body) = req.into_parts();

        let body = match Limited::new(body, self.max_body_size).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
                return Err(ProxyError::PayloadTooLarge(self.max_body_size));
            }
            Err(err) => return Err(ProxyError::Body(err.to_string())),
        };

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        let host = headers.remove(HOST);
        inject_forwarded_headers(&mut headers, host, client_addr);

        let upstream = self
            .client
            .request(parts.method, destination)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);
        let body = upstream.bytes().await?;

        let mut response = Response::new(Full::new(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;

        debug!("event='Upstream response received' uri='{destination}' status_code='{status}'");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_removed() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers["content-type"], "application/json");
    }

    #[test]
    fn forwarded_headers_are_set() {
        let mut headers = HeaderMap::new();
        let client_addr: SocketAddr = "10.0.0.7:51234".parse().unwrap();

        inject_forwarded_headers(
            &mut headers,
            Some(HeaderValue::from_static("frontend.local")),
            &client_addr,
        );

        assert_eq!(headers[X_FORWARDED_FOR], "10.0.0.7");
        assert_eq!(headers[X_FORWARDED_HOST], "frontend.local");
        assert_eq!(headers[X_FORWARDED_PROTO], "http");
    }

    #[test]
    fn forwarded_for_is_appended() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.9"));
        let client_addr: SocketAddr = "10.0.0.7:51234".parse().unwrap();

        inject_forwarded_headers(&mut headers, None, &client_addr);

        assert_eq!(headers[X_FORWARDED_FOR], "203.0.113.9, 10.0.0.7");
        assert!(headers.get(X_FORWARDED_HOST).is_none());
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let proxy = Proxy::new(Duration::from_secs(1), 4).unwrap();
        let req = Request::post("/api/medicine/upload")
            .body(Full::new(Bytes::from_static(b"too large")))
            .unwrap();
        let client_addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        let err = proxy
            .forward(req, "http://127.0.0.1:9/upload", &client_addr)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::PayloadTooLarge(4)));
    }
}
