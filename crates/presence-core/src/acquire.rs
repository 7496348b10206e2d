//! Reference image acquisition over HTTPS.
//!
//! A primary GET with 15 s / 30 s connect/read timeouts; if the TLS
//! handshake fails, exactly one retry through a fallback client with
//! relaxed timeouts, HTTP/1.1 only and `Connection: close`.

use image::DynamicImage;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONNECTION};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

const USER_AGENT: &str = concat!("presence/", env!("CARGO_PKG_VERSION"), " (face-verification)");
const ACCEPT_IMAGES: &str = "image/*";
const HTTP_OK: u16 = 200;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("unexpected HTTP status {0}")]
    HttpError(u16),
    #[error("image decode failed: {0}")]
    DecodeFailed(String),
    #[error("TLS handshake failed: {0}")]
    TlsFailure(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Which request strategy is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Primary,
    Fallback,
}

/// Client settings for one request strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchProfile {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub http1_only: bool,
    pub close_connection: bool,
}

impl FetchProfile {
    pub fn primary() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(30),
            http1_only: false,
            close_connection: false,
        }
    }

    pub fn fallback() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            read_timeout: Duration::from_secs(40),
            http1_only: true,
            close_connection: true,
        }
    }

    pub fn for_attempt(attempt: Attempt) -> Self {
        match attempt {
            Attempt::Primary => Self::primary(),
            Attempt::Fallback => Self::fallback(),
        }
    }
}

/// Raw HTTP response. `body` is only read for 200 responses.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Plain HTTP GET transport. Errors must be classified into
/// `Timeout`, `TlsFailure` or `Transport`.
pub trait HttpTransport: Send + Sync {
    fn get(
        &self,
        url: &str,
        attempt: Attempt,
    ) -> impl Future<Output = Result<HttpResponse, FetchError>> + Send;
}

/// Anything that can turn a URL into a decoded image.
pub trait ImageSource: Send + Sync {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<DynamicImage, FetchError>> + Send;
}

/// `reqwest`-backed transport with one pre-built client per strategy.
pub struct ReqwestTransport {
    primary: reqwest::Client,
    fallback: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, FetchError> {
        Ok(Self {
            primary: build_client(&FetchProfile::primary())?,
            fallback: build_client(&FetchProfile::fallback())?,
        })
    }
}

fn build_client(profile: &FetchProfile) -> Result<reqwest::Client, FetchError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_IMAGES));
    if profile.close_connection {
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
    }

    let mut builder = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .default_headers(headers)
        .connect_timeout(profile.connect_timeout)
        .read_timeout(profile.read_timeout);
    if profile.http1_only {
        builder = builder.http1_only();
    }

    builder
        .build()
        .map_err(|e| FetchError::Transport(format!("client build: {e}")))
}

impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str, attempt: Attempt) -> Result<HttpResponse, FetchError> {
        let client = match attempt {
            Attempt::Primary => &self.primary,
            Attempt::Fallback => &self.fallback,
        };

        let response = client.get(url).send().await.map_err(classify)?;
        let status = response.status().as_u16();
        if status != HTTP_OK {
            return Ok(HttpResponse { status, body: Vec::new() });
        }

        let body = response.bytes().await.map_err(classify)?;
        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        return FetchError::Timeout;
    }
    // The top-level message embeds the URL, so only the causes are inspected.
    if err.is_connect() && sources_mention_tls(&err) {
        FetchError::TlsFailure(error_chain(&err))
    } else {
        FetchError::Transport(error_chain(&err))
    }
}

/// Flatten an error and its sources into one line.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn sources_mention_tls(err: &dyn std::error::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if looks_like_tls(&cause.to_string()) {
            return true;
        }
        source = cause.source();
    }
    false
}

fn looks_like_tls(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["tls", "ssl", "handshake", "certificate"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Fetches and decodes reference images, with one TLS fallback attempt.
pub struct ImageAcquirer<T> {
    transport: T,
}

impl ImageAcquirer<ReqwestTransport> {
    pub fn with_reqwest() -> Result<Self, FetchError> {
        Ok(Self::new(ReqwestTransport::new()?))
    }
}

impl<T: HttpTransport> ImageAcquirer<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn fetch_image(&self, url: &str) -> Result<DynamicImage, FetchError> {
        let response = match self.transport.get(url, Attempt::Primary).await {
            Err(FetchError::TlsFailure(reason)) => {
                tracing::warn!(url, %reason, "TLS handshake failed; retrying with fallback client");
                self.transport.get(url, Attempt::Fallback).await?
            }
            other => other?,
        };

        if response.status != HTTP_OK {
            tracing::debug!(url, status = response.status, "reference image request rejected");
            return Err(FetchError::HttpError(response.status));
        }

        let image = image::load_from_memory(&response.body)
            .map_err(|e| FetchError::DecodeFailed(e.to_string()))?;
        tracing::info!(url, width = image.width(), height = image.height(), "fetched reference image");
        Ok(image)
    }
}

impl<T: HttpTransport> ImageSource for ImageAcquirer<T> {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<DynamicImage, FetchError>> + Send {
        self.fetch_image(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned responses and records which strategies were used.
    struct Scripted {
        responses: Mutex<VecDeque<Result<HttpResponse, FetchError>>>,
        attempts: Mutex<Vec<Attempt>>,
    }

    impl Scripted {
        fn new(responses: Vec<Result<HttpResponse, FetchError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                attempts: Mutex::new(Vec::new()),
            }
        }

        fn attempts(&self) -> Vec<Attempt> {
            self.attempts.lock().unwrap().clone()
        }
    }

    impl HttpTransport for Scripted {
        async fn get(&self, _url: &str, attempt: Attempt) -> Result<HttpResponse, FetchError> {
            self.attempts.lock().unwrap().push(attempt);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(FetchError::Transport("script exhausted".into())))
        }
    }

    fn png_bytes() -> Vec<u8> {
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 2, Rgb([9, 8, 7])))
            .write_to(&mut std::io::Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn ok(body: Vec<u8>) -> Result<HttpResponse, FetchError> {
        Ok(HttpResponse { status: 200, body })
    }

    fn tls() -> Result<HttpResponse, FetchError> {
        Err(FetchError::TlsFailure("handshake failure".into()))
    }

    #[tokio::test]
    async fn test_fetch_decodes_image() {
        let acquirer = ImageAcquirer::new(Scripted::new(vec![ok(png_bytes())]));
        let image = acquirer.fetch("https://example.test/a.png").await.unwrap();
        assert_eq!((image.width(), image.height()), (3, 2));
        assert_eq!(acquirer.transport().attempts(), vec![Attempt::Primary]);
    }

    #[tokio::test]
    async fn test_tls_failure_falls_back_exactly_once() {
        let acquirer = ImageAcquirer::new(Scripted::new(vec![tls(), tls(), ok(png_bytes())]));
        let err = acquirer.fetch("https://example.test/a.png").await.unwrap_err();
        assert!(matches!(err, FetchError::TlsFailure(_)));
        assert_eq!(
            acquirer.transport().attempts(),
            vec![Attempt::Primary, Attempt::Fallback]
        );
    }

    #[tokio::test]
    async fn test_tls_failure_then_fallback_succeeds() {
        let acquirer = ImageAcquirer::new(Scripted::new(vec![tls(), ok(png_bytes())]));
        assert!(acquirer.fetch("https://example.test/a.png").await.is_ok());
        assert_eq!(acquirer.transport().attempts().len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_does_not_fall_back() {
        let acquirer = ImageAcquirer::new(Scripted::new(vec![Err(FetchError::Timeout)]));
        assert_eq!(
            acquirer.fetch("https://example.test/a.png").await.unwrap_err(),
            FetchError::Timeout
        );
        assert_eq!(acquirer.transport().attempts(), vec![Attempt::Primary]);
    }

    #[tokio::test]
    async fn test_non_200_is_http_error() {
        let acquirer = ImageAcquirer::new(Scripted::new(vec![Ok(HttpResponse {
            status: 404,
            body: Vec::new(),
        })]));
        assert_eq!(
            acquirer.fetch("https://example.test/a.png").await.unwrap_err(),
            FetchError::HttpError(404)
        );
    }

    #[tokio::test]
    async fn test_undecodable_body() {
        let acquirer = ImageAcquirer::new(Scripted::new(vec![ok(b"<html>nope</html>".to_vec())]));
        assert!(matches!(
            acquirer.fetch("https://example.test/a.png").await,
            Err(FetchError::DecodeFailed(_))
        ));
    }

    /// Real transport that records the strategies it was asked to use.
    struct Recording {
        inner: ReqwestTransport,
        attempts: Mutex<Vec<Attempt>>,
    }

    impl HttpTransport for Recording {
        async fn get(&self, url: &str, attempt: Attempt) -> Result<HttpResponse, FetchError> {
            self.attempts.lock().unwrap().push(attempt);
            self.inner.get(url, attempt).await
        }
    }

    #[tokio::test]
    async fn test_refused_connection_on_tls_looking_url_is_transport() {
        let acquirer = ImageAcquirer::new(Recording {
            inner: ReqwestTransport::new().unwrap(),
            attempts: Mutex::new(Vec::new()),
        });
        for url in [
            "http://127.0.0.1:1/ssl/face.png",
            "http://127.0.0.1:1/certificates/tls-handshake.png",
        ] {
            let err = acquirer.fetch(url).await.unwrap_err();
            assert!(matches!(err, FetchError::Transport(_)), "{url}: {err:?}");
        }
        assert_eq!(
            acquirer.transport().attempts.lock().unwrap().clone(),
            vec![Attempt::Primary, Attempt::Primary]
        );
    }

    #[test]
    fn test_tls_keywords_ignore_top_level_message() {
        #[derive(Debug)]
        struct Wrapped(&'static str, Option<std::io::Error>);

        impl std::fmt::Display for Wrapped {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.0)
            }
        }

        impl std::error::Error for Wrapped {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                self.1.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
            }
        }

        let refused = Wrapped(
            "error sending request for url (https://ssl.example-cdn.test/face.png)",
            Some(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused")),
        );
        assert!(!sources_mention_tls(&refused));

        let handshake = Wrapped(
            "error sending request for url (https://cdn.example.test/face.png)",
            Some(std::io::Error::new(std::io::ErrorKind::Other, "received fatal alert: HandshakeFailure")),
        );
        assert!(sources_mention_tls(&handshake));
    }

    #[test]
    fn test_profiles() {
        let primary = FetchProfile::for_attempt(Attempt::Primary);
        assert_eq!(primary.connect_timeout, Duration::from_secs(15));
        assert_eq!(primary.read_timeout, Duration::from_secs(30));
        let fallback = FetchProfile::for_attempt(Attempt::Fallback);
        assert_eq!(fallback.connect_timeout, Duration::from_secs(20));
        assert_eq!(fallback.read_timeout, Duration::from_secs(40));
        assert!(fallback.http1_only && fallback.close_connection);
    }

    #[test]
    fn test_tls_classification() {
        assert!(looks_like_tls("error trying to connect: received fatal alert: HandshakeFailure"));
        assert!(looks_like_tls("invalid peer certificate: UnknownIssuer"));
        assert!(looks_like_tls("SSL routines::wrong version number"));
        assert!(!looks_like_tls("dns error: failed to lookup address"));
    }

    #[test]
    fn test_user_agent_is_descriptive() {
        assert!(USER_AGENT.starts_with("presence/"));
        assert!(USER_AGENT.contains("face-verification"));
    }
}
