use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tokio::time;
use url::Url;

type Client = HyperClient<HttpsConnector<HttpConnector>, Empty<Bytes>>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid request target: {0}")]
    Uri(#[from] hyper::http::uri::InvalidUri),
    #[error("failed to build request: {0}")]
    Build(#[from] hyper::http::Error),
    #[error("request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),
    #[error("response body failed: {0}")]
    Body(#[from] hyper::Error),
}

/// Outcome of one completed GET.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fetched {
    pub status: StatusCode,
    /// Body bytes read and discarded.
    pub bytes: u64,
}

/// Performs a single GET against a target and drains the response.
///
/// Implementations must be cancel safe: workers drop the future as soon as a
/// stop is signalled, which is how an in-progress drain is aborted.
pub trait Transport: Send + Sync + 'static {
    fn fetch(&self, target: &Url) -> impl Future<Output = Result<Fetched, TransportError>> + Send;
}

/// hyper client shared by every worker of a session.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    timeout: Duration,
}

impl HttpTransport {
    /// `timeout` bounds the wait for the response head and for each body frame.
    pub fn new(timeout: Duration) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(timeout));
        let https = HttpsConnector::new_with_connector(http);
        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build(https);

        HttpTransport { client, timeout }
    }
}

impl Transport for HttpTransport {
    async fn fetch(&self, target: &Url) -> Result<Fetched, TransportError> {
        let uri = target.as_str().parse::<Uri>()?;
        let req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Empty::<Bytes>::new())?;

        let resp = time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))??;

        let status = resp.status();
        let mut body = resp.into_body();
        let mut bytes = 0u64;
        loop {
            let frame = time::timeout(self.timeout, body.frame())
                .await
                .map_err(|_| TransportError::Timeout(self.timeout))?;
            match frame {
                Some(frame) => {
                    if let Some(data) = frame?.data_ref() {
                        bytes += data.len() as u64;
                    }
                }
                None => break,
            }
        }

        Ok(Fetched { status, bytes })
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    async fn serve_once(response: &'static [u8]) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        Url::parse(&format!("http://{addr}/")).unwrap()
    }

    #[tokio::test]
    async fn drains_body_and_counts_bytes() {
        let url = serve_once(
            b"HTTP/1.1 200 OK\r\ncontent-length: 11\r\nconnection: close\r\n\r\nhello world",
        )
        .await;
        let fetched = HttpTransport::new(Duration::from_secs(2)).fetch(&url).await.unwrap();
        assert_eq!(fetched.status, StatusCode::OK);
        assert_eq!(fetched.bytes, 11);
    }

    #[tokio::test]
    async fn error_status_is_still_a_completed_request() {
        let url = serve_once(
            b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        let fetched = HttpTransport::new(Duration::from_secs(2)).fetch(&url).await.unwrap();
        assert_eq!(fetched.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(fetched.bytes, 0);
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            time::sleep(Duration::from_secs(5)).await;
        });
        let url = Url::parse(&format!("http://{addr}/")).unwrap();
        let err = HttpTransport::new(Duration::from_millis(100))
            .fetch(&url)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)), "{err}");
    }

    #[tokio::test]
    async fn refused_connection_is_a_request_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let url = Url::parse(&format!("http://{addr}/")).unwrap();
        let err = HttpTransport::new(Duration::from_secs(2))
            .fetch(&url)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Request(_)), "{err}");
    }
}
