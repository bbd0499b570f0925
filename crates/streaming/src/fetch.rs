use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::FetchError;
use crate::request::DataKind;
use crate::store::BoxFuture;

/// Raw network access for the coordinator. One call is one attempt; retries
/// are the coordinator's job.
pub trait Fetcher: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a str, kind: DataKind) -> BoxFuture<'a, Result<Bytes, FetchError>>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("heatmap-streaming/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn map_reqwest(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transport(e.to_string())
    }
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(&'a self, url: &'a str, kind: DataKind) -> BoxFuture<'a, Result<Bytes, FetchError>> {
        Box::pin(async move {
            let resp = self
                .client
                .get(url)
                .header(reqwest::header::ACCEPT, kind.accept_header())
                .send()
                .await
                .map_err(map_reqwest)?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::Status(status.as_u16()));
            }
            resp.bytes().await.map_err(map_reqwest)
        })
    }
}

#[derive(Debug, Clone)]
struct Route {
    scripted: VecDeque<Result<Bytes, FetchError>>,
    fallback: Result<Bytes, FetchError>,
    delay: Duration,
}

impl Route {
    fn new(fallback: Result<Bytes, FetchError>) -> Self {
        Self {
            scripted: VecDeque::new(),
            fallback,
            delay: Duration::ZERO,
        }
    }
}

/// In-memory fetcher with per-URL canned responses, used for offline
/// sessions and tests. Unknown URLs answer 404.
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<Vec<String>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_json(&self, url: impl Into<String>, body: &serde_json::Value) {
        let bytes = Bytes::from(body.to_string());
        self.routes
            .lock()
            .entry(url.into())
            .and_modify(|r| r.fallback = Ok(bytes.clone()))
            .or_insert_with(|| Route::new(Ok(bytes)));
    }

    pub fn insert_error(&self, url: impl Into<String>, err: FetchError) {
        self.routes
            .lock()
            .entry(url.into())
            .and_modify(|r| r.fallback = Err(err.clone()))
            .or_insert_with(|| Route::new(Err(err)));
    }

    /// One-shot response served before the route's steady response.
    pub fn push_response(&self, url: impl Into<String>, response: Result<Bytes, FetchError>) {
        self.routes
            .lock()
            .entry(url.into())
            .or_insert_with(|| Route::new(Err(FetchError::Status(404))))
            .scripted
            .push_back(response);
    }

    pub fn set_delay(&self, url: impl Into<String>, delay: Duration) {
        self.routes
            .lock()
            .entry(url.into())
            .or_insert_with(|| Route::new(Err(FetchError::Status(404))))
            .delay = delay;
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().iter().filter(|u| *u == url).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn call_log(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl Fetcher for MemoryFetcher {
    fn fetch<'a>(&'a self, url: &'a str, _kind: DataKind) -> BoxFuture<'a, Result<Bytes, FetchError>> {
        Box::pin(async move {
            self.calls.lock().push(url.to_string());
            let (response, delay) = match self.routes.lock().get_mut(url) {
                Some(route) => {
                    let response = route
                        .scripted
                        .pop_front()
                        .unwrap_or_else(|| route.fallback.clone());
                    (response, route.delay)
                }
                None => (Err(FetchError::Status(404)), Duration::ZERO),
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            response
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::json;

    use super::{Fetcher, MemoryFetcher};
    use crate::error::FetchError;
    use crate::request::DataKind;

    #[tokio::test]
    async fn scripted_responses_run_before_fallback() {
        let f = MemoryFetcher::new();
        f.insert_json("http://x/a", &json!({"ok": true}));
        f.push_response("http://x/a", Err(FetchError::Status(503)));

        assert_eq!(
            f.fetch("http://x/a", DataKind::GeoJson).await,
            Err(FetchError::Status(503))
        );
        assert_eq!(
            f.fetch("http://x/a", DataKind::GeoJson).await,
            Ok(Bytes::from(r#"{"ok":true}"#))
        );
        assert_eq!(f.calls("http://x/a"), 2);
    }

    #[tokio::test]
    async fn unknown_urls_are_not_found() {
        let f = MemoryFetcher::new();
        assert_eq!(
            f.fetch("http://x/missing", DataKind::Tile).await,
            Err(FetchError::Status(404))
        );
    }
}
