//! Credential cache and the fetcher that refreshes it through the tunnel.
//!
//! The cache is a single byte buffer behind a mutex. A refresh pulls while
//! holding that mutex and hands the same guard back to the caller, so a read
//! that follows a refresh happens in one critical section and can never see
//! another refresh's bytes.

use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use crate::tunnel::TunnelWatch;

/// Upper bound on one pull through the tunnel.
const PULL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("tunnel unavailable: {0}")]
    Tunnel(String),
    #[error("pull request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("endpoint answered {0}")]
    Status(reqwest::StatusCode),
    #[error("malformed payload: {0}")]
    Decode(String),
}

/// Body exchanged with the remote endpoint: `{"contents": "<base64>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(with = "base64_bytes")]
    pub contents: Vec<u8>,
}

impl Payload {
    pub fn new(contents: Vec<u8>) -> Self {
        Payload { contents }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(body: &[u8]) -> Result<Self, FetchError> {
        serde_json::from_slice(body).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

mod base64_bytes {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Anything able to produce the current credential bytes.
///
/// Called from kernel dispatch threads, so implementations block.
pub trait TokenSource: Send + Sync {
    fn fetch(&self) -> Result<Vec<u8>, FetchError>;
}

/// Pulls the credential over HTTP from the local end of the tunnel.
pub struct TunnelFetcher {
    runtime: Handle,
    client: reqwest::Client,
    url: String,
    tunnel: TunnelWatch,
}

impl TunnelFetcher {
    pub fn new(
        runtime: Handle,
        local_addr: SocketAddr,
        tunnel: TunnelWatch,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(PULL_TIMEOUT)
            .no_proxy()
            .build()?;
        Ok(TunnelFetcher {
            runtime,
            client,
            url: format!("http://{local_addr}/"),
            tunnel,
        })
    }

    async fn pull(&self) -> Result<Vec<u8>, FetchError> {
        // The first pull must not race the forward's setup, and nothing is
        // pulled once the tunnel is gone.
        self.tunnel.ready().await.map_err(FetchError::Tunnel)?;

        let resp = self.client.get(&self.url).send().await?;
        if !resp.status().is_success() {
            return Err(FetchError::Status(resp.status()));
        }
        let body = resp.bytes().await?;
        Ok(Payload::decode(&body)?.contents)
    }
}

impl TokenSource for TunnelFetcher {
    fn fetch(&self) -> Result<Vec<u8>, FetchError> {
        self.runtime.block_on(self.pull())
    }
}

/// The single cached credential plus the source that refreshes it.
pub struct TokenCache<S> {
    contents: Mutex<Vec<u8>>,
    source: S,
}

impl<S: TokenSource> TokenCache<S> {
    pub fn new(source: S) -> Self {
        TokenCache {
            contents: Mutex::new(Vec::new()),
            source,
        }
    }

    /// Pulls a fresh credential and returns the guard holding it.
    ///
    /// On failure the previous contents are left untouched.
    pub fn refresh(&self) -> Result<MutexGuard<'_, Vec<u8>>, FetchError> {
        let mut contents = self.lock();
        let fresh = self.source.fetch()?;
        *contents = fresh;
        Ok(contents)
    }

    /// Current contents without pulling.
    pub fn current(&self) -> MutexGuard<'_, Vec<u8>> {
        self.lock()
    }

    #[cfg(test)]
    pub(crate) fn source(&self) -> &S {
        &self.source
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        // A panic mid-refresh never leaves a partial buffer behind, since the
        // buffer is only ever replaced whole.
        self.contents.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use crate::tunnel::{TunnelStatus, status_channel};

    /// Replays queued results in order.
    pub(crate) struct ScriptedSource {
        script: Mutex<VecDeque<Result<Vec<u8>, FetchError>>>,
        pub(crate) calls: AtomicUsize,
    }

    impl ScriptedSource {
        pub(crate) fn new(script: Vec<Result<Vec<u8>, FetchError>>) -> Self {
            ScriptedSource {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl TokenSource for ScriptedSource {
        fn fetch(&self) -> Result<Vec<u8>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            match script.pop_front() {
                Some(next) => next,
                None => Err(FetchError::Decode("script exhausted".into())),
            }
        }
    }

    /// Alternates between two equally sized buffers of a single repeated byte.
    struct Alternating {
        calls: AtomicUsize,
    }

    impl TokenSource for Alternating {
        fn fetch(&self) -> Result<Vec<u8>, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let byte = if n % 2 == 0 { b'a' } else { b'b' };
            thread::yield_now();
            Ok(vec![byte; 8192])
        }
    }

    #[test]
    fn decodes_go_style_payload() {
        let payload = Payload::decode(br#"{"contents":"YWJjMTIz"}"#).unwrap();
        assert_eq!(payload.contents, b"abc123");
    }

    #[test]
    fn encode_matches_wire_format() {
        let body = Payload::new(b"xyz789".to_vec()).encode().unwrap();
        assert_eq!(body, br#"{"contents":"eHl6Nzg5"}"#);
    }

    #[test]
    fn rejects_malformed_payloads() {
        let bodies: [&[u8]; 4] = [
            br#"{"contents":"YWJj"#,
            br#"{}"#,
            br#"{"contents":"not base64!"}"#,
            b"",
        ];
        for body in bodies {
            assert!(
                matches!(Payload::decode(body), Err(FetchError::Decode(_))),
                "accepted {:?}",
                String::from_utf8_lossy(body)
            );
        }
    }

    #[test]
    fn refresh_replaces_contents() {
        let cache = TokenCache::new(ScriptedSource::new(vec![
            Ok(b"abc123".to_vec()),
            Ok(b"xyz789".to_vec()),
        ]));
        assert!(cache.current().is_empty());
        assert_eq!(*cache.refresh().unwrap(), b"abc123");
        assert_eq!(*cache.refresh().unwrap(), b"xyz789");
        assert_eq!(*cache.current(), b"xyz789");
    }

    #[test]
    fn failed_refresh_keeps_previous_value() {
        let cache = TokenCache::new(ScriptedSource::new(vec![
            Ok(b"abc123".to_vec()),
            Err(FetchError::Decode("unexpected end of input".into())),
        ]));
        drop(cache.refresh().unwrap());
        assert!(matches!(cache.refresh(), Err(FetchError::Decode(_))));
        assert_eq!(*cache.current(), b"abc123");
    }

    #[test]
    fn concurrent_refreshes_never_tear() {
        let cache = Arc::new(TokenCache::new(Alternating {
            calls: AtomicUsize::new(0),
        }));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let contents = cache.refresh().unwrap();
                        let first = contents[0];
                        assert!(contents.iter().all(|&b| b == first));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn fetcher_pulls_rotated_token_from_endpoint() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, b"abc123").unwrap();

        let addr = runtime.block_on(async {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let app = crate::server::router(path.clone());
            tokio::spawn(async move { axum::serve(listener, app).await });
            addr
        });

        let (status, watch) = status_channel();
        let fetcher = TunnelFetcher::new(runtime.handle().clone(), addr, watch).unwrap();
        let cache = Arc::new(TokenCache::new(fetcher));

        // The first pull waits for the tunnel to come up.
        let early = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.refresh().map(|c| c.clone()))
        };
        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!early.is_finished());
        status.send_replace(TunnelStatus::Ready);
        assert_eq!(early.join().unwrap().unwrap(), b"abc123");

        std::fs::write(&path, b"xyz789").unwrap();
        assert_eq!(*cache.refresh().unwrap(), b"xyz789");

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(cache.refresh(), Err(FetchError::Status(_))));
        assert_eq!(*cache.current(), b"xyz789");
    }

    #[test]
    fn fetcher_fails_fast_once_tunnel_is_gone() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (status, watch) = status_channel();
        status.send_replace(TunnelStatus::Failed("connection reset".into()));

        let fetcher =
            TunnelFetcher::new(runtime.handle().clone(), "127.0.0.1:9".parse().unwrap(), watch)
                .unwrap();
        match fetcher.fetch() {
            Err(FetchError::Tunnel(msg)) => assert!(msg.contains("connection reset")),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
