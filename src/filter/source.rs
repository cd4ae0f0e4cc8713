//! Where the text of rule lists comes from.

use core::fmt;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

#[cfg(feature = "http")]
pub use self::http::HttpRuleSource;

//------------ RuleSource ----------------------------------------------------

/// Provides the text of a rule list.
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// Returns the current text of the rule list.
    ///
    /// If `accept_stale` is true, the source may return a cached copy
    /// regardless of its age instead of fetching a new one.
    async fn fetch(&self, accept_stale: bool) -> Result<String, FetchError>;
}

//------------ TextSource ----------------------------------------------------

/// A rule source holding the rule text in memory.
///
/// The text can be replaced at any time. The change becomes visible to a
/// filter with its next refresh.
#[derive(Debug, Default)]
pub struct TextSource {
    text: RwLock<Arc<str>>,
}

impl TextSource {
    /// Creates a source with the given text.
    pub fn new(text: &str) -> Self {
        TextSource {
            text: RwLock::new(text.into()),
        }
    }

    /// Replaces the text.
    pub fn set(&self, text: &str) {
        *self.text.write() = text.into();
    }
}

#[async_trait]
impl RuleSource for TextSource {
    async fn fetch(&self, _accept_stale: bool) -> Result<String, FetchError> {
        Ok(self.text.read().as_ref().into())
    }
}

//------------ HttpRuleSource ------------------------------------------------

#[cfg(feature = "http")]
mod http {
    use std::io;
    use std::path::{Path, PathBuf};
    use std::time::{Duration, SystemTime};

    use async_trait::async_trait;
    use tracing::{debug, warn};
    use url::Url;

    use super::{FetchError, RuleSource};
    use crate::config::FilterConfig;

    /// A rule list downloaded over HTTP and cached on disk.
    ///
    /// The cached copy is used as long as it is younger than the configured
    /// staleness. If downloading fails, an existing cached copy is used
    /// regardless of its age.
    #[derive(Debug)]
    pub struct HttpRuleSource {
        url: Url,
        cache_path: PathBuf,
        max_size: u64,
        staleness: Duration,
        client: reqwest::Client,
    }

    impl HttpRuleSource {
        /// Creates a new source.
        ///
        /// Only `http` and `https` URLs are accepted.
        pub fn new(
            url: Url,
            cache_path: impl Into<PathBuf>,
            config: &FilterConfig,
        ) -> Result<Self, FetchError> {
            if !matches!(url.scheme(), "http" | "https") {
                return Err(FetchError::BadScheme(url.scheme().into()));
            }
            let client = reqwest::Client::builder()
                .build()
                .map_err(FetchError::Http)?;
            Ok(HttpRuleSource {
                url,
                cache_path: cache_path.into(),
                max_size: config.max_size(),
                staleness: config.staleness(),
                client,
            })
        }

        /// Returns the path of the cached copy.
        pub fn cache_path(&self) -> &Path {
            &self.cache_path
        }

        /// Returns the age of the cached copy if there is one.
        async fn cache_age(&self) -> Option<Duration> {
            let modified = tokio::fs::metadata(&self.cache_path)
                .await
                .and_then(|meta| meta.modified())
                .ok()?;
            Some(
                SystemTime::now()
                    .duration_since(modified)
                    .unwrap_or(Duration::ZERO),
            )
        }

        async fn read_cache(&self) -> Result<String, FetchError> {
            Ok(tokio::fs::read_to_string(&self.cache_path).await?)
        }

        /// Replaces the cached copy.
        ///
        /// The text is written to a temporary file first which is then
        /// renamed, so readers never see a partial file.
        async fn write_cache(&self, text: &str) -> Result<(), io::Error> {
            let mut tmp = self.cache_path.clone().into_os_string();
            tmp.push(".tmp");
            tokio::fs::write(&tmp, text).await?;
            tokio::fs::rename(&tmp, &self.cache_path).await
        }

        async fn download(&self) -> Result<String, FetchError> {
            let mut resp = self
                .client
                .get(self.url.clone())
                .send()
                .await
                .map_err(FetchError::Http)?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::Status(status.as_u16()));
            }
            if resp.content_length().is_some_and(|len| len > self.max_size) {
                return Err(FetchError::TooLarge(self.max_size));
            }
            let mut body = Vec::new();
            while let Some(chunk) = resp.chunk().await.map_err(FetchError::Http)?
            {
                if (body.len() + chunk.len()) as u64 > self.max_size {
                    return Err(FetchError::TooLarge(self.max_size));
                }
                body.extend_from_slice(&chunk);
            }
            String::from_utf8(body).map_err(|_| FetchError::NotUtf8)
        }
    }

    #[async_trait]
    impl RuleSource for HttpRuleSource {
        async fn fetch(&self, accept_stale: bool) -> Result<String, FetchError> {
            let age = self.cache_age().await;
            if let Some(age) = age {
                if accept_stale || age < self.staleness {
                    debug!(
                        path = %self.cache_path.display(),
                        ?age,
                        "using cached rule list"
                    );
                    return self.read_cache().await;
                }
            }

            match self.download().await {
                Ok(text) => {
                    debug!(url = %self.url, len = text.len(), "downloaded rule list");
                    if let Err(err) = self.write_cache(&text).await {
                        warn!(
                            path = %self.cache_path.display(),
                            "caching rule list: {err}"
                        );
                    }
                    Ok(text)
                }
                Err(err) if age.is_some() => {
                    warn!(url = %self.url, "{err}; using stale cached copy");
                    self.read_cache().await
                }
                Err(err) => Err(err),
            }
        }
    }
}

//------------ FetchError ----------------------------------------------------

/// A rule list could not be fetched.
#[derive(Debug)]
pub enum FetchError {
    /// The URL has a scheme other than `http` or `https`.
    BadScheme(String),

    /// The HTTP request failed.
    #[cfg(feature = "http")]
    Http(reqwest::Error),

    /// The server responded with a non-success status.
    Status(u16),

    /// The rule list is larger than the given number of bytes.
    TooLarge(u64),

    /// The rule list is not valid UTF-8.
    NotUtf8,

    /// Reading the cached copy failed.
    Io(std::io::Error),
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        FetchError::Io(err)
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::BadScheme(scheme) => {
                write!(f, "unsupported URL scheme {scheme:?}")
            }
            #[cfg(feature = "http")]
            FetchError::Http(err) => write!(f, "http request: {err}"),
            FetchError::Status(status) => write!(f, "http status {status}"),
            FetchError::TooLarge(max) => {
                write!(f, "rule list larger than {max} bytes")
            }
            FetchError::NotUtf8 => f.write_str("rule list is not UTF-8"),
            FetchError::Io(err) => write!(f, "cached rule list: {err}"),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            #[cfg(feature = "http")]
            FetchError::Http(err) => Some(err),
            FetchError::Io(err) => Some(err),
            _ => None,
        }
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn text_source() {
        let source = TextSource::new("||a.example^");
        assert_eq!(source.fetch(false).await.unwrap(), "||a.example^");
        source.set("||b.example^");
        assert_eq!(source.fetch(true).await.unwrap(), "||b.example^");
    }

    #[cfg(feature = "http")]
    mod http {
        use super::super::*;
        use crate::config::FilterConfig;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::Duration;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;
        use url::Url;

        /// Serves `status` and `body` to every request and counts them.
        async fn serve(
            status: &'static str,
            body: impl Into<String>,
        ) -> (Url, Arc<AtomicUsize>) {
            let body: Arc<str> = body.into().into();
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let hits = Arc::new(AtomicUsize::new(0));
            let counter = hits.clone();
            tokio::spawn(async move {
                loop {
                    let (mut sock, _) = match listener.accept().await {
                        Ok(conn) => conn,
                        Err(_) => return,
                    };
                    counter.fetch_add(1, Ordering::SeqCst);
                    let mut buf = vec![0u8; 4096];
                    let mut read = 0;
                    while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        match sock.read(&mut buf[read..]).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => read += n,
                        }
                    }
                    let resp = format!(
                        "HTTP/1.1 {status}\r\nContent-Length: {}\r\n\
                         Connection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = sock.write_all(resp.as_bytes()).await;
                    let _ = sock.shutdown().await;
                }
            });
            let url = format!("http://{addr}/list.txt").parse().unwrap();
            (url, hits)
        }

        fn config() -> FilterConfig {
            let mut config = FilterConfig::new();
            config.set_staleness(Duration::from_secs(3600));
            config
        }

        #[test]
        fn rejects_file_urls() {
            let url: Url = "file:///etc/hosts".parse().unwrap();
            assert!(matches!(
                HttpRuleSource::new(url, "/tmp/x", &config()),
                Err(FetchError::BadScheme(_))
            ));
        }

        #[tokio::test]
        async fn downloads_and_caches() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("list.txt");
            let (url, hits) = serve("200 OK", "||ads.example^\n").await;
            let source = HttpRuleSource::new(url, &path, &config()).unwrap();

            assert_eq!(source.fetch(false).await.unwrap(), "||ads.example^\n");
            assert_eq!(
                std::fs::read_to_string(&path).unwrap(),
                "||ads.example^\n"
            );

            // The fresh cached copy is used without a request.
            assert_eq!(source.fetch(false).await.unwrap(), "||ads.example^\n");
            assert_eq!(hits.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn stale_cache_fallback() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("list.txt");
            std::fs::write(&path, "||cached.example^\n").unwrap();
            let old = std::time::SystemTime::now() - Duration::from_secs(7200);
            std::fs::File::options()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(old)
                .unwrap();

            let (url, hits) = serve("500 Internal Server Error", "").await;
            let source = HttpRuleSource::new(url, &path, &config()).unwrap();

            // Accepting stale data avoids the request entirely.
            assert_eq!(
                source.fetch(true).await.unwrap(),
                "||cached.example^\n"
            );
            assert_eq!(hits.load(Ordering::SeqCst), 0);

            // A failed download falls back to the stale copy.
            assert_eq!(
                source.fetch(false).await.unwrap(),
                "||cached.example^\n"
            );
            assert_eq!(hits.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn errors_without_cache() {
            let dir = tempfile::tempdir().unwrap();
            let (url, _) = serve("404 Not Found", "").await;
            let source =
                HttpRuleSource::new(url, dir.path().join("a"), &config())
                    .unwrap();
            assert!(matches!(
                source.fetch(false).await,
                Err(FetchError::Status(404))
            ));

            // The smallest possible ceiling is 1 KiB.
            let (url, _) = serve("200 OK", "x".repeat(2048)).await;
            let mut config = config();
            config.set_max_size(0);
            let source =
                HttpRuleSource::new(url, dir.path().join("b"), &config)
                    .unwrap();
            assert!(matches!(
                source.fetch(false).await,
                Err(FetchError::TooLarge(1024))
            ));
            assert!(!dir.path().join("b").exists());
        }
    }
}
