//! HTTP producers for `fetch(url)` cells.

use futures::future::BoxFuture;
use serde_json::Value;

use crate::cell::CellError;

/// Source of JSON documents for `fetch` cells.
pub trait Fetcher: Send + Sync + 'static {
    /// Retrieve and decode the JSON document at `url`.
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<Value, CellError>>;
}

/// [`Fetcher`] backed by `reqwest`.
///
/// Relative URLs such as `/items` are resolved against `base_url`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl HttpFetcher {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    /// Absolute URL for a request.
    pub fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            return url.to_string();
        }
        match &self.base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), url.trim_start_matches('/')),
            None => url.to_string(),
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<Value, CellError>> {
        let client = self.client.clone();
        let requested = url.to_string();
        let target = self.resolve(url);
        Box::pin(async move {
            let failed = |e: reqwest::Error| CellError::Fetch {
                url: requested.clone(),
                message: e.to_string(),
            };
            tracing::debug!(url = %target, "fetching");
            let response = client
                .get(&target)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(failed)?;
            response.json::<Value>().await.map_err(failed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative() {
        let fetcher = HttpFetcher::new(Some("http://127.0.0.1:3000/".into()));
        assert_eq!(fetcher.resolve("/items"), "http://127.0.0.1:3000/items");
        assert_eq!(fetcher.resolve("items2"), "http://127.0.0.1:3000/items2");
    }

    #[test]
    fn test_resolve_absolute_is_untouched() {
        let fetcher = HttpFetcher::new(Some("http://127.0.0.1:3000".into()));
        assert_eq!(
            fetcher.resolve("https://example.com/x"),
            "https://example.com/x"
        );
    }

    #[test]
    fn test_resolve_without_base() {
        let fetcher = HttpFetcher::new(None);
        assert_eq!(fetcher.resolve("/items"), "/items");
    }
}
