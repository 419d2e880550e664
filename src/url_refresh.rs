use async_trait::async_trait;

/// Single-method capability for refreshing a short-lived upstream URL before the
/// worker is restarted. Modeled as one method rather than an inheritance
/// hierarchy: callers that don't need refresh (stable URLs) implement it as a
/// no-op.
#[async_trait]
pub trait UrlRefresh: Send + Sync {
    /// Returns a fresh `(source_url, request_headers)` pair for `content_key`,
    /// or `None` to keep using the existing URL (e.g. refresh failed, or this
    /// source never expires).
    async fn refresh(&self, content_key: &str) -> Option<(String, Option<String>)>;
}

/// Refresher for sources whose URLs never expire.
pub struct NoopUrlRefresh;

#[async_trait]
impl UrlRefresh for NoopUrlRefresh {
    async fn refresh(&self, _content_key: &str) -> Option<(String, Option<String>)> {
        None
    }
}
