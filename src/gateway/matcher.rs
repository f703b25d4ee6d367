//! Upgrade request matching

use std::fmt;
use std::sync::Arc;

use crate::server::UpgradeRequest;

/// Caller-supplied predicate over upgrade requests
pub type MatchFn = Arc<dyn Fn(&UpgradeRequest) -> bool + Send + Sync>;

/// Decides whether a registration claims an upgrade request
///
/// A request is claimed when the configured path equals the request path, or
/// when the predicate accepts it. With neither configured nothing is claimed.
#[derive(Clone, Default)]
pub struct UpgradeMatcher {
    path: Option<String>,
    predicate: Option<MatchFn>,
}

impl fmt::Debug for UpgradeMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeMatcher")
            .field("path", &self.path)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl UpgradeMatcher {
    /// Create a matcher from an optional path and predicate
    pub fn new(path: Option<String>, predicate: Option<MatchFn>) -> Self {
        Self { path, predicate }
    }

    /// Match an exact request path
    pub fn path(path: impl Into<String>) -> Self {
        Self::new(Some(path.into()), None)
    }

    /// Match with a predicate
    pub fn predicate(predicate: impl Fn(&UpgradeRequest) -> bool + Send + Sync + 'static) -> Self {
        Self::new(None, Some(Arc::new(predicate)))
    }

    /// Whether this matcher claims `request`
    pub fn claims(&self, request: &UpgradeRequest) -> bool {
        if let Some(path) = &self.path {
            if request.path().as_deref() == Some(path.as_str()) {
                return true;
            }
        }
        self.predicate
            .as_ref()
            .map(|predicate| predicate(request))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::http::HeaderMap;

    fn request(target: &str) -> UpgradeRequest {
        UpgradeRequest::new("GET", target, HeaderMap::new())
    }

    #[test]
    fn test_path_match_ignores_query_and_fragment() {
        let matcher = UpgradeMatcher::path("/rpc");
        assert!(matcher.claims(&request("/rpc")));
        assert!(matcher.claims(&request("/rpc?x=1")));
        assert!(matcher.claims(&request("/rpc#top")));
        assert!(!matcher.claims(&request("/other")));
        assert!(!matcher.claims(&request("/rpc/")));
        assert!(!matcher.claims(&request("/rpc/nested")));
    }

    #[test]
    fn test_predicate_match() {
        let matcher = UpgradeMatcher::predicate(|req| req.target().starts_with("/services/"));
        assert!(matcher.claims(&request("/services/fs")));
        assert!(!matcher.claims(&request("/other")));
    }

    #[test]
    fn test_malformed_target_falls_through_to_predicate() {
        let matcher = UpgradeMatcher::new(
            Some("/rpc".to_string()),
            Some(Arc::new(|req: &UpgradeRequest| req.target().contains("rpc"))),
        );
        // No path can be derived, so only the predicate can claim it
        assert!(matcher.claims(&request("/bad rpc")));

        let path_only = UpgradeMatcher::path("/rpc");
        assert!(!path_only.claims(&request("/bad rpc")));
    }

    #[test]
    fn test_nothing_configured_claims_nothing() {
        let matcher = UpgradeMatcher::default();
        assert!(!matcher.claims(&request("/")));
        assert!(!matcher.claims(&request("/rpc")));
    }
}
