use std::collections::HashSet;

use axum::http::{header::AUTHORIZATION, HeaderMap};

/// Bearer token check shared by every protected route.
#[derive(Clone)]
pub(crate) struct AuthManager {
    tokens: HashSet<String>,
}

impl AuthManager {
    pub(crate) fn new(tokens: HashSet<String>) -> Self {
        Self { tokens }
    }

    /// Accepts an `Authorization: Bearer` header, or the `token` query value that
    /// browser event streams have to fall back on.
    pub(crate) fn authorize(&self, headers: &HeaderMap, query_token: Option<&str>) -> bool {
        let from_header = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .and_then(|raw| {
                raw.strip_prefix("Bearer ")
                    .or_else(|| raw.strip_prefix("bearer "))
            })
            .map(str::trim);

        from_header
            .or(query_token)
            .is_some_and(|token| self.tokens.contains(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn manager() -> AuthManager {
        AuthManager::new(HashSet::from(["s3cret".to_string()]))
    }

    #[test]
    fn bearer_header_is_checked() {
        let mut headers = HeaderMap::new();
        assert!(!manager().authorize(&headers, None));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));
        assert!(manager().authorize(&headers, None));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer wrong"));
        assert!(!manager().authorize(&headers, None));
    }

    #[test]
    fn query_token_is_accepted_without_header() {
        assert!(manager().authorize(&HeaderMap::new(), Some("s3cret")));
        assert!(!manager().authorize(&HeaderMap::new(), Some("other")));
    }
}
