use phasegate_core::config::GatewayConfig;

/// Check a request's credentials against `gateway.token`.
///
/// With no token configured every request passes. Otherwise the bearer
/// header must match, or the `?token=` query parameter when no header was
/// sent (for scrapers that cannot set headers).
pub fn is_authorized(config: &GatewayConfig, bearer: Option<&str>, query_token: Option<&str>) -> bool {
    let Some(expected) = config.token.as_deref() else {
        return true;
    };
    match bearer {
        Some(presented) => constant_time_eq(presented.as_bytes(), expected.as_bytes()),
        None => query_token
            .is_some_and(|presented| constant_time_eq(presented.as_bytes(), expected.as_bytes())),
    }
}

/// Extract token from the query string (?token=...).
pub fn extract_token_from_query(query: &str) -> Option<&str> {
    query.split('&').find_map(|pair| pair.strip_prefix("token="))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(token: Option<&str>) -> GatewayConfig {
        GatewayConfig {
            bind: "127.0.0.1:18790".to_string(),
            token: token.map(|s| s.to_string()),
        }
    }

    #[test]
    fn test_no_token_always_passes() {
        let config = gateway(None);
        assert!(is_authorized(&config, None, None));
        assert!(is_authorized(&config, Some("anything"), None));
    }

    #[test]
    fn test_bearer_token() {
        let config = gateway(Some("secret"));
        assert!(!is_authorized(&config, None, None));
        assert!(!is_authorized(&config, Some("wrong"), None));
        assert!(!is_authorized(&config, Some("secre"), None));
        assert!(is_authorized(&config, Some("secret"), None));
    }

    #[test]
    fn test_query_token_only_without_header() {
        let config = gateway(Some("secret"));
        assert!(is_authorized(&config, None, Some("secret")));
        // A wrong header is not rescued by the query parameter.
        assert!(!is_authorized(&config, Some("wrong"), Some("secret")));
    }

    #[test]
    fn test_extract_token() {
        assert_eq!(extract_token_from_query("token=abc"), Some("abc"));
        assert_eq!(extract_token_from_query("foo=bar&token=abc"), Some("abc"));
        assert_eq!(extract_token_from_query("foo=bar"), None);
    }
}
