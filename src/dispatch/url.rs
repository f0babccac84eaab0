//! Deterministic target-URL composition.

use crate::domain::Endpoint;
use url::Url;

/// Strip `prefix` from `path` exactly once (one exact match, not
/// repeated). Returns the path unchanged if it doesn't start with the
/// prefix.
pub fn strip_prefix<'a>(path: &'a str, prefix: &str) -> &'a str {
    path.strip_prefix(prefix).unwrap_or(path)
}

/// Join two path segments with exactly one separator, collapsing any
/// repeated slashes at the join point.
fn join_collapsing_slashes(base: &str, tail: &str) -> String {
    let base_trimmed = base.trim_end_matches('/');
    let tail_trimmed = tail.trim_start_matches('/');
    if tail_trimmed.is_empty() {
        if base_trimmed.is_empty() {
            "/".to_string()
        } else {
            base_trimmed.to_string()
        }
    } else {
        format!("{base_trimmed}/{tail_trimmed}")
    }
}

/// Compose the upstream target URL for `stripped_path` (the inbound path
/// with the proxy prefix already removed) against `endpoint`, preserving
/// the inbound query string verbatim and dropping any fragment.
pub fn compose_target_url(endpoint: &Endpoint, stripped_path: &str, query: Option<&str>) -> Url {
    let mut target = if endpoint.base_url.path().is_empty() || endpoint.base_url.path() == "/" {
        let mut url = endpoint.base_url.clone();
        let path = if stripped_path.is_empty() {
            "/".to_string()
        } else if stripped_path.starts_with('/') {
            stripped_path.to_string()
        } else {
            format!("/{stripped_path}")
        };
        url.set_path(&path);
        url
    } else if endpoint.preserve_path {
        let mut url = endpoint.base_url.clone();
        let joined = join_collapsing_slashes(endpoint.base_url.path(), stripped_path);
        url.set_path(&joined);
        url
    } else if stripped_path.is_empty() {
        // `Url::join("")` is a same-document reference and leaves the
        // base's path untouched; an empty remainder collapses to root
        // when the base path isn't being preserved.
        let mut url = endpoint.base_url.clone();
        url.set_path("/");
        url
    } else {
        // Standard URL reference resolution against the base, which drops
        // the base's own path.
        endpoint
            .base_url
            .join(stripped_path)
            .unwrap_or_else(|_| endpoint.base_url.clone())
    };

    target.set_query(query);
    target.set_fragment(None);
    target
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(url: &str, preserve_path: bool) -> Endpoint {
        Endpoint::new("e", Url::parse(url).unwrap(), preserve_path)
    }

    #[test]
    fn strips_prefix_exactly_once() {
        assert_eq!(strip_prefix("/olla/olla/v1/chat", "/olla/"), "olla/v1/chat");
        assert_eq!(strip_prefix("/v1/chat", "/olla/"), "/v1/chat");
    }

    #[test]
    fn scenario_one_no_base_path_strips_to_root() {
        let endpoint = endpoint("http://localhost:11434", false);
        let stripped = strip_prefix("/olla/v1/chat/completions", "/olla/");
        let target = compose_target_url(&endpoint, stripped, None);
        assert_eq!(target.as_str(), "http://localhost:11434/v1/chat/completions");
    }

    #[test]
    fn scenario_two_preserve_path_concatenates() {
        let endpoint = endpoint("https://api.openai.com/v1", true);
        let stripped = strip_prefix("/olla/chat/completions", "/olla/");
        let target = compose_target_url(&endpoint, stripped, None);
        assert_eq!(target.as_str(), "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn preserve_path_collapses_repeated_slashes() {
        let endpoint = endpoint("http://upstream/v1/api", true);
        let target = compose_target_url(&endpoint, "/chat", None);
        assert_eq!(target.path(), "/v1/api/chat");

        let endpoint = endpoint("http://upstream/api/v1/", true);
        let target = compose_target_url(&endpoint, "/models", None);
        assert_eq!(target.path(), "/api/v1/models");
    }

    #[test]
    fn non_preserve_path_drops_base_path() {
        let endpoint = endpoint("http://upstream/ignored/base", false);
        let target = compose_target_url(&endpoint, "/v1/models", None);
        assert_eq!(target.path(), "/v1/models");
    }

    #[test]
    fn empty_stripped_path_with_empty_base_yields_root() {
        let endpoint = endpoint("http://upstream", false);
        let target = compose_target_url(&endpoint, "", None);
        assert_eq!(target.path(), "/");
    }

    #[test]
    fn empty_stripped_path_with_nonempty_base_and_no_preserve_yields_root() {
        let endpoint = endpoint("http://upstream/ignored/base", false);
        let target = compose_target_url(&endpoint, "", None);
        assert_eq!(target.path(), "/");
    }

    #[test]
    fn empty_stripped_path_preserving_yields_endpoint_path() {
        let endpoint = endpoint("http://upstream/v1/api", true);
        let target = compose_target_url(&endpoint, "", None);
        assert_eq!(target.path(), "/v1/api");
    }

    #[test]
    fn query_is_preserved_and_fragment_dropped() {
        let endpoint = endpoint("http://upstream", false);
        let target = compose_target_url(&endpoint, "/v1/models", Some("page=2"));
        assert_eq!(target.query(), Some("page=2"));
        assert_eq!(target.fragment(), None);
    }

    #[test]
    fn composition_is_idempotent_on_an_already_stripped_path() {
        let endpoint = endpoint("http://localhost:11434", false);
        let once = compose_target_url(&endpoint, "v1/chat", None);
        let twice = compose_target_url(&endpoint, once.path().trim_start_matches('/'), None);
        assert_eq!(once.path(), twice.path());
    }
}
