//! URL → content-type heuristic for summarizer model routing.
//!
//! Pure function over host allowlists and path substrings; no network, no
//! model. Extra hosts can be added through configuration.

use std::collections::BTreeMap;

use crate::core::types::ContentType;

const RESEARCH_HOSTS: &[&str] = &[
    "arxiv.org",
    "scholar.google.com",
    "pubmed.ncbi.nlm.nih.gov",
    "nature.com",
    "sciencedirect.com",
    "acm.org",
    "ieee.org",
    "springer.com",
    "semanticscholar.org",
    "biorxiv.org",
];

const CODE_HOSTS: &[&str] = &[
    "github.com",
    "gitlab.com",
    "bitbucket.org",
    "codeberg.org",
    "stackoverflow.com",
    "stackexchange.com",
    "crates.io",
    "npmjs.com",
    "pypi.org",
];

const NEWS_HOSTS: &[&str] = &[
    "reuters.com",
    "apnews.com",
    "bbc.com",
    "bbc.co.uk",
    "nytimes.com",
    "theguardian.com",
    "bloomberg.com",
    "techcrunch.com",
    "arstechnica.com",
    "theverge.com",
];

const DOCUMENTATION_HOSTS: &[&str] = &[
    "docs.rs",
    "readthedocs.io",
    "developer.mozilla.org",
    "learn.microsoft.com",
    "devdocs.io",
];

const DOCUMENTATION_PATHS: &[&str] = &["/docs", "/documentation", "/reference", "/manual", "/api/"];

/// Classify a URL. Precedence: configured overrides, then research / news /
/// code allowlists, then documentation patterns, then `general`.
pub fn classify(url: &str, extra_hosts: &BTreeMap<String, String>) -> ContentType {
    let Ok(parsed) = url::Url::parse(url) else {
        return ContentType::General;
    };
    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
    let path = parsed.path().to_ascii_lowercase();

    for (configured_host, kind) in extra_hosts {
        if host_matches(&host, configured_host) {
            return match kind.to_ascii_lowercase().as_str() {
                "research" => ContentType::Research,
                "code" => ContentType::Code,
                "news" => ContentType::News,
                "documentation" => ContentType::Documentation,
                _ => ContentType::General,
            };
        }
    }

    if RESEARCH_HOSTS.iter().any(|h| host_matches(&host, h)) || host.ends_with(".edu") {
        return ContentType::Research;
    }
    if NEWS_HOSTS.iter().any(|h| host_matches(&host, h)) {
        return ContentType::News;
    }
    if CODE_HOSTS.iter().any(|h| host_matches(&host, h)) {
        return ContentType::Code;
    }
    if DOCUMENTATION_HOSTS.iter().any(|h| host_matches(&host, h))
        || host.starts_with("docs.")
        || host.starts_with("api.")
        || DOCUMENTATION_PATHS.iter().any(|p| path.contains(p))
    {
        return ContentType::Documentation;
    }

    ContentType::General
}

fn host_matches(host: &str, allow: &str) -> bool {
    host == allow || host.ends_with(&format!(".{}", allow))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify_plain(url: &str) -> ContentType {
        classify(url, &BTreeMap::new())
    }

    #[test]
    fn allowlists_route_hosts() {
        assert_eq!(classify_plain("https://arxiv.org/abs/2601.01234"), ContentType::Research);
        assert_eq!(classify_plain("https://cs.stanford.edu/paper"), ContentType::Research);
        assert_eq!(classify_plain("https://github.com/rust-lang/rust"), ContentType::Code);
        assert_eq!(classify_plain("https://www.reuters.com/world/story"), ContentType::News);
        assert_eq!(classify_plain("https://docs.rs/tokio"), ContentType::Documentation);
        assert_eq!(classify_plain("https://example.com/blog"), ContentType::General);
    }

    #[test]
    fn path_substrings_mark_documentation() {
        assert_eq!(
            classify_plain("https://example.com/reference/config"),
            ContentType::Documentation
        );
        assert_eq!(
            classify_plain("https://docs.example.com/anything"),
            ContentType::Documentation
        );
        assert_eq!(
            classify_plain("https://api.example.com/v2"),
            ContentType::Documentation
        );
    }

    #[test]
    fn configured_hosts_win() {
        let mut extra = BTreeMap::new();
        extra.insert("example.com".to_string(), "research".to_string());
        assert_eq!(
            classify("https://example.com/anything", &extra),
            ContentType::Research
        );
    }

    #[test]
    fn unparseable_urls_default_to_general() {
        assert_eq!(classify_plain("not a url"), ContentType::General);
    }
}
