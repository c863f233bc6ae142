//! Entry key derivation and URL comparison helpers

use http::Uri;

/// Remove the fragment from a URL
pub fn strip_fragment(url: &str) -> &str {
    url.split_once('#').map(|(base, _)| base).unwrap_or(url)
}

/// Remove query string and fragment from a URL
pub fn strip_search(url: &str) -> &str {
    let url = strip_fragment(url);
    url.split_once('?').map(|(base, _)| base).unwrap_or(url)
}

/// Backend key for a request URL. Fragments never take part in matching.
pub fn entry_key(url: &str) -> String {
    strip_fragment(url).to_string()
}

/// URL as compared during a query
pub fn comparable_url(url: &str, ignore_search: bool) -> &str {
    if ignore_search {
        strip_search(url)
    } else {
        strip_fragment(url)
    }
}

/// Basic shape check: an absolute URL with scheme and authority
pub fn is_valid_url(url: &str) -> bool {
    match url.parse::<Uri>() {
        Ok(uri) => uri.scheme().is_some() && uri.authority().is_some(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("https://x/a", "https://x/a")]
    #[case("https://x/a#frag", "https://x/a")]
    #[case("https://x/a?q=1#frag", "https://x/a?q=1")]
    fn test_entry_key_strips_fragment(#[case] url: &str, #[case] expected: &str) {
        assert_eq!(entry_key(url), expected);
    }

    #[rstest]
    #[case("https://x/a?q=1", true, "https://x/a")]
    #[case("https://x/a?q=1", false, "https://x/a?q=1")]
    #[case("https://x/a?q=1#f", true, "https://x/a")]
    #[case("https://x/a", true, "https://x/a")]
    fn test_comparable_url(#[case] url: &str, #[case] ignore_search: bool, #[case] expected: &str) {
        assert_eq!(comparable_url(url, ignore_search), expected);
    }

    #[rstest]
    #[case("https://example.com/a", true)]
    #[case("http://example.com:8080/a?b=c", true)]
    #[case("/relative/path", false)]
    #[case("not a url", false)]
    #[case("", false)]
    fn test_is_valid_url(#[case] url: &str, #[case] expected: bool) {
        assert_eq!(is_valid_url(url), expected);
    }
}
