// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Dataset manifest: a tiny blob whose body is a comma-separated list of
//! signed chunk URLs, in assignment order.  Commas are safe separators —
//! they can only appear percent-encoded inside a signed URL's query string.

/// Assemble the manifest body.
pub fn build(urls: &[String]) -> String {
    urls.join(",")
}

/// Parse a downloaded manifest body back into chunk URLs.
pub fn parse(body: &str) -> Vec<String> {
    body.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_in_order() {
        let urls = vec![
            "https://store/aa?X-Amz-Signature=1".to_string(),
            "https://store/bb?X-Amz-Signature=2".to_string(),
            "https://store/cc?X-Amz-Signature=3".to_string(),
        ];
        assert_eq!(parse(&build(&urls)), urls);
    }

    #[test]
    fn tolerates_whitespace_and_trailing_separator() {
        let parsed = parse("https://a/1 , https://a/2,");
        assert_eq!(parsed, vec!["https://a/1".to_string(), "https://a/2".to_string()]);
    }

    #[test]
    fn empty_body_is_no_chunks() {
        assert!(parse("").is_empty());
    }
}
