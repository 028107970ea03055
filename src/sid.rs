use sha2::{Digest, Sha256};

/// Short stable hash of `(url, headers)` used as the local URL id, per
/// spec.md §6.2: first 24 hex chars of
/// `sha256(url || "\n" || sorted "key:value" headers, lowercase keys)`.
pub fn compute(url: &str, headers: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, &str)> = headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.as_str()))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut id_src = String::with_capacity(url.len() + 64);
    id_src.push_str(url);
    id_src.push('\n');
    for (i, (k, v)) in pairs.iter().enumerate() {
        if i > 0 {
            id_src.push('\n');
        }
        id_src.push_str(k);
        id_src.push(':');
        id_src.push_str(v);
    }

    let digest = Sha256::digest(id_src.as_bytes());
    hex::encode(digest)[..24].to_string()
}

/// `sha256(url).hex()`, used to name an entry's on-disk directory
/// (spec.md §6.2 on-disk layout).
pub fn url_dir_name(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_across_calls() {
        let h = vec![("Referer".to_string(), "https://example.com".to_string())];
        assert_eq!(compute("https://origin/a.mp3", &h), compute("https://origin/a.mp3", &h));
    }

    #[test]
    fn header_order_does_not_matter() {
        let h1 = vec![
            ("Referer".to_string(), "r".to_string()),
            ("User-Agent".to_string(), "u".to_string()),
        ];
        let h2 = vec![
            ("User-Agent".to_string(), "u".to_string()),
            ("Referer".to_string(), "r".to_string()),
        ];
        assert_eq!(compute("https://origin/a.mp3", &h1), compute("https://origin/a.mp3", &h2));
    }

    #[test]
    fn different_headers_yield_different_sid() {
        let h1 = vec![("Referer".to_string(), "a".to_string())];
        let h2 = vec![("Referer".to_string(), "b".to_string())];
        assert_ne!(compute("https://origin/a.mp3", &h1), compute("https://origin/a.mp3", &h2));
    }

    #[test]
    fn sid_is_24_hex_chars() {
        let sid = compute("https://origin/a.mp3", &[]);
        assert_eq!(sid.len(), 24);
        assert!(sid.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
