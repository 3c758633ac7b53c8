//! Platform label derivation from a job URL.

/// Hosts whose registrable name differs from the platform label.
const HOST_ALIASES: &[(&str, &str)] = &[
    ("youtu.be", "youtube"),
    ("x.com", "twitter"),
    ("t.co", "twitter"),
    ("instagr.am", "instagram"),
];

/// Derive a short platform label from a URL: `https://www.youtube.com/watch` → `youtube`.
/// Falls back to `"generic"` when the URL has no host.
pub fn platform_from_url(raw: &str) -> String {
    let Ok(parsed) = url::Url::parse(raw.trim()) else {
        return "generic".to_string();
    };
    let Some(host) = parsed.host_str() else {
        return "generic".to_string();
    };
    let host = host.trim_end_matches('.').to_lowercase();
    for (alias, label) in HOST_ALIASES {
        if host == *alias || host.ends_with(&format!(".{alias}")) {
            return (*label).to_string();
        }
    }
    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    match labels.len() {
        0 => "generic".to_string(),
        1 => labels[0].to_string(),
        n => labels[n - 2].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_subdomains() {
        assert_eq!(platform_from_url("https://www.youtube.com/watch?v=1"), "youtube");
        assert_eq!(platform_from_url("https://vm.tiktok.com/abc"), "tiktok");
        assert_eq!(platform_from_url("https://instagram.com/p/1"), "instagram");
    }

    #[test]
    fn aliases() {
        assert_eq!(platform_from_url("https://youtu.be/xyz"), "youtube");
        assert_eq!(platform_from_url("https://x.com/user/status/1"), "twitter");
    }

    #[test]
    fn not_a_url() {
        assert_eq!(platform_from_url("not a url"), "generic");
        assert_eq!(platform_from_url("http://localhost:8080/f"), "localhost");
    }
}
