//! Recognises S3 URLs (virtual-hosted and path style) and extracts the
//! bucket name, for both checksum verification (C1) and auth-registry
//! bucket-keyed signer lookup (C2).

use once_cell::sync::Lazy;
use regex::Regex;

static VIRTUAL_HOSTED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^([a-z0-9][a-z0-9.\-]*)\.s3(?:[.-][a-z0-9-]+)?\.amazonaws\.com$").unwrap()
});

static PATH_STYLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^s3(?:[.-][a-z0-9-]+)?\.amazonaws\.com$").unwrap());

/// Is this host an S3 endpoint (virtual-hosted or path-style)?
pub fn is_s3_host(host: &str) -> bool {
    VIRTUAL_HOSTED.is_match(host) || PATH_STYLE.is_match(host)
}

/// Extract the bucket name from a parsed URL, whichever S3 addressing
/// style it uses. Returns `None` for non-S3 hosts.
pub fn extract_bucket(url: &reqwest::Url) -> Option<String> {
    let host = url.host_str()?;
    if let Some(caps) = VIRTUAL_HOSTED.captures(host) {
        return Some(caps[1].to_string());
    }
    if PATH_STYLE.is_match(host) {
        let mut segments = url.path_segments()?;
        return segments.next().map(str::to_string).filter(|s| !s.is_empty());
    }
    None
}

/// The canonicalised resource path used in the S3 v1 signing string: for
/// virtual-hosted URLs, `/<bucket><path>`; for path-style and all other
/// URLs, `<path>`.
pub fn canonicalized_resource(url: &reqwest::Url) -> String {
    let host = url.host_str().unwrap_or("");
    if let Some(caps) = VIRTUAL_HOSTED.captures(host) {
        format!("/{}{}", &caps[1], url.path())
    } else {
        url.path().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_hosted_bucket() {
        let url = reqwest::Url::parse("https://my-bucket.s3.amazonaws.com/key/path").unwrap();
        assert_eq!(extract_bucket(&url).as_deref(), Some("my-bucket"));
        assert!(is_s3_host(url.host_str().unwrap()));
    }

    #[test]
    fn path_style_bucket() {
        let url = reqwest::Url::parse("https://s3.amazonaws.com/my-bucket/key/path").unwrap();
        assert_eq!(extract_bucket(&url).as_deref(), Some("my-bucket"));
    }

    #[test]
    fn non_s3_host() {
        let url = reqwest::Url::parse("https://example.com/key").unwrap();
        assert_eq!(extract_bucket(&url), None);
        assert!(!is_s3_host(url.host_str().unwrap()));
    }

    #[test]
    fn canonicalized_resource_virtual_hosted() {
        let url = reqwest::Url::parse("https://my-bucket.s3.amazonaws.com/key/path").unwrap();
        assert_eq!(canonicalized_resource(&url), "/my-bucket/key/path");
    }
}
