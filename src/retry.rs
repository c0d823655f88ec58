//! Retrying, checksum-verifying HTTP client (C1).
//!
//! A single blocking `reqwest::blocking::Client` underneath: the domain is
//! explicitly synchronous (spec.md §5), so no async runtime is pulled in
//! for this or anything downstream of it.

use std::io::{Read, Write};
use std::time::Duration;

use md5::{Digest as Md5Digest, Md5};
use rand::Rng;
use reqwest::blocking::Client;
use reqwest::header::HeaderMap;
use reqwest::Url;

use crate::endpoint;
use crate::error::{RetryMode, RemoteError};

/// `attempt i sleeps random() * min(maxSleep, 2^i - 1) seconds before firing`.
/// `i = 0` always yields zero (no initial sleep).
pub fn backoff_seconds(i: u32, max_sleep: f64, jitter: f64) -> f64 {
    let cap = (2f64.powi(i as i32) - 1.0).max(0.0);
    jitter.clamp(0.0, 1.0) * max_sleep.min(cap)
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_tries: u32,
    pub max_sleep: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_tries: 5,
            max_sleep: 20.0,
        }
    }
}

/// Higher-order retry combinator: runs `attempt` (which returns a
/// [`RemoteError`] carrying a [`RetryMode`] on failure) under `policy`'s
/// backoff schedule. `RETRIABLE_FOREVER` extends the schedule by one slot
/// each time it fires rather than consuming the budget.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    mut sleep: impl FnMut(Duration),
    mut attempt: impl FnMut(u32) -> Result<T, RemoteError>,
) -> Result<T, RemoteError> {
    let mut schedule_len = policy.max_tries;
    let mut i = 0u32;
    let mut last_err: Option<RemoteError> = None;

    loop {
        if i > 0 {
            let jitter: f64 = rand::thread_rng().gen();
            let secs = backoff_seconds(i, policy.max_sleep, jitter);
            if secs > 0.0 {
                sleep(Duration::from_secs_f64(secs));
            }
        }

        match attempt(i) {
            Ok(v) => return Ok(v),
            Err(e) => match e.mode {
                RetryMode::Terminal => return Err(e),
                RetryMode::RetriableForever => {
                    schedule_len += 1;
                    last_err = Some(e);
                }
                RetryMode::Retriable => {
                    last_err = Some(e);
                }
            },
        }

        i += 1;
        if i >= schedule_len {
            return Err(last_err.expect("loop only reaches here after at least one failed attempt"));
        }
    }
}

/// A request about to be signed and sent. Auth signers (C2) mutate
/// `headers` and may add an `Authorization` header based on `method`,
/// `url`, `content_md5`, and `content_type`.
pub struct PreparedRequest {
    pub method: String,
    pub url: Url,
    pub headers: HeaderMap,
    pub content_md5: Option<String>,
    pub content_type: Option<String>,
}

impl PreparedRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: "GET".to_string(),
            url,
            headers: HeaderMap::new(),
            content_md5: None,
            content_type: None,
        }
    }
}

/// A signer mutates a [`PreparedRequest`]'s headers to authenticate it.
/// Implemented by the S3 v1 signer and the HTTP Basic signer (C2); a
/// function-shaped trait so composite signers can just chain calls.
pub trait Signer: Send + Sync {
    fn sign(&self, req: &mut PreparedRequest) -> Result<(), RemoteError>;
}

pub struct HttpClient {
    client: Client,
    policy: RetryPolicy,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl HttpClient {
    pub fn new(policy: RetryPolicy) -> Self {
        let client = Client::builder()
            .build()
            .expect("reqwest client builds with default TLS config");
        Self { client, policy }
    }

    /// `get(url, auth?) -> (bytes, headers)`.
    pub fn get(&self, url: &str, signer: Option<&dyn Signer>) -> Result<(Vec<u8>, HeaderMap), RemoteError> {
        self.get_with_timeout(url, signer, None)
    }

    pub fn get_with_timeout(
        &self,
        url: &str,
        signer: Option<&dyn Signer>,
        timeout: Option<Duration>,
    ) -> Result<(Vec<u8>, HeaderMap), RemoteError> {
        let parsed = Url::parse(url)
            .map_err(|e| RemoteError::new(RetryMode::Terminal, format!("invalid URL {url:?}: {e}")))?;

        with_retry(&self.policy, std::thread::sleep, |_attempt| {
            let mut prepared = PreparedRequest::get(parsed.clone());
            if let Some(s) = signer {
                s.sign(&mut prepared)?;
            }

            let mut builder = self.client.get(prepared.url.clone()).headers(prepared.headers);
            if let Some(t) = timeout {
                builder = builder.timeout(t);
            }

            let response = builder.send().map_err(classify_transport_error)?;
            let status = response.status();
            let headers = response.headers().clone();

            if let Some(mode) = classify_status(status) {
                return Err(RemoteError::new(mode, format!("HTTP {status} from {url}")));
            }

            let etag = headers
                .get(reqwest::header::ETAG)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            let bytes = response
                .bytes()
                .map_err(classify_transport_error)?
                .to_vec();

            verify_checksum(&parsed, etag.as_deref(), &bytes)?;

            Ok((bytes, headers))
        })
    }

    /// `getToFile(url, dest, auth?)`: streams ~10KiB chunks directly to
    /// `dest`, truncating it first, so arbitrarily large archives never
    /// need to fit in memory. Still verifies the MD5/ETag over the stream.
    pub fn get_to_file(
        &self,
        url: &str,
        dest: &std::path::Path,
        signer: Option<&dyn Signer>,
    ) -> Result<(), RemoteError> {
        let parsed = Url::parse(url)
            .map_err(|e| RemoteError::new(RetryMode::Terminal, format!("invalid URL {url:?}: {e}")))?;

        with_retry(&self.policy, std::thread::sleep, |_attempt| {
            let mut prepared = PreparedRequest::get(parsed.clone());
            if let Some(s) = signer {
                s.sign(&mut prepared)?;
            }

            let mut response = self
                .client
                .get(prepared.url.clone())
                .headers(prepared.headers)
                .send()
                .map_err(classify_transport_error)?;

            let status = response.status();
            if let Some(mode) = classify_status(status) {
                return Err(RemoteError::new(mode, format!("HTTP {status} from {url}")));
            }

            let etag = response
                .headers()
                .get(reqwest::header::ETAG)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            let mut file = std::fs::File::create(dest).map_err(|e| {
                RemoteError::new(RetryMode::Terminal, format!("cannot create {}: {e}", dest.display()))
            })?;

            let mut hasher = Md5::new();
            let mut buf = [0u8; 10 * 1024];
            loop {
                let n = response.read(&mut buf).map_err(classify_io_error)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                file.write_all(&buf[..n]).map_err(|e| {
                    RemoteError::new(RetryMode::Terminal, format!("write to {}: {e}", dest.display()))
                })?;
            }

            check_etag(&parsed, etag.as_deref(), &hasher.finalize())?;
            Ok(())
        })
    }
}

fn classify_status(status: reqwest::StatusCode) -> Option<RetryMode> {
    if status.is_success() {
        return None;
    }
    let code = status.as_u16();
    if code == 503 {
        Some(RetryMode::RetriableForever)
    } else if code == 408 || code == 404 {
        Some(RetryMode::Retriable)
    } else if status.is_client_error() {
        Some(RetryMode::Terminal)
    } else {
        Some(RetryMode::Retriable)
    }
}

fn classify_transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        return RemoteError::new(RetryMode::Retriable, format!("timeout: {e}"));
    }
    if e.is_connect() {
        let msg = e.to_string().to_lowercase();
        if msg.contains("certificate") || msg.contains("tls") || msg.contains("ssl") {
            return RemoteError::new(RetryMode::Terminal, format!("certificate error: {e}"));
        }
        return RemoteError::new(RetryMode::Retriable, format!("connection error: {e}"));
    }
    RemoteError::new(RetryMode::Retriable, format!("request error: {e}"))
}

fn classify_io_error(e: std::io::Error) -> RemoteError {
    RemoteError::new(RetryMode::Retriable, format!("stream read error: {e}"))
}

/// ETag consistency (spec.md §4.1): when the URL is an S3 host and the
/// ETag doesn't carry a `-` (not a multipart upload), the MD5 of the body
/// must equal the ETag.
fn verify_checksum(url: &Url, etag: Option<&str>, body: &[u8]) -> Result<(), RemoteError> {
    let Some(etag) = non_multipart_s3_etag(url, etag) else {
        return Ok(());
    };
    let digest = Md5::digest(body);
    check_digest(&etag, &digest)
}

fn check_etag(url: &Url, etag: Option<&str>, digest: &[u8]) -> Result<(), RemoteError> {
    let Some(etag) = non_multipart_s3_etag(url, etag) else {
        return Ok(());
    };
    check_digest(&etag, digest)
}

fn non_multipart_s3_etag<'a>(url: &Url, etag: Option<&'a str>) -> Option<String> {
    let host = url.host_str()?;
    if !endpoint::is_s3_host(host) {
        return None;
    }
    let etag = etag?;
    let stripped = etag.trim_matches('"');
    if stripped.contains('-') {
        return None;
    }
    Some(stripped.to_string())
}

fn check_digest(expected_hex: &str, digest: &[u8]) -> Result<(), RemoteError> {
    let actual_hex = hex::encode(digest);
    if actual_hex.eq_ignore_ascii_case(expected_hex) {
        Ok(())
    } else {
        Err(crate::error::ChecksumError {
            expected: expected_hex.to_string(),
            actual: actual_hex,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_i0_is_zero() {
        assert_eq!(backoff_seconds(0, 20.0, 0.9), 0.0);
    }

    #[test]
    fn backoff_schedule_bounds() {
        for i in 0..5u32 {
            let cap = 20f64.min((2f64.powi(i as i32) - 1.0).max(0.0));
            let v = backoff_seconds(i, 20.0, 1.0);
            assert!(v <= cap + 1e-9, "i={i} v={v} cap={cap}");
            assert!(v >= 0.0);
        }
    }

    #[test]
    fn with_retry_exhausts_schedule_exactly_max_tries() {
        let policy = RetryPolicy {
            max_tries: 5,
            max_sleep: 0.0,
        };
        let mut attempts = 0u32;
        let result: Result<(), RemoteError> = with_retry(&policy, |_| {}, |_i| {
            attempts += 1;
            Err(RemoteError::new(RetryMode::Retriable, "boom"))
        });
        assert!(result.is_err());
        assert_eq!(attempts, 5);
    }

    #[test]
    fn with_retry_forever_extends_schedule() {
        let policy = RetryPolicy {
            max_tries: 2,
            max_sleep: 0.0,
        };
        let mut attempts = 0u32;
        let result = with_retry(&policy, |_| {}, |_i| {
            attempts += 1;
            if attempts <= 3 {
                Err(RemoteError::new(RetryMode::RetriableForever, "503"))
            } else {
                Ok(())
            }
        });
        assert!(result.is_ok());
        assert_eq!(attempts, 4);
    }

    #[test]
    fn terminal_error_stops_immediately() {
        let policy = RetryPolicy::default();
        let mut attempts = 0u32;
        let result: Result<(), RemoteError> = with_retry(&policy, |_| {}, |_i| {
            attempts += 1;
            Err(RemoteError::new(RetryMode::Terminal, "404"))
        });
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[test]
    fn checksum_mismatch_on_s3_etag() {
        let url = Url::parse("https://bucket.s3.amazonaws.com/key").unwrap();
        let err = verify_checksum(&url, Some("\"deadbeef\""), b"hello world").unwrap_err();
        assert_eq!(err.mode, RetryMode::Retriable);
    }

    #[test]
    fn checksum_skipped_for_multipart_etag() {
        let url = Url::parse("https://bucket.s3.amazonaws.com/key").unwrap();
        assert!(verify_checksum(&url, Some("\"abc-2\""), b"hello world").is_ok());
    }

    #[test]
    fn checksum_skipped_for_non_s3_host() {
        let url = Url::parse("https://example.com/key").unwrap();
        assert!(verify_checksum(&url, Some("\"deadbeef\""), b"hello world").is_ok());
    }
}
