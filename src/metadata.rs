//! Metadata fetcher (C6): `describeStackResource`, AWS query-style
//! signature v2 (HMAC-SHA256) over a fixed canonical-query string.

use std::collections::BTreeMap;

use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::blocking::Client;
use sha2::Sha256;

use crate::error::{RemoteError, RetryMode};
use crate::model::{Credentials, StackResourceDetail};
use crate::retry::{with_retry, RetryPolicy};

type HmacSha256 = Hmac<Sha256>;

/// `describeStackResource(logicalId, stackName) -> StackResourceDetail`.
pub fn describe_stack_resource(
    logical_id: &str,
    stack_name: &str,
    region: &str,
    credentials: &Credentials,
) -> Result<StackResourceDetail, RemoteError> {
    let host = format!("cloudformation.{region}.amazonaws.com");
    let client = Client::new();
    let policy = RetryPolicy::default();

    with_retry(&policy, std::thread::sleep, |_attempt| {
        let url = build_signed_url(&host, logical_id, stack_name, credentials);

        let response = client.get(&url).send().map_err(|e| {
            RemoteError::new(RetryMode::Retriable, format!("requesting {logical_id}: {e}"))
        })?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|e| RemoteError::new(RetryMode::Retriable, format!("reading response body: {e}")))?;

        if !status.is_success() {
            return Err(classify_error(status, &body));
        }

        parse_response(&body).map_err(|e| RemoteError::new(RetryMode::Terminal, e))
    })
}

fn build_signed_url(host: &str, logical_id: &str, stack_name: &str, credentials: &Credentials) -> String {
    let mut params: BTreeMap<String, String> = BTreeMap::new();
    params.insert("Action".to_string(), "DescribeStackResource".to_string());
    params.insert("Version".to_string(), "2010-05-15".to_string());
    params.insert("StackName".to_string(), stack_name.to_string());
    params.insert("LogicalResourceId".to_string(), logical_id.to_string());
    params.insert("AWSAccessKeyId".to_string(), credentials.access_key.clone());
    params.insert("SignatureMethod".to_string(), "HmacSHA256".to_string());
    params.insert("SignatureVersion".to_string(), "2".to_string());
    params.insert(
        "Timestamp".to_string(),
        Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
    );
    if let Some(token) = &credentials.security_token {
        params.insert("SecurityToken".to_string(), token.clone());
    }

    let canonical_query = canonicalize(&params);
    let string_to_sign = format!("GET\n{host}\n/\n{canonical_query}");

    let mut mac = HmacSha256::new_from_slice(credentials.secret_key.as_bytes())
        .expect("HMAC accepts a key of any length");
    mac.update(string_to_sign.as_bytes());
    let signature = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    format!(
        "https://{host}/?{}&Signature={}",
        canonical_query,
        percent_encode(&signature)
    )
}

/// Parameters sorted lexically by key, percent-encoded per RFC 3986 (`~`
/// unreserved), joined with `&` and `=`.
fn canonicalize(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn classify_error(status: reqwest::StatusCode, body: &str) -> RemoteError {
    if is_throttling(status, body) {
        return RemoteError::new(RetryMode::Retriable, format!("throttled: HTTP {status}"));
    }
    if status.is_client_error() {
        return RemoteError::new(RetryMode::Terminal, format!("HTTP {status}: {body}"));
    }
    RemoteError::new(RetryMode::Retriable, format!("HTTP {status}: {body}"))
}

fn is_throttling(status: reqwest::StatusCode, body: &str) -> bool {
    status.as_u16() == 429 || body.contains("Throttling")
}

fn parse_response(body: &str) -> Result<StackResourceDetail, String> {
    let doc: serde_json::Value =
        serde_json::from_str(body).map_err(|e| format!("invalid response JSON: {e}"))?;

    let detail = doc
        .get("DescribeStackResourceResponse")
        .and_then(|v| v.get("DescribeStackResourceResult"))
        .and_then(|v| v.get("StackResourceDetail"))
        .ok_or_else(|| "response missing StackResourceDetail".to_string())?;

    let get_str = |key: &str| detail.get(key).and_then(|v| v.as_str()).map(str::to_string);

    let logical_id = get_str("LogicalResourceId").ok_or_else(|| "missing LogicalResourceId".to_string())?;
    let status = get_str("ResourceStatus").ok_or_else(|| "missing ResourceStatus".to_string())?;
    let physical_id = get_str("PhysicalResourceId");
    let last_updated = get_str("LastUpdatedTimestamp")
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc));

    let metadata = get_str("Metadata")
        .map(|raw| serde_json::from_str(&raw).map_err(|e| format!("invalid nested Metadata JSON: {e}")))
        .transpose()?;

    Ok(StackResourceDetail {
        logical_id,
        physical_id,
        metadata,
        status,
        last_updated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_encode_leaves_unreserved_untouched() {
        assert_eq!(percent_encode("abc-._~123"), "abc-._~123");
    }

    #[test]
    fn percent_encode_escapes_reserved() {
        assert_eq!(percent_encode("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn canonicalize_sorts_by_key() {
        let mut params = BTreeMap::new();
        params.insert("Version".to_string(), "2010-05-15".to_string());
        params.insert("Action".to_string(), "DescribeStackResource".to_string());
        let out = canonicalize(&params);
        assert_eq!(out, "Action=DescribeStackResource&Version=2010-05-15");
    }

    #[test]
    fn throttling_detected_by_status_or_body() {
        assert!(is_throttling(reqwest::StatusCode::TOO_MANY_REQUESTS, ""));
        assert!(is_throttling(reqwest::StatusCode::BAD_REQUEST, "<Code>Throttling</Code>"));
        assert!(!is_throttling(reqwest::StatusCode::BAD_REQUEST, "<Code>ValidationError</Code>"));
    }

    #[test]
    fn parse_response_unwraps_nested_metadata() {
        let body = serde_json::json!({
            "DescribeStackResourceResponse": {
                "DescribeStackResourceResult": {
                    "StackResourceDetail": {
                        "LogicalResourceId": "WebServer",
                        "ResourceStatus": "UPDATE_COMPLETE",
                        "PhysicalResourceId": "i-0123456789",
                        "Metadata": "{\"AWS::CloudFormation::Init\":{}}"
                    }
                }
            }
        })
        .to_string();
        let detail = parse_response(&body).unwrap();
        assert_eq!(detail.logical_id, "WebServer");
        assert_eq!(detail.status, "UPDATE_COMPLETE");
        assert!(detail.metadata.is_some());
    }
}
