//! Auth registry (C2): maps a requesting context (named key, or bucket/host
//! inferred from the URL) to a [`Signer`].

use std::collections::BTreeMap;
use std::time::Duration;

use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Url;
use sha1::Sha1;

use crate::endpoint;
use crate::error::{RemoteError, RetryMode};
use crate::model::{AuthEntry, AuthenticationSection, Credentials};
use crate::retry::{HttpClient, PreparedRequest, Signer};

type HmacSha1 = Hmac<Sha1>;

/// HTTP Basic signer: `Authorization: Basic base64(user:pass)`.
pub struct BasicSigner {
    username: String,
    password: String,
}

impl Signer for BasicSigner {
    fn sign(&self, req: &mut PreparedRequest) -> Result<(), RemoteError> {
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.username, self.password));
        insert_header(&mut req.headers, "Authorization", &format!("Basic {token}"))?;
        Ok(())
    }
}

/// Produces S3 credentials for signing. A static credential set for
/// access-key auth, or an instance-role provider that fetches lazily,
/// per spec.md §9's "always fetch-on-sign" requirement (no caching, even
/// across retries of the same logical request).
pub trait CredentialsSource: Send + Sync {
    fn credentials(&self) -> Result<Credentials, RemoteError>;
}

pub struct StaticCredentials(pub Credentials);

impl CredentialsSource for StaticCredentials {
    fn credentials(&self) -> Result<Credentials, RemoteError> {
        Ok(self.0.clone())
    }
}

/// Fetches temporary credentials from the instance metadata service just
/// before each signing call. Never caches: if credentials expire between
/// signing and dispatch, the next attempt (including a retry) re-fetches.
pub struct InstanceRoleCredentials {
    pub role_name: Option<String>,
    pub metadata_base: String,
}

impl InstanceRoleCredentials {
    pub fn new(role_name: Option<String>) -> Self {
        Self {
            role_name,
            metadata_base: "http://169.254.169.254/latest/meta-data/iam/security-credentials".to_string(),
        }
    }
}

impl CredentialsSource for InstanceRoleCredentials {
    fn credentials(&self) -> Result<Credentials, RemoteError> {
        let client = HttpClient::default();
        let timeout = Duration::from_secs(2);

        let role = match &self.role_name {
            Some(r) => r.clone(),
            None => {
                let (bytes, _) = client.get_with_timeout(&self.metadata_base, None, Some(timeout))?;
                String::from_utf8(bytes)
                    .map_err(|e| RemoteError::new(RetryMode::Terminal, format!("non-UTF8 role name: {e}")))?
                    .trim()
                    .to_string()
            }
        };

        let url = format!("{}/{}", self.metadata_base, role);
        let (bytes, _) = client.get_with_timeout(&url, None, Some(timeout))?;
        let doc: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| RemoteError::new(RetryMode::Terminal, format!("invalid credentials JSON: {e}")))?;

        let get_str = |k: &str| doc.get(k).and_then(|v| v.as_str()).map(str::to_string);
        let access_key = get_str("AccessKeyId")
            .ok_or_else(|| RemoteError::new(RetryMode::Terminal, "missing AccessKeyId".to_string()))?;
        let secret_key = get_str("SecretAccessKey")
            .ok_or_else(|| RemoteError::new(RetryMode::Terminal, "missing SecretAccessKey".to_string()))?;
        let security_token = get_str("Token");
        let expiration = get_str("Expiration").and_then(|s| {
            chrono::DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|d| d.with_timezone(&Utc))
        });

        Ok(Credentials {
            access_key,
            secret_key,
            security_token,
            expiration,
        })
    }
}

/// AWS S3 signature v1: HMAC-SHA1 canonical-string signing, as specified
/// in spec.md §4.2. Credentials are re-fetched on every `sign` call.
pub struct S3Signer {
    credentials: Box<dyn CredentialsSource>,
}

impl S3Signer {
    pub fn new(credentials: Box<dyn CredentialsSource>) -> Self {
        Self { credentials }
    }
}

impl Signer for S3Signer {
    fn sign(&self, req: &mut PreparedRequest) -> Result<(), RemoteError> {
        let creds = self.credentials.credentials()?;

        if req.headers.get("date").is_none() {
            let now = Utc::now();
            let formatted = now.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
            insert_header(&mut req.headers, "X-Amz-Date", &formatted)?;
        }

        if let Some(token) = &creds.security_token {
            insert_header(&mut req.headers, "x-amz-security-token", token)?;
        }

        let canonical_amz_headers = canonicalized_amz_headers(&req.headers);
        let canonical_resource = endpoint::canonicalized_resource(&req.url);
        let date_header = req
            .headers
            .get("date")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let string_to_sign = format!(
            "{}\n{}\n{}\n{}\n{}{}",
            req.method,
            req.content_md5.clone().unwrap_or_default(),
            req.content_type.clone().unwrap_or_default(),
            date_header,
            canonical_amz_headers,
            canonical_resource,
        );

        let mut mac = HmacSha1::new_from_slice(creds.secret_key.as_bytes())
            .map_err(|e| RemoteError::new(RetryMode::Terminal, format!("bad secret key: {e}")))?;
        mac.update(string_to_sign.as_bytes());
        let signature = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        insert_header(
            &mut req.headers,
            "Authorization",
            &format!("AWS {}:{}", creds.access_key, signature),
        )?;
        Ok(())
    }
}

/// All headers whose lowercase name starts with `x-amz-`, each rendered
/// as `name:value`, sorted, joined with `\n`, trailing `\n`.
fn canonicalized_amz_headers(headers: &reqwest::header::HeaderMap) -> String {
    let mut pairs: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers.iter() {
        let lower = name.as_str().to_lowercase();
        if lower.starts_with("x-amz-") {
            let value_str = value.to_str().unwrap_or_default();
            pairs
                .entry(lower)
                .and_modify(|v| {
                    v.push(',');
                    v.push_str(value_str);
                })
                .or_insert_with(|| value_str.to_string());
        }
    }
    let mut out = String::new();
    for (name, value) in pairs {
        out.push_str(&name);
        out.push(':');
        out.push_str(&value);
        out.push('\n');
    }
    out
}

fn insert_header(headers: &mut reqwest::header::HeaderMap, name: &str, value: &str) -> Result<(), RemoteError> {
    let header_name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| RemoteError::new(RetryMode::Terminal, format!("invalid header name {name:?}: {e}")))?;
    let header_value = HeaderValue::from_str(value)
        .map_err(|e| RemoteError::new(RetryMode::Terminal, format!("invalid header value for {name:?}: {e}")))?;
    headers.insert(header_name, header_value);
    Ok(())
}

/// Registry of signers, built once from the model's `Authentication`
/// section. `resolve` implements spec.md §4.2's lookup order: an
/// explicit named key first, then a bucket-keyed S3 default, then a
/// host-keyed Basic default.
#[derive(Default)]
pub struct AuthRegistry {
    named: BTreeMap<String, std::sync::Arc<dyn Signer>>,
    bucket_signers: BTreeMap<String, std::sync::Arc<dyn Signer>>,
    host_signers: BTreeMap<String, std::sync::Arc<dyn Signer>>,
}

impl AuthRegistry {
    pub fn from_section(section: &AuthenticationSection) -> Self {
        let mut registry = AuthRegistry::default();

        for (key, entry) in &section.entries {
            match entry {
                AuthEntry::S3 {
                    access_key_id,
                    secret_access_key,
                    buckets,
                    role_name,
                } => {
                    let credentials: Box<dyn CredentialsSource> = match (access_key_id, secret_access_key) {
                        (Some(ak), Some(sk)) => Box::new(StaticCredentials(Credentials {
                            access_key: ak.clone(),
                            secret_key: sk.clone(),
                            security_token: None,
                            expiration: None,
                        })),
                        _ => Box::new(InstanceRoleCredentials::new(role_name.clone())),
                    };
                    let signer: std::sync::Arc<dyn Signer> = std::sync::Arc::new(S3Signer::new(credentials));
                    registry.named.insert(key.clone(), signer.clone());
                    for bucket in buckets.iter().flatten() {
                        registry.bucket_signers.insert(bucket.clone(), signer.clone());
                    }
                }
                AuthEntry::Basic {
                    username,
                    password,
                    uris,
                } => {
                    let signer: std::sync::Arc<dyn Signer> = std::sync::Arc::new(BasicSigner {
                        username: username.clone(),
                        password: password.clone(),
                    });
                    registry.named.insert(key.clone(), signer.clone());
                    for uri in uris.iter().flatten() {
                        if let Ok(parsed) = Url::parse(uri) {
                            if let Some(host) = parsed.host_str() {
                                registry.host_signers.insert(host.to_string(), signer.clone());
                            }
                        }
                    }
                }
            }
        }

        registry
    }

    /// `resolve(key?) -> signer`. With a key, looks up the named entry
    /// directly. Without one, falls back to the default composite signer
    /// for `url`: a bucket-keyed S3 signer, then a host-keyed Basic signer.
    pub fn resolve(&self, key: Option<&str>, url: &Url) -> Option<std::sync::Arc<dyn Signer>> {
        if let Some(k) = key {
            return self.named.get(k).cloned();
        }
        if let Some(bucket) = endpoint::extract_bucket(url) {
            if let Some(s) = self.bucket_signers.get(&bucket) {
                return Some(s.clone());
            }
        }
        if let Some(host) = url.host_str() {
            if let Some(s) = self.host_signers.get(host) {
                return Some(s.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_signer_sets_authorization_header() {
        let signer = BasicSigner {
            username: "alice".to_string(),
            password: "secret".to_string(),
        };
        let mut req = PreparedRequest::get(Url::parse("https://example.com/x").unwrap());
        signer.sign(&mut req).unwrap();
        let auth = req.headers.get("Authorization").unwrap().to_str().unwrap();
        assert!(auth.starts_with("Basic "));
    }

    #[test]
    fn s3_signer_adds_authorization_and_date() {
        let signer = S3Signer::new(Box::new(StaticCredentials(Credentials {
            access_key: "AKIDEXAMPLE".to_string(),
            secret_key: "secret".to_string(),
            security_token: None,
            expiration: None,
        })));
        let mut req = PreparedRequest::get(Url::parse("https://bucket.s3.amazonaws.com/key").unwrap());
        signer.sign(&mut req).unwrap();
        assert!(req.headers.get("Authorization").unwrap().to_str().unwrap().starts_with("AWS AKIDEXAMPLE:"));
        assert!(req.headers.get("X-Amz-Date").is_some());
    }

    #[test]
    fn resolve_prefers_named_key() {
        let mut section = AuthenticationSection::default();
        section.entries.insert(
            "creds".to_string(),
            AuthEntry::Basic {
                username: "a".to_string(),
                password: "b".to_string(),
                uris: Some(vec!["https://example.com".to_string()]),
            },
        );
        let registry = AuthRegistry::from_section(&section);
        let url = Url::parse("https://other-host.com/x").unwrap();
        assert!(registry.resolve(Some("creds"), &url).is_some());
        assert!(registry.resolve(None, &url).is_none());
        let matching_host = Url::parse("https://example.com/x").unwrap();
        assert!(registry.resolve(None, &matching_host).is_some());
    }
}
