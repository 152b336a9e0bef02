//! S3 REST client with AWS Signature V4 signing.
//!
//! Speaks just enough of the S3 API for the image repository:
//! `ListObjectsV2`, `GetObject`, `PutObject`, `DeleteObjects`, and
//! query-string presigned `GetObject` URLs. Signing uses `hmac` + `sha2`
//! directly; responses are parsed with minimal tag extraction.
//!
//! # Addressing
//!
//! Without an `endpoint_url`, requests go to
//! `https://<bucket>.s3.<region>.amazonaws.com/<key>` (the global
//! `<bucket>.s3.amazonaws.com` host for `us-east-1`). With one (MinIO,
//! LocalStack), path-style addressing is used:
//! `<endpoint>/<bucket>/<key>`.
//!
//! # Credentials
//!
//! Taken from configuration when present, otherwise from
//! `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, and optionally
//! `AWS_SESSION_TOKEN`.

use std::io::Read;
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::{ObjectListing, ObjectStore, ObjectSummary};
use crate::error::{NimError, Result};
use crate::streams::sha256_hex;

type HmacSha256 = Hmac<Sha256>;

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
const MAX_PRESIGN_SECS: u64 = 604_800;

// ============ AWS Credentials ============

/// AWS access credentials.
#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl AwsCredentials {
    /// Load credentials from the standard AWS environment variables.
    pub fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").map_err(|_| {
            NimError::InvalidArgument("AWS_ACCESS_KEY_ID environment variable not set".into())
        })?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").map_err(|_| {
            NimError::InvalidArgument(
                "AWS_SECRET_ACCESS_KEY environment variable not set".into(),
            )
        })?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();
        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Connection settings for an [`S3Client`].
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible services; enables path-style URLs.
    pub endpoint_url: Option<String>,
    pub credentials: AwsCredentials,
}

// ============ Client ============

/// Blocking S3 client.
pub struct S3Client {
    settings: S3Settings,
    scheme: String,
    host: String,
    path_style: bool,
    http: reqwest::blocking::Client,
}

impl S3Client {
    pub fn new(settings: S3Settings) -> Result<Self> {
        if settings.bucket.is_empty() {
            return Err(NimError::InvalidArgument("S3 bucket must be set".into()));
        }
        let (scheme, host, path_style) = match &settings.endpoint_url {
            Some(endpoint) => {
                let (scheme, rest) = match endpoint.split_once("://") {
                    Some((s, r)) => (s.to_string(), r),
                    None => ("https".to_string(), endpoint.as_str()),
                };
                (scheme, rest.trim_end_matches('/').to_string(), true)
            }
            None if settings.region == "us-east-1" => (
                "https".to_string(),
                format!("{}.s3.amazonaws.com", settings.bucket),
                false,
            ),
            None => (
                "https".to_string(),
                format!("{}.s3.{}.amazonaws.com", settings.bucket, settings.region),
                false,
            ),
        };
        let http = reqwest::blocking::Client::builder()
            .timeout(None::<Duration>)
            .build()
            .map_err(|e| NimError::Http(e.to_string()))?;
        Ok(Self {
            settings,
            scheme,
            host,
            path_style,
            http,
        })
    }

    /// Canonical URI for `key`, or for the bucket itself when `key` is empty.
    fn canonical_uri(&self, key: &str) -> String {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        match (self.path_style, key.is_empty()) {
            (true, true) => format!("/{}", uri_encode(&self.settings.bucket)),
            (true, false) => format!("/{}/{}", uri_encode(&self.settings.bucket), encoded_key),
            (false, _) => format!("/{}", encoded_key),
        }
    }

    fn credential_scope(&self, date_stamp: &str) -> String {
        format!("{}/{}/s3/aws4_request", date_stamp, self.settings.region)
    }

    /// Build header-signed request headers for one call.
    fn signed_headers(
        &self,
        method: &str,
        canonical_uri: &str,
        canonical_query: &str,
        payload_hash: &str,
        extra: &[(&str, String)],
    ) -> Vec<(String, String)> {
        let creds = &self.settings.credentials;
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers = vec![
            ("host".to_string(), self.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.to_string()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        for (k, v) in extra {
            headers.push((k.to_ascii_lowercase(), v.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, canonical_uri, canonical_query, canonical_headers, signed_headers, payload_hash
        );
        let credential_scope = self.credential_scope(&date_stamp);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            sha256_hex(canonical_request.as_bytes())
        );
        let signing_key = derive_signing_key(
            &creds.secret_access_key,
            &date_stamp,
            &self.settings.region,
            "s3",
        );
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            creds.access_key_id, credential_scope, signed_headers, signature
        );

        headers.retain(|(k, _)| k != "host");
        headers.push(("authorization".to_string(), authorization));
        headers
    }

    fn url(&self, canonical_uri: &str, canonical_query: &str) -> String {
        if canonical_query.is_empty() {
            format!("{}://{}{}", self.scheme, self.host, canonical_uri)
        } else {
            format!(
                "{}://{}{}?{}",
                self.scheme, self.host, canonical_uri, canonical_query
            )
        }
    }

    fn request(
        &self,
        method: reqwest::Method,
        key: &str,
        query: &[(String, String)],
        payload_hash: &str,
        extra: &[(&str, String)],
    ) -> reqwest::blocking::RequestBuilder {
        let canonical_uri = self.canonical_uri(key);
        let canonical_query = canonical_query_string(query);
        let headers = self.signed_headers(
            method.as_str(),
            &canonical_uri,
            &canonical_query,
            payload_hash,
            extra,
        );
        let url = self.url(&canonical_uri, &canonical_query);
        tracing::debug!(method = %method, %url, "S3 request");
        let mut builder = self.http.request(method, &url);
        for (k, v) in headers {
            builder = builder.header(k, v);
        }
        builder
    }
}

fn error_body(resp: reqwest::blocking::Response) -> String {
    resp.text()
        .unwrap_or_default()
        .chars()
        .take(500)
        .collect::<String>()
}

impl ObjectStore for S3Client {
    fn bucket(&self) -> &str {
        &self.settings.bucket
    }

    fn list_objects(
        &self,
        prefix: &str,
        token: Option<&str>,
        max_keys: usize,
    ) -> Result<ObjectListing> {
        let mut query = vec![
            ("list-type".to_string(), "2".to_string()),
            ("max-keys".to_string(), max_keys.to_string()),
        ];
        if !prefix.is_empty() {
            query.push(("prefix".to_string(), prefix.to_string()));
        }
        if let Some(token) = token {
            query.push(("continuation-token".to_string(), token.to_string()));
        }

        let resp = self
            .request(reqwest::Method::GET, "", &query, &sha256_hex(b""), &[])
            .send()
            .map_err(|e| {
                NimError::Http(format!(
                    "Failed to list s3://{}/{}: {}",
                    self.settings.bucket, prefix, e
                ))
            })?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(NimError::Storage(format!(
                "S3 ListObjectsV2 failed (HTTP {}): {}",
                status,
                error_body(resp)
            )));
        }
        let xml = resp.text()?;
        Ok(parse_list_objects_response(&xml))
    }

    fn get_object(&self, key: &str) -> Result<Option<Box<dyn Read + Send>>> {
        let resp = self
            .request(reqwest::Method::GET, key, &[], &sha256_hex(b""), &[])
            .send()
            .map_err(|e| {
                NimError::Http(format!(
                    "Failed to get s3://{}/{}: {}",
                    self.settings.bucket, key, e
                ))
            })?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(NimError::Storage(format!(
                "S3 GetObject failed (HTTP {}) for key '{}': {}",
                status,
                key,
                error_body(resp)
            )));
        }
        Ok(Some(Box::new(resp)))
    }

    fn put_object(
        &self,
        key: &str,
        body: Box<dyn Read + Send>,
        content_length: u64,
        content_type: &str,
    ) -> Result<()> {
        let resp = self
            .request(reqwest::Method::PUT, key, &[], UNSIGNED_PAYLOAD, &[])
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(reqwest::blocking::Body::sized(body, content_length))
            .send()
            .map_err(|e| {
                NimError::Http(format!(
                    "Failed to put s3://{}/{}: {}",
                    self.settings.bucket, key, e
                ))
            })?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(NimError::Storage(format!(
                "S3 PutObject failed (HTTP {}) for key '{}': {}",
                status,
                key,
                error_body(resp)
            )));
        }
        Ok(())
    }

    fn delete_objects(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let body = delete_request_xml(keys);
        let checksum =
            base64::engine::general_purpose::STANDARD.encode(Sha256::digest(body.as_bytes()));
        let query = vec![("delete".to_string(), String::new())];
        let extra = [
            ("x-amz-checksum-sha256", checksum),
            ("x-amz-sdk-checksum-algorithm", "SHA256".to_string()),
        ];
        let resp = self
            .request(
                reqwest::Method::POST,
                "",
                &query,
                &sha256_hex(body.as_bytes()),
                &extra,
            )
            .header(reqwest::header::CONTENT_TYPE, "application/xml")
            .body(body)
            .send()
            .map_err(|e| {
                NimError::Http(format!(
                    "Failed to delete objects from s3://{}: {}",
                    self.settings.bucket, e
                ))
            })?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(NimError::Storage(format!(
                "S3 DeleteObjects failed (HTTP {}): {}",
                status,
                error_body(resp)
            )));
        }
        let xml = resp.text()?;
        if let Some(message) = extract_xml_value(&xml, "Error")
            .map(|block| extract_xml_value(&block, "Message").unwrap_or(block))
        {
            return Err(NimError::Storage(format!(
                "S3 DeleteObjects reported an error: {}",
                xml_unescape(&message)
            )));
        }
        Ok(())
    }

    fn presigned_get_url(&self, key: &str, expires_in: Duration) -> Result<String> {
        Ok(self.presign_at(key, expires_in, Utc::now()))
    }
}

impl S3Client {
    fn presign_at(&self, key: &str, expires_in: Duration, now: DateTime<Utc>) -> String {
        let creds = &self.settings.credentials;
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let credential_scope = self.credential_scope(&date_stamp);
        let expires = expires_in.as_secs().clamp(1, MAX_PRESIGN_SECS);

        let mut query = vec![
            (
                "X-Amz-Algorithm".to_string(),
                "AWS4-HMAC-SHA256".to_string(),
            ),
            (
                "X-Amz-Credential".to_string(),
                format!("{}/{}", creds.access_key_id, credential_scope),
            ),
            ("X-Amz-Date".to_string(), amz_date.clone()),
            ("X-Amz-Expires".to_string(), expires.to_string()),
            ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
        ];
        if let Some(ref token) = creds.session_token {
            query.push(("X-Amz-Security-Token".to_string(), token.clone()));
        }
        let canonical_uri = self.canonical_uri(key);
        let canonical_query = canonical_query_string(&query);
        let canonical_request = format!(
            "GET\n{}\n{}\nhost:{}\n\nhost\n{}",
            canonical_uri, canonical_query, self.host, UNSIGNED_PAYLOAD
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            sha256_hex(canonical_request.as_bytes())
        );
        let signing_key = derive_signing_key(
            &creds.secret_access_key,
            &date_stamp,
            &self.settings.region,
            "s3",
        );
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());
        format!(
            "{}&X-Amz-Signature={}",
            self.url(&canonical_uri, &canonical_query),
            signature
        )
    }
}

// ============ AWS SigV4 Helpers ============

fn canonical_query_string(params: &[(String, String)]) -> String {
    let mut sorted: Vec<_> = params
        .iter()
        .map(|(k, v)| (uri_encode(k), uri_encode(v)))
        .collect();
    sorted.sort();
    sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// Derive the SigV4 signing key.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding; only `A-Z a-z 0-9 - _ . ~` pass through.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

// ============ XML ============

fn parse_list_objects_response(xml: &str) -> ObjectListing {
    let mut objects = Vec::new();
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken").map(|t| xml_unescape(&t));

    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        remaining = &remaining[block_start + end + "</Contents>".len()..];

        let key = xml_unescape(&extract_xml_value(block, "Key").unwrap_or_default());
        if key.is_empty() || key.ends_with('/') {
            continue;
        }
        let last_modified = extract_xml_value(block, "LastModified")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let size = extract_xml_value(block, "Size")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        objects.push(ObjectSummary {
            key,
            size,
            last_modified,
        });
    }

    ObjectListing {
        objects,
        is_truncated,
        next_token,
    }
}

fn delete_request_xml(keys: &[String]) -> String {
    let mut xml = String::from("<Delete><Quiet>true</Quiet>");
    for key in keys {
        xml.push_str("<Object><Key>");
        xml.push_str(&xml_escape(key));
        xml.push_str("</Key></Object>");
    }
    xml.push_str("</Delete>");
    xml
}

/// Text content of the first `<tag>` element (non-nested).
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml[start..start + end].to_string())
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
