//! Caller authorization.
//!
//! When an [`Authorizer`] is configured, callers first exchange a signed
//! authorization header for a session key; task submission and receipt
//! polling then require a still-valid key from the [`SessionCache`].
//! Sessions are checked but never extended, and expire after a fixed TTL.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;

use crate::error::{NimError, Result};

static SIGNED_HEADERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",SignedHeaders=([^,]+),").expect("valid signed headers pattern"));
static CREDENTIAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\sCredential=([^,]+),").expect("valid credential pattern"));

/// Identity details returned by a successful authorization.
pub type Identity = serde_json::Map<String, Value>;

/// Validates a caller-supplied authorization header.
pub trait Authorizer: Send + Sync {
    /// `date` is the value the caller signed as its request date.
    fn authorize(&self, authorization: &str, date: DateTime<Utc>) -> Result<Identity>;
}

// ============ Session Cache ============

/// Session key → expiry.
#[derive(Debug)]
pub struct SessionCache {
    ttl: chrono::Duration,
    sessions: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl SessionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Record a new session expiring one TTL from now.
    pub fn insert(&self, key: &str) -> DateTime<Utc> {
        self.insert_at(key, Utc::now())
    }

    fn insert_at(&self, key: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        let expires = now.checked_add_signed(self.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.sessions.write().insert(key.to_string(), expires);
        expires
    }

    pub fn is_valid(&self, key: &str) -> bool {
        self.is_valid_at(key, Utc::now())
    }

    fn is_valid_at(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.sessions
            .read()
            .get(key)
            .map(|expires| *expires > now)
            .unwrap_or(false)
    }

    /// Drop expired sessions. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, expires| *expires > now);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

// ============ HTTP Authorizer ============

/// Validates a SolarNetwork-style signed authorization by replaying it
/// against a "who am I" endpoint.
pub struct HttpAuthorizer {
    base_url: String,
    validate_path: String,
    client: reqwest::blocking::Client,
}

impl HttpAuthorizer {
    pub fn new(base_url: impl Into<String>, validate_path: impl Into<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            validate_path: validate_path.into(),
            client,
        })
    }

    pub fn validate_url(&self) -> String {
        format!("{}{}", self.base_url, self.validate_path)
    }
}

/// Name of the date header the caller signed: `X-SN-Date` or `Date`.
pub fn signed_date_header_name(authorization: &str) -> Result<&'static str> {
    let signed = SIGNED_HEADERS
        .captures(authorization)
        .and_then(|c| c.get(1))
        .ok_or_else(|| NimError::Authorization("SignedHeaders missing".to_string()))?
        .as_str();
    let names: Vec<&str> = signed.split(';').collect();
    if names.contains(&"x-sn-date") {
        Ok("X-SN-Date")
    } else if names.contains(&"date") {
        Ok("Date")
    } else {
        Err(NimError::Authorization(format!(
            "Date or X-SN-Date signed header name missing; available headers: {}",
            signed
        )))
    }
}

impl Authorizer for HttpAuthorizer {
    fn authorize(&self, authorization: &str, date: DateTime<Utc>) -> Result<Identity> {
        let date_header = signed_date_header_name(authorization)?;
        let url = self.validate_url();
        let resp = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::AUTHORIZATION, authorization)
            .header(date_header, date.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
            .send()?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(NimError::Authorization("Authentication failure".to_string()));
        }
        if !status.is_success() {
            return Err(NimError::Http(format!(
                "HTTP result status not in the 200-299 range: {}",
                status
            )));
        }

        let body: Value = resp.json()?;
        let identity = match body.get("data") {
            Some(Value::Object(data)) => data.clone(),
            _ => Identity::new(),
        };
        let token = CREDENTIAL
            .captures(authorization)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());
        tracing::info!(token = ?token, %url, "Authorized caller");
        Ok(identity)
    }
}
