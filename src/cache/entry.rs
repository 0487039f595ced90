//! Cache entry model
//!
//! An entry couples the stored response with derived artifacts
//! (extracted text, metadata, link lists) keyed by artifact kind, each
//! with its own TTL. Entries serialize to JSON for the disk tier; the
//! body travels base64-encoded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::fetch::FetchedResponse;
use crate::guard::CanonicalUrl;

mod b64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Serializable form of a fetched response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResponse {
    pub final_url: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(with = "b64")]
    body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub hops: u32,
}

impl StoredResponse {
    #[must_use]
    pub fn from_response(response: &FetchedResponse) -> Self {
        Self {
            final_url: response.final_url.as_str().to_string(),
            status: response.status,
            headers: response.headers.clone(),
            body: response.body.to_vec(),
            fetched_at: response.fetched_at,
            duration_ms: response.duration.as_millis() as u64,
            hops: response.hops,
        }
    }

    #[must_use]
    pub fn body_bytes(&self) -> &[u8] {
        &self.body
    }

    /// Body as UTF-8 text, lossy.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A derived artifact (extracted text, metadata, ...) with its own TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub value: serde_json::Value,
    pub stored_at: DateTime<Utc>,
    pub ttl_ms: u64,
    /// Serialized size, counted toward the L1 byte budget.
    pub bytes: u64,
}

impl Artifact {
    #[must_use]
    pub fn new(value: serde_json::Value, ttl: Duration) -> Self {
        let bytes = value.to_string().len() as u64;
        Self {
            value,
            stored_at: Utc::now(),
            ttl_ms: ttl.as_millis() as u64,
            bytes,
        }
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        let age = Utc::now().signed_duration_since(self.stored_at);
        age.num_milliseconds() >= self.ttl_ms as i64
    }
}

/// One cached response plus derived artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub response: StoredResponse,
    pub stored_at: DateTime<Utc>,
    pub ttl_ms: u64,
    pub artifacts: HashMap<String, Artifact>,
}

impl CacheEntry {
    #[must_use]
    pub fn from_response(response: &FetchedResponse, ttl: Duration) -> Self {
        Self {
            response: StoredResponse::from_response(response),
            stored_at: Utc::now(),
            ttl_ms: ttl.as_millis() as u64,
            artifacts: HashMap::new(),
        }
    }

    /// Construct directly from parts; used by tests and by tools that
    /// cache synthesized content.
    #[must_use]
    pub fn from_parts(
        url: &CanonicalUrl,
        status: u16,
        headers: Vec<(String, String)>,
        body: &[u8],
        ttl: Duration,
    ) -> Self {
        Self {
            response: StoredResponse {
                final_url: url.as_str().to_string(),
                status,
                headers,
                body: body.to_vec(),
                fetched_at: Utc::now(),
                duration_ms: 0,
                hops: 0,
            },
            stored_at: Utc::now(),
            ttl_ms: ttl.as_millis() as u64,
            artifacts: HashMap::new(),
        }
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        let age = Utc::now().signed_duration_since(self.stored_at);
        age.num_milliseconds() >= self.ttl_ms as i64
    }

    /// Approximate memory weight for the L1 byte budget.
    #[must_use]
    pub fn weight(&self) -> u64 {
        let headers: u64 = self
            .response
            .headers
            .iter()
            .map(|(n, v)| (n.len() + v.len()) as u64)
            .sum();
        let artifacts: u64 = self.artifacts.values().map(|a| a.bytes).sum();
        self.response.body.len() as u64 + headers + artifacts + 256
    }

    /// A non-expired artifact of the given kind.
    #[must_use]
    pub fn artifact(&self, kind: &str) -> Option<&serde_json::Value> {
        self.artifacts
            .get(kind)
            .filter(|a| !a.is_expired())
            .map(|a| &a.value)
    }

    /// Copy of this entry with an artifact added or replaced.
    #[must_use]
    pub fn with_artifact(&self, kind: &str, value: serde_json::Value, ttl: Duration) -> Self {
        let mut clone = self.clone();
        clone
            .artifacts
            .insert(kind.to_string(), Artifact::new(value, ttl));
        clone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> CanonicalUrl {
        CanonicalUrl::parse("https://example.com/").expect("url")
    }

    #[test]
    fn json_round_trip_preserves_body() {
        let entry = CacheEntry::from_parts(
            &url(),
            200,
            vec![("content-type".into(), "text/html".into())],
            b"\x00\x01binary\xff",
            Duration::from_secs(60),
        );
        let encoded = serde_json::to_string(&entry).expect("encode");
        let decoded: CacheEntry = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded.response.body_bytes(), b"\x00\x01binary\xff");
        assert_eq!(decoded.response.status, 200);
    }

    #[test]
    fn artifact_ttl_independent_of_entry() {
        let entry = CacheEntry::from_parts(&url(), 200, vec![], b"x", Duration::from_secs(60))
            .with_artifact("text", serde_json::json!("extracted"), Duration::ZERO);
        assert!(!entry.is_expired());
        assert!(entry.artifact("text").is_none(), "expired artifact hidden");
    }

    #[test]
    fn weight_tracks_body_and_artifacts() {
        let bare = CacheEntry::from_parts(&url(), 200, vec![], b"1234", Duration::from_secs(60));
        let with = bare.with_artifact(
            "meta",
            serde_json::json!({"title": "x"}),
            Duration::from_secs(60),
        );
        assert!(with.weight() > bare.weight());
    }
}
