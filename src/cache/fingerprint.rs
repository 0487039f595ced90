//! Stable request fingerprints
//!
//! A fingerprint reduces `(method, canonical_url, body_hash,
//! vary_headers_hash)` to 128 bits of a SHA-256 digest. It keys the
//! response cache, the crawler's dedup set, and the research visited
//! set. Two requests share a fingerprint only when the server would see
//! an equivalent request.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::guard::CanonicalUrl;

/// 128-bit request identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    /// Compute the fingerprint for a request.
    ///
    /// `vary_headers` should contain the request headers that change
    /// the response (already validated); order does not matter.
    #[must_use]
    pub fn compute(
        method: &str,
        url: &CanonicalUrl,
        body: Option<&[u8]>,
        vary_headers: &[(String, String)],
    ) -> Self {
        let body_hash: [u8; 32] = match body {
            Some(bytes) => Sha256::digest(bytes).into(),
            None => [0u8; 32],
        };

        let mut vary: Vec<String> = vary_headers
            .iter()
            .map(|(n, v)| format!("{}:{}", n.to_ascii_lowercase(), v))
            .collect();
        vary.sort();
        let vary_hash: [u8; 32] = Sha256::digest(vary.join("\n").as_bytes()).into();

        let mut hasher = Sha256::new();
        hasher.update(method.to_ascii_uppercase().as_bytes());
        hasher.update([0]);
        hasher.update(url.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(body_hash);
        hasher.update([0]);
        hasher.update(vary_hash);
        let digest = hasher.finalize();

        let mut truncated = [0u8; 16];
        truncated.copy_from_slice(&digest[..16]);
        Self(truncated)
    }

    /// Fingerprint for a plain GET with no special headers.
    #[must_use]
    pub fn for_get(url: &CanonicalUrl) -> Self {
        Self::compute("GET", url, None, &[])
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the 32-char hex form.
    #[must_use]
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Two-level shard prefix used for on-disk layouts.
    #[must_use]
    pub fn shard(&self) -> (String, String) {
        let h = self.to_hex();
        (h[0..2].to_string(), h[2..4].to_string())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> CanonicalUrl {
        CanonicalUrl::parse(s).expect("url")
    }

    #[test]
    fn stable_across_calls() {
        let u = url("https://example.com/page?a=1");
        assert_eq!(Fingerprint::for_get(&u), Fingerprint::for_get(&u));
    }

    #[test]
    fn method_and_body_distinguish() {
        let u = url("https://example.com/api");
        let get = Fingerprint::for_get(&u);
        let post = Fingerprint::compute("POST", &u, Some(b"{}"), &[]);
        let post2 = Fingerprint::compute("POST", &u, Some(b"{\"x\":1}"), &[]);
        assert_ne!(get, post);
        assert_ne!(post, post2);
    }

    #[test]
    fn vary_header_order_is_irrelevant() {
        let u = url("https://example.com/");
        let a = Fingerprint::compute(
            "GET",
            &u,
            None,
            &[
                ("Accept".into(), "text/html".into()),
                ("Accept-Language".into(), "de".into()),
            ],
        );
        let b = Fingerprint::compute(
            "GET",
            &u,
            None,
            &[
                ("accept-language".into(), "de".into()),
                ("accept".into(), "text/html".into()),
            ],
        );
        assert_eq!(a, b);
    }

    #[test]
    fn hex_round_trip() {
        let fp = Fingerprint::for_get(&url("https://example.com/x"));
        let hex = fp.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(Fingerprint::from_hex(&hex), Some(fp));
        assert_eq!(Fingerprint::from_hex("zz"), None);
    }

    #[test]
    fn canonically_equal_urls_share_fingerprints() {
        let a = url("https://Example.com/p?b=2&a=1");
        let b = url("https://example.com/p?a=1&b=2");
        assert_eq!(Fingerprint::for_get(&a), Fingerprint::for_get(&b));
    }
}
