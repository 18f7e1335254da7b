//! WebSocket opening handshake
//!
//! Only the client half exists here: recognizing an upgrade request and
//! computing the accept key a real server would have answered with.

use super::http::Headers;
use base64::Engine;
use rand::RngCore;
use sha1::{Digest, Sha1};

/// The RFC 6455 handshake GUID
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `base64(sha1(nonce + guid))`
pub fn accept_key(nonce: &str, guid: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(nonce.as_bytes());
    hasher.update(guid.as_bytes());
    let digest = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// `upgrade: websocket`, case-insensitive. A `connection` header is not
/// required: Node clients sometimes omit it and fetch would reject the request
/// either way.
pub fn is_upgrade_request(headers: &Headers) -> bool {
    headers
        .get("upgrade")
        .map(|value| value.trim().eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// A fresh `sec-websocket-key`: 16 random bytes, base64
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc_sample_accept_key() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ==", WEBSOCKET_GUID),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_guid_changes_key() {
        let nonce = generate_nonce();
        assert_ne!(accept_key(&nonce, WEBSOCKET_GUID), accept_key(&nonce, "other-guid"));
    }

    #[test]
    fn test_nonce_shape() {
        let nonce = generate_nonce();
        assert_eq!(nonce.len(), 24);
        assert_ne!(nonce, generate_nonce());
    }

    #[test]
    fn test_is_upgrade_request() {
        let mut headers = Headers::new();
        assert!(!is_upgrade_request(&headers));

        headers.set("Upgrade", "WebSocket");
        assert!(is_upgrade_request(&headers));

        headers.set("Connection", "keep-alive, Upgrade");
        assert!(is_upgrade_request(&headers));

        headers.set("upgrade", "h2c");
        assert!(!is_upgrade_request(&headers));
    }
}
