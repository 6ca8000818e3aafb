//! Webhook signatures.
//!
//! Two schemes are supported:
//! - the local scheme, `base64(HMAC-SHA256(secret, url || body))` in the
//!   [`SIGNATURE_HEADER`] header, used by the mock backend;
//! - Twilio's scheme, `base64(HMAC-SHA1(auth_token, url || sorted params))`
//!   in the [`TWILIO_SIGNATURE_HEADER`] header.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

/// Header that carries the local webhook signature.
pub const SIGNATURE_HEADER: &str = "X-Ringline-Signature";

/// Header Twilio puts its request signature in.
pub const TWILIO_SIGNATURE_HEADER: &str = "X-Twilio-Signature";

fn mac_for(secret: &str, url: &str, body: &[u8]) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(url.as_bytes());
    mac.update(body);
    Some(mac)
}

/// Computes the signature for a request.
pub fn sign(secret: &str, url: &str, body: &[u8]) -> String {
    match mac_for(secret, url, body) {
        Some(mac) => STANDARD.encode(mac.finalize().into_bytes()),
        None => String::new(),
    }
}

/// Checks a signature in constant time. An empty secret never verifies.
pub fn verify(secret: &str, url: &str, body: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Ok(expected) = STANDARD.decode(signature.trim()) else {
        return false;
    };
    match mac_for(secret, url, body) {
        Some(mac) => mac.verify_slice(&expected).is_ok(),
        None => false,
    }
}

/// Twilio signs the full callback URL followed by every POST parameter,
/// sorted by name, with each name and value concatenated without separators.
fn twilio_mac_for(auth_token: &str, url: &str, params: &[(String, String)]) -> Option<HmacSha1> {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort();

    let mut mac = HmacSha1::new_from_slice(auth_token.as_bytes()).ok()?;
    mac.update(url.as_bytes());
    for (name, value) in sorted {
        mac.update(name.as_bytes());
        mac.update(value.as_bytes());
    }
    Some(mac)
}

/// Computes a Twilio request signature.
pub fn sign_twilio(auth_token: &str, url: &str, params: &[(String, String)]) -> String {
    match twilio_mac_for(auth_token, url, params) {
        Some(mac) => STANDARD.encode(mac.finalize().into_bytes()),
        None => String::new(),
    }
}

/// Checks a Twilio request signature in constant time.
pub fn verify_twilio(
    auth_token: &str,
    url: &str,
    params: &[(String, String)],
    signature: &str,
) -> bool {
    if auth_token.is_empty() {
        return false;
    }
    let Ok(expected) = STANDARD.decode(signature.trim()) else {
        return false;
    };
    match twilio_mac_for(auth_token, url, params) {
        Some(mac) => mac.verify_slice(&expected).is_ok(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://calls.example.com/webhooks/voice?call_id=abc";

    #[test]
    fn signed_request_verifies() {
        let sig = sign("s3cret", URL, b"CallSid=CA1&CallStatus=ringing");
        assert!(verify("s3cret", URL, b"CallSid=CA1&CallStatus=ringing", &sig));
    }

    #[test]
    fn tampering_is_detected() {
        let sig = sign("s3cret", URL, b"CallStatus=ringing");
        assert!(!verify("s3cret", URL, b"CallStatus=completed", &sig));
        assert!(!verify("other", URL, b"CallStatus=ringing", &sig));
        assert!(!verify("s3cret", "https://evil.example.com/", b"CallStatus=ringing", &sig));
    }

    #[test]
    fn garbage_and_empty_secrets_fail() {
        assert!(!verify("s3cret", URL, b"", "not base64!!"));
        let sig = sign("", URL, b"");
        assert!(!verify("", URL, b"", &sig));
    }

    fn twilio_params(caller: &str) -> Vec<(String, String)> {
        [
            ("To", "+18005551212"),
            ("From", caller),
            ("Digits", "1234"),
            ("Caller", caller),
            ("CallSid", "CA1234567890ABCDE"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    const TWILIO_URL: &str = "https://mycompany.com/myapp.php?foo=1&bar=2";

    #[test]
    fn twilio_published_vectors() {
        assert_eq!(
            sign_twilio("12345", TWILIO_URL, &twilio_params("+14158675309")),
            "RSOYDt4T1cUTdK1PDd93/VVr8B8="
        );
        assert!(verify_twilio(
            "12345",
            TWILIO_URL,
            &twilio_params("+12349013030"),
            "0/KCTR6DLpKmkAf8muzZqo1nDgQ="
        ));
    }

    #[test]
    fn twilio_signature_rejects_changes() {
        let params = twilio_params("+14158675309");
        let sig = sign_twilio("12345", TWILIO_URL, &params);
        assert!(!verify_twilio("54321", TWILIO_URL, &params, &sig));
        assert!(!verify_twilio("12345", "https://mycompany.com/other", &params, &sig));
        assert!(!verify_twilio("12345", TWILIO_URL, &twilio_params("+10000000000"), &sig));
        assert!(!verify_twilio("", TWILIO_URL, &params, &sig));
    }
}
