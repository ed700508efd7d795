use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum WebhookError {
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("signature header is missing")]
    MissingSignature,
    #[error("signature does not match the payload")]
    InvalidSignature,
    #[error("timestamp header is missing")]
    MissingTimestamp,
    #[error("timestamp `{raw}` is not epoch seconds")]
    InvalidTimestamp { raw: String },
    #[error("timestamp is {skew_secs}s outside the {window_secs}s replay window")]
    ReplayWindowExceeded { skew_secs: i64, window_secs: i64 },
}

impl WebhookError {
    /// Stable code for security logs; the HTTP body stays generic.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::MissingSignature => "missing_signature",
            Self::InvalidSignature => "invalid_signature",
            Self::MissingTimestamp => "missing_timestamp",
            Self::InvalidTimestamp { .. } => "invalid_timestamp",
            Self::ReplayWindowExceeded { .. } => "replay_window_exceeded",
        }
    }
}

/// Boundary check for provider webhook deliveries: payload size, HMAC
/// authenticity, and timestamp freshness, in that order. Only payloads
/// passing every check reach the dedupe store and the orchestrator.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Option<SecretString>,
    verify_signature: bool,
    replay_window_secs: i64,
    max_future_skew_secs: i64,
    max_payload_bytes: usize,
}

impl WebhookVerifier {
    pub fn new(
        secret: Option<SecretString>,
        verify_signature: bool,
        replay_window_secs: u64,
        max_future_skew_secs: u64,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            secret,
            verify_signature,
            replay_window_secs: replay_window_secs.max(1) as i64,
            max_future_skew_secs: max_future_skew_secs as i64,
            max_payload_bytes,
        }
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    /// Signature verification is togglable for local use; anti-replay is
    /// enforced whenever a timestamp is present.
    pub fn verify(
        &self,
        body: &[u8],
        signature: &str,
        timestamp: &str,
        now_epoch: i64,
    ) -> Result<(), WebhookError> {
        if body.len() > self.max_payload_bytes {
            return Err(WebhookError::PayloadTooLarge {
                size: body.len(),
                max: self.max_payload_bytes,
            });
        }

        if self.verify_signature {
            if timestamp.is_empty() {
                return Err(WebhookError::MissingTimestamp);
            }
            if signature.is_empty() {
                return Err(WebhookError::MissingSignature);
            }
            let Some(secret) = &self.secret else {
                return Err(WebhookError::InvalidSignature);
            };
            verify_signature(secret.expose_secret().as_bytes(), timestamp, body, signature)?;
        }

        if !timestamp.is_empty() {
            self.check_replay_window(timestamp, now_epoch)?;
        }

        Ok(())
    }

    fn check_replay_window(&self, timestamp: &str, now_epoch: i64) -> Result<(), WebhookError> {
        let ts: i64 = timestamp
            .trim()
            .parse()
            .map_err(|_| WebhookError::InvalidTimestamp { raw: timestamp.to_string() })?;

        let age = now_epoch - ts;
        if age > self.replay_window_secs {
            return Err(WebhookError::ReplayWindowExceeded {
                skew_secs: age,
                window_secs: self.replay_window_secs,
            });
        }
        if -age > self.max_future_skew_secs {
            return Err(WebhookError::ReplayWindowExceeded {
                skew_secs: age,
                window_secs: self.max_future_skew_secs,
            });
        }
        Ok(())
    }
}

/// Expected hex signature over `"{timestamp}.{body}"`, the same material
/// the provider signs. Exposed so clients and test fixtures can produce
/// matching signatures.
pub fn signature_hex(secret: &[u8], timestamp: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length; unreachable for non-empty secrets.
        Err(_) => return String::new(),
    };
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    encode_hex(mac.finalize().into_bytes().as_slice())
}

fn verify_signature(
    secret: &[u8],
    timestamp: &str,
    body: &[u8],
    claimed_hex: &str,
) -> Result<(), WebhookError> {
    let Some(claimed) = decode_hex(claimed_hex) else {
        return Err(WebhookError::InvalidSignature);
    };
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| WebhookError::InvalidSignature)?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    // Mac::verify_slice compares in constant time.
    mac.verify_slice(&claimed).map_err(|_| WebhookError::InvalidSignature)
}

/// Constant-time equality for short pre-shared keys (the "wa" channel).
pub fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in left.iter().zip(right.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

fn decode_hex(input: &str) -> Option<Vec<u8>> {
    let input = input.trim();
    if input.len() % 2 != 0 {
        return None;
    }
    (0..input.len())
        .step_by(2)
        .map(|index| u8::from_str_radix(input.get(index..index + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{constant_time_eq, signature_hex, WebhookError, WebhookVerifier};

    const SECRET: &str = "provider-shared-secret";
    const NOW: i64 = 1_754_000_000;

    fn verifier() -> WebhookVerifier {
        WebhookVerifier::new(Some(SECRET.to_string().into()), true, 300, 30, 256_000)
    }

    fn sign(timestamp: &str, body: &[u8]) -> String {
        signature_hex(SECRET.as_bytes(), timestamp, body)
    }

    #[test]
    fn fresh_signed_payload_passes() {
        let body = br#"{"message":"hola","from":"u-1"}"#;
        let timestamp = NOW.to_string();
        let signature = sign(&timestamp, body);

        verifier().verify(body, &signature, &timestamp, NOW).expect("should pass");
    }

    #[test]
    fn invalid_signature_is_rejected_regardless_of_freshness() {
        let body = b"{}";
        let timestamp = NOW.to_string();

        let error = verifier()
            .verify(body, "deadbeef", &timestamp, NOW)
            .expect_err("bad signature should fail");
        assert_eq!(error, WebhookError::InvalidSignature);
    }

    #[test]
    fn valid_signature_with_stale_timestamp_hits_the_replay_window() {
        let body = b"{}";
        // 10 minutes beyond a 5 minute window.
        let timestamp = (NOW - 900).to_string();
        let signature = sign(&timestamp, body);

        let error = verifier()
            .verify(body, &signature, &timestamp, NOW)
            .expect_err("stale timestamp should fail");
        assert_eq!(error, WebhookError::ReplayWindowExceeded { skew_secs: 900, window_secs: 300 });
    }

    #[test]
    fn future_timestamps_beyond_clock_tolerance_are_rejected() {
        let body = b"{}";
        let timestamp = (NOW + 120).to_string();
        let signature = sign(&timestamp, body);

        let error = verifier()
            .verify(body, &signature, &timestamp, NOW)
            .expect_err("future timestamp should fail");
        assert!(matches!(error, WebhookError::ReplayWindowExceeded { skew_secs: -120, .. }));
    }

    #[test]
    fn oversized_payload_is_rejected_before_any_crypto() {
        let verifier = WebhookVerifier::new(Some(SECRET.to_string().into()), true, 300, 30, 16);
        let body = vec![0u8; 17];

        let error = verifier
            .verify(&body, "", "", NOW)
            .expect_err("oversized payload should fail");
        assert_eq!(error, WebhookError::PayloadTooLarge { size: 17, max: 16 });
    }

    #[test]
    fn replay_window_applies_even_with_signature_checking_disabled() {
        let verifier = WebhookVerifier::new(None, false, 300, 30, 256_000);
        let stale = (NOW - 1_000).to_string();

        let error =
            verifier.verify(b"{}", "", &stale, NOW).expect_err("stale timestamp should fail");
        assert!(matches!(error, WebhookError::ReplayWindowExceeded { .. }));

        verifier.verify(b"{}", "", "", NOW).expect("no timestamp, nothing to replay-check");
    }

    #[test]
    fn non_numeric_timestamp_is_rejected() {
        let verifier = WebhookVerifier::new(None, false, 300, 30, 256_000);
        let error = verifier
            .verify(b"{}", "", "yesterday", NOW)
            .expect_err("non-numeric timestamp should fail");
        assert_eq!(error, WebhookError::InvalidTimestamp { raw: "yesterday".to_string() });
    }

    #[test]
    fn missing_signature_material_is_reported_precisely() {
        let timestamp = NOW.to_string();
        let error = verifier()
            .verify(b"{}", "", &timestamp, NOW)
            .expect_err("missing signature should fail");
        assert_eq!(error, WebhookError::MissingSignature);

        let error =
            verifier().verify(b"{}", "aa", "", NOW).expect_err("missing timestamp should fail");
        assert_eq!(error, WebhookError::MissingTimestamp);
    }

    #[test]
    fn constant_time_eq_compares_exact_bytes() {
        assert!(constant_time_eq(b"key-123", b"key-123"));
        assert!(!constant_time_eq(b"key-123", b"key-124"));
        assert!(!constant_time_eq(b"key-123", b"key-12"));
    }
}
