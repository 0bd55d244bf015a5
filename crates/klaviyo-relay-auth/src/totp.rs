//! RFC 6238 time-based one-time passwords (HMAC-SHA1, 30 s step, 6 digits).

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::{AuthError, Result};

type HmacSha1 = Hmac<Sha1>;

/// Time step in seconds.
pub const STEP_SECS: u64 = 30;

/// Code length.
pub const DIGITS: u32 = 6;

/// A keyed TOTP generator.
#[derive(Clone)]
pub struct Totp {
    mac: HmacSha1,
}

impl Totp {
    /// Build from raw key bytes.
    pub fn new(secret: &[u8]) -> Result<Self> {
        if secret.is_empty() {
            return Err(AuthError::Totp("secret is empty".to_string()));
        }
        let mac = HmacSha1::new_from_slice(secret).map_err(|e| AuthError::Totp(e.to_string()))?;
        Ok(Self { mac })
    }

    /// Build from a base32 secret as shown by authenticator apps.
    ///
    /// Case, whitespace, dashes and padding are ignored.
    pub fn from_base32(encoded: &str) -> Result<Self> {
        let normalized: String = encoded
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '=' && *c != '-')
            .map(|c| c.to_ascii_uppercase())
            .collect();

        let secret = data_encoding::BASE32_NOPAD
            .decode(normalized.as_bytes())
            .map_err(|e| AuthError::Totp(e.to_string()))?;
        Self::new(&secret)
    }

    /// Code for the step containing `unix_secs`.
    pub fn code_at(&self, unix_secs: u64) -> String {
        let counter = unix_secs / STEP_SECS;
        let mut mac = self.mac.clone();
        mac.update(&counter.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        let offset = (digest[digest.len() - 1] & 0x0f) as usize;
        let binary = (u32::from(digest[offset] & 0x7f) << 24)
            | (u32::from(digest[offset + 1]) << 16)
            | (u32::from(digest[offset + 2]) << 8)
            | u32::from(digest[offset + 3]);

        format!(
            "{:0width$}",
            binary % 10u32.pow(DIGITS),
            width = DIGITS as usize
        )
    }

    /// Code for the current wall-clock time.
    pub fn now(&self) -> String {
        self.code_at(unix_now())
    }

    /// Seconds until the code for `unix_secs` rolls over.
    pub fn seconds_remaining(unix_secs: u64) -> u64 {
        STEP_SECS - unix_secs % STEP_SECS
    }
}

impl fmt::Debug for Totp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Totp([redacted])")
    }
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 appendix B key ("12345678901234567890") in base32.
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn test_rfc6238_vectors() {
        let totp = Totp::from_base32(RFC_SECRET).unwrap();
        assert_eq!(totp.code_at(59), "287082");
        assert_eq!(totp.code_at(1_111_111_109), "081804");
        assert_eq!(totp.code_at(1_234_567_890), "005924");
        assert_eq!(totp.code_at(2_000_000_000), "279037");
        assert_eq!(totp.code_at(20_000_000_000), "353130");
    }

    #[test]
    fn test_same_step_same_code() {
        let totp = Totp::from_base32("JFC7FMIAQVM423A6").unwrap();
        assert_eq!(totp.code_at(1_700_000_000), "725111");
        assert_eq!(totp.code_at(1_700_000_029), "102735");
        assert_eq!(totp.code_at(1_700_000_030), "102735");
        assert_eq!(totp.code_at(1_760_000_000), "878728");
    }

    #[test]
    fn test_normalizes_secret() {
        let totp = Totp::from_base32("jfc7 fmia qvm4 23a6").unwrap();
        assert_eq!(totp.code_at(1_700_000_000), "725111");
    }

    #[test]
    fn test_invalid_secret() {
        assert!(matches!(
            Totp::from_base32("not base32!"),
            Err(AuthError::Totp(_))
        ));
        assert!(matches!(Totp::from_base32(""), Err(AuthError::Totp(_))));
    }

    #[test]
    fn test_seconds_remaining() {
        assert_eq!(Totp::seconds_remaining(1_700_000_000), 10);
        assert_eq!(Totp::seconds_remaining(1_700_000_010), 30);
    }

    #[test]
    fn test_debug_redacts() {
        let totp = Totp::from_base32("JFC7FMIAQVM423A6").unwrap();
        assert_eq!(format!("{:?}", totp), "Totp([redacted])");
    }
}
