use crate::types::SharedSecret;
use hmac::digest::{InvalidLength, KeyInit};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

pub const SHA1_HEADER: &str = "x-hub-signature";
pub const SHA256_HEADER: &str = "x-hub-signature-256";

const SHA1_PREFIX: &str = "sha1=";
const SHA256_PREFIX: &str = "sha256=";

/// Compute the `X-Hub-Signature` value for `body`: `"sha1=" + lowercase hex`.
pub fn sign_sha1(secret: &[u8], body: &[u8]) -> Result<String, InvalidLength> {
    sign::<HmacSha1>(secret, body, SHA1_PREFIX)
}

/// Compute the `X-Hub-Signature-256` value for `body`.
pub fn sign_sha256(secret: &[u8], body: &[u8]) -> Result<String, InvalidLength> {
    sign::<HmacSha256>(secret, body, SHA256_PREFIX)
}

fn sign<M: Mac + KeyInit>(secret: &[u8], body: &[u8], prefix: &str) -> Result<String, InvalidLength> {
    let mut mac = <M as Mac>::new_from_slice(secret)?;
    mac.update(body);
    Ok(format!("{prefix}{}", hex::encode(mac.finalize().into_bytes())))
}

/// Digest comparison goes through `Mac::verify_slice`, which is constant-time.
fn check<M: Mac + KeyInit>(
    secret: &[u8],
    body: &[u8],
    signature_header: &str,
    prefix: &str,
) -> Verdict {
    let Some(hex_sig) = signature_header.trim().strip_prefix(prefix) else {
        return Verdict::Malformed;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return Verdict::Malformed;
    };
    let Ok(mut mac) = <M as Mac>::new_from_slice(secret) else {
        return Verdict::Malformed;
    };
    mac.update(body);
    match mac.verify_slice(&expected) {
        Ok(()) => Verdict::Verified,
        Err(_) => Verdict::Mismatch,
    }
}

/// Result of checking one delivery. Anything other than `Verified` must be
/// rejected; the variant only feeds the rejection log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Verified,
    Missing,
    Malformed,
    Mismatch,
}

impl Verdict {
    pub fn is_verified(self) -> bool {
        self == Verdict::Verified
    }

    pub fn reason(self) -> &'static str {
        match self {
            Verdict::Verified => "verified",
            Verdict::Missing => "missing signature",
            Verdict::Malformed => "malformed signature",
            Verdict::Mismatch => "signature mismatch",
        }
    }
}

/// Holds the secret for the lifetime of the process and checks deliveries
/// against it. Pure: no I/O, no shared mutable state.
#[derive(Debug, Clone)]
pub struct Verifier {
    secret: SharedSecret,
    accept_sha256: bool,
}

impl Verifier {
    pub fn new(secret: SharedSecret) -> Self {
        Self {
            secret,
            accept_sha256: false,
        }
    }

    /// Also honour `X-Hub-Signature-256` when the sender provides it.
    pub fn accept_sha256(mut self, enabled: bool) -> Self {
        self.accept_sha256 = enabled;
        self
    }

    /// Check a delivery given the raw body and the signature header values.
    ///
    /// With SHA-256 enabled and a `sha256=` header present, that header
    /// decides; otherwise the `sha1=` header does.
    pub fn verify(&self, body: &[u8], sha1_header: Option<&str>, sha256_header: Option<&str>) -> Verdict {
        let key = self.secret.expose();
        if self.accept_sha256 {
            if let Some(sig) = sha256_header {
                return check::<HmacSha256>(key, body, sig, SHA256_PREFIX);
            }
        }
        match sha1_header {
            Some(sig) => check::<HmacSha1>(key, body, sig, SHA1_PREFIX),
            None => Verdict::Missing,
        }
    }
}
