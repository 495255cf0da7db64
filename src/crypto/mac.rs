use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::CryptoError;

pub const MAC_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

fn keyed(key: &[u8], parts: &[&[u8]]) -> Result<HmacSha256, CryptoError> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac)
}

/// HMAC-SHA256 over the concatenation of `parts`.
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; MAC_LEN], CryptoError> {
    let digest = keyed(key, parts)?.finalize().into_bytes();
    let mut out = [0u8; MAC_LEN];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// Constant-time check of `tag` against HMAC-SHA256 over `parts`.
/// A key the MAC rejects verifies nothing.
pub fn verify_hmac_sha256(key: &[u8], parts: &[&[u8]], tag: &[u8]) -> bool {
    keyed(key, parts).map_or(false, |mac| mac.verify_slice(tag).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_are_concatenated() {
        let joined = hmac_sha256(b"key", &[b"nonce-and-random"]).unwrap();
        let split = hmac_sha256(b"key", &[b"nonce-", b"and-", b"random"]).unwrap();
        assert_eq!(joined, split);
    }

    #[test]
    fn verification_rejects_truncated_and_altered_tags() {
        let tag = hmac_sha256(b"secret", &[b"abc"]).unwrap();
        assert!(verify_hmac_sha256(b"secret", &[b"abc"], &tag));
        assert!(!verify_hmac_sha256(b"secret", &[b"abc"], &tag[..16]));
        let mut altered = tag;
        altered[0] ^= 1;
        assert!(!verify_hmac_sha256(b"secret", &[b"abc"], &altered));
        assert!(!verify_hmac_sha256(b"other", &[b"abc"], &tag));
    }

    #[test]
    fn empty_and_oversized_keys_are_accepted() {
        let long = [7u8; 200];
        let tag = hmac_sha256(&long, &[b"abc"]).unwrap();
        assert!(verify_hmac_sha256(&long, &[b"abc"], &tag));
        let tag = hmac_sha256(&[], &[b"abc"]).unwrap();
        assert!(verify_hmac_sha256(&[], &[b"abc"], &tag));
    }
}
