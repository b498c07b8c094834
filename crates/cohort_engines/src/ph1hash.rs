#![forbid(unsafe_code)]

use sha2::{Digest, Sha256};

use cohort_kernel_contracts::ph1group::sorted_members;
use cohort_kernel_contracts::ph1hash::{MemberSetKey, PayloadHash};
use cohort_kernel_contracts::ph1id::Identity;

/// SHA-256 content addressing for attestation payloads and member sets.
///
/// Payload digests are plain SHA-256 over the raw bytes, so a digest the UI
/// computes client-side over the same text is identical.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentHasher;

impl ContentHasher {
    pub fn digest(payload: &[u8]) -> PayloadHash {
        PayloadHash::from_digest(Sha256::digest(payload).into())
    }

    /// Idempotency key for a group: order-independent over the member set.
    pub fn member_set_key(members: &[Identity]) -> MemberSetKey {
        let mut hasher = Sha256::new();
        for (i, m) in sorted_members(members).iter().enumerate() {
            if i > 0 {
                hasher.update(b",");
            }
            hasher.update(m.as_str().as_bytes());
        }
        MemberSetKey::from_digest(hasher.finalize().into())
    }
}
