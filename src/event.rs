//! Nostr event model, canonical hashing, and signature checks.

use anyhow::{anyhow, Result};
use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RelayError;

/// Kind of an author's request to tombstone events it published (NIP-09).
pub const DELETION_KIND: u32 = 5;

/// Rejection reason for an id that is not 64 lowercase hex characters.
pub const INVALID_ID: &str = "id must be 64 lowercase hex characters";

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. Common examples include:
///
/// - `e` – references another event ID (deletion targets use this)
/// - `p` – references another author's public key
/// - `t` – free-form topic or hashtag
///
/// Each tag is stored verbatim so uncommon or custom tags are preserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Tag type, e.g. `"e"`.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First data element, e.g. the referenced event ID.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Immutable, signed, content-addressed Nostr event.
///
/// ```json
/// {
///   "id": "4376c65d2f232afbe9b882a35baa4f6fe8667c4e684749af565f981833ed6a65",
///   "pubkey": "6e468422dfb74a5738702a8823b9b28168abab8655faacb6853cd0ee15deee93",
///   "created_at": 1673347337,
///   "kind": 1,
///   "tags": [["e", "3da979448d9ba263864c4d6f14984c423a3838364ec255f03c7904b1ae77f206"]],
///   "content": "hello",
///   "sig": "908a15e46fb4d8675bab026fc230a0e3542bfade63da02d542fb78b2a8513fcd..."
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex, x-only).
    pub pubkey: String,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Kind number, e.g. `1` or `5`.
    pub kind: u32,
    /// Arbitrary tags such as `e` (event reference) or `t` (topic).
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    pub fn is_deletion(&self) -> bool {
        self.kind == DELETION_KIND
    }

    /// Values of every tag named `name`, in tag order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.name() == Some(name))
            .filter_map(Tag::value)
    }

    /// Event IDs this event asks to tombstone. Only meaningful for deletions.
    pub fn deletion_targets(&self) -> impl Iterator<Item = &str> + '_ {
        self.tag_values("e")
    }

    /// Check field shapes and, when `verify_sig` is set, the id hash and
    /// Schnorr signature.
    pub fn validate(&self, verify_sig: bool) -> Result<(), RelayError> {
        if !is_hex(&self.id, 64) {
            return Err(RelayError::bad_event(INVALID_ID));
        }
        if !is_hex(&self.pubkey, 64) {
            return Err(RelayError::bad_event(
                "pubkey must be 64 lowercase hex characters",
            ));
        }
        if !is_hex(&self.sig, 128) {
            return Err(RelayError::bad_event(
                "sig must be 128 lowercase hex characters",
            ));
        }
        if verify_sig {
            if hex::encode(event_hash(self)) != self.id {
                return Err(RelayError::bad_event("event id does not match its content"));
            }
            if !verify(self) {
                return Err(RelayError::bad_event("signature verification failed"));
            }
        }
        Ok(())
    }
}

/// Whether `s` is exactly `len` lowercase hex characters.
pub fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Recompute the Nostr event hash from its fields.
pub fn event_hash(ev: &Event) -> [u8; 32] {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    Sha256::digest(arr.to_string().as_bytes()).into()
}

/// Verify an event's ID and Schnorr signature.
pub fn verify(ev: &Event) -> bool {
    verify_event(ev).is_ok()
}

fn verify_event(ev: &Event) -> Result<()> {
    let hash = event_hash(ev);
    if hex::encode(hash) != ev.id {
        return Err(anyhow!("id mismatch"));
    }
    let sig = Signature::from_slice(&hex::decode(&ev.sig)?)?;
    let pk = XOnlyPublicKey::from_slice(&hex::decode(&ev.pubkey)?)?;
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest_slice(&hash)?;
    secp.verify_schnorr(&sig, &msg, &pk)?;
    Ok(())
}
