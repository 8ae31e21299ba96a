//! Fieldpay Event Log - hash-chained, signed, append-only streams
//!
//! Each event commits to the chain hash of its predecessor, and events
//! from non-system actors carry an Ed25519 signature over their chain
//! hash. A correctly verified chain proves the order and authorship of
//! every event independent of the storage engine.
//!
//! # Invariants
//!
//! 1. `chain_hash = sha256(canonical(event minus chain_hash/signature))`
//! 2. Genesis events have `prev_chain_hash = None`
//! 3. Recomputing the chain from genesis reproduces every stored hash;
//!    a single-bit mutation breaks verification from that point onward
//! 4. A chain hash may appear at most once per stream (stale-fork replay
//!    is rejected)

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use fieldpay_crypto::{hash_canonical, KeyId, KeyPair, KeyRing, Signature};
use fieldpay_types::{
    Actor, EventId, EventKind, EventPayload, FieldpayError, Result, EVENT_SCHEMA_VERSION,
};

/// A finalized, chain-linked event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub schema_version: u32,
    pub at: DateTime<Utc>,
    pub stream_id: String,
    pub actor: Actor,
    pub payload: EventPayload,
    pub prev_chain_hash: Option<String>,
    pub chain_hash: String,
    pub signer_key_id: Option<String>,
    pub signature: Option<String>,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// The view of the event that the chain hash commits to: everything
    /// except `chain_hash` and `signature`.
    fn signing_view(
        id: &EventId,
        schema_version: u32,
        at: &DateTime<Utc>,
        stream_id: &str,
        actor: &Actor,
        payload: &EventPayload,
        prev_chain_hash: &Option<String>,
        signer_key_id: &Option<String>,
    ) -> serde_json::Value {
        json!({
            "id": id,
            "schema_version": schema_version,
            "at": at,
            "stream_id": stream_id,
            "actor": actor,
            "payload": payload,
            "prev_chain_hash": prev_chain_hash,
            "signer_key_id": signer_key_id,
        })
    }

    /// Recompute this event's chain hash from its content
    pub fn recompute_chain_hash(&self) -> Result<String> {
        let view = Self::signing_view(
            &self.id,
            self.schema_version,
            &self.at,
            &self.stream_id,
            &self.actor,
            &self.payload,
            &self.prev_chain_hash,
            &self.signer_key_id,
        );
        hash_canonical(&view).map_err(|e| FieldpayError::Serialization {
            message: e.to_string(),
        })
    }
}

/// An event under construction: no chain fields yet
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub stream_id: String,
    pub actor: Actor,
    pub payload: EventPayload,
    pub at: DateTime<Utc>,
}

impl EventDraft {
    pub fn new(
        stream_id: impl Into<String>,
        actor: Actor,
        payload: EventPayload,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            actor,
            payload,
            at,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// A signing identity: key id plus key pair
#[derive(Clone)]
pub struct EventSigner {
    pub key_id: KeyId,
    pub keypair: KeyPair,
}

impl EventSigner {
    pub fn new(key_id: KeyId, keypair: KeyPair) -> Self {
        Self { key_id, keypair }
    }
}

/// Finalize a draft: compute its chain hash against `prev_chain_hash` and
/// attach a signature when a signer is given.
///
/// Non-system actors must supply a signer; system events may be finalized
/// unsigned (the server key signs them when persisted, if configured).
pub fn finalize_event(
    draft: EventDraft,
    prev_chain_hash: Option<String>,
    signer: Option<&EventSigner>,
) -> Result<Event> {
    if draft.actor.kind.requires_signature() && signer.is_none() {
        return Err(FieldpayError::SignatureMissing {
            actor: draft.actor.id.clone(),
        });
    }

    let id = EventId::new();
    let signer_key_id = signer.map(|s| s.key_id.to_string());

    let view = Event::signing_view(
        &id,
        EVENT_SCHEMA_VERSION,
        &draft.at,
        &draft.stream_id,
        &draft.actor,
        &draft.payload,
        &prev_chain_hash,
        &signer_key_id,
    );
    let chain_hash = hash_canonical(&view).map_err(|e| FieldpayError::Serialization {
        message: e.to_string(),
    })?;

    let signature = match signer {
        Some(s) => {
            let sig = Signature::sign(&s.keypair, chain_hash.as_bytes()).map_err(|e| {
                warn!(key_id = %s.key_id, error = %e, "event signing failed");
                FieldpayError::SignatureInvalid {
                    key_id: s.key_id.to_string(),
                }
            })?;
            Some(sig.0)
        }
        None => None,
    };

    Ok(Event {
        id,
        schema_version: EVENT_SCHEMA_VERSION,
        at: draft.at,
        stream_id: draft.stream_id,
        actor: draft.actor,
        payload: draft.payload,
        prev_chain_hash,
        chain_hash,
        signer_key_id,
        signature,
    })
}

/// Convenience: finalize a draft against the head of `events` and return
/// the extended sequence.
pub fn append_event(
    mut events: Vec<Event>,
    draft: EventDraft,
    signer: Option<&EventSigner>,
) -> Result<Vec<Event>> {
    let prev = events.last().map(|e| e.chain_hash.clone());
    let event = finalize_event(draft, prev, signer)?;
    events.push(event);
    Ok(events)
}

/// Walk a stream from genesis, confirming linkage, hash integrity and
/// signatures. Signature failures are security-relevant and logged
/// distinctly.
pub fn verify_chain(events: &[Event], ring: &KeyRing) -> Result<()> {
    let mut prev_hash: Option<&String> = None;
    let mut seen = HashSet::new();

    for event in events {
        if event.prev_chain_hash.as_ref() != prev_hash {
            return Err(FieldpayError::ChainBroken {
                chain_hash: event.chain_hash.clone(),
                reason: format!(
                    "prev_chain_hash {:?} does not match prior chain hash {:?}",
                    event.prev_chain_hash, prev_hash
                ),
            });
        }

        let recomputed = event.recompute_chain_hash()?;
        if recomputed != event.chain_hash {
            return Err(FieldpayError::ChainBroken {
                chain_hash: event.chain_hash.clone(),
                reason: "stored chain hash does not match recomputed hash".to_string(),
            });
        }

        // Replay of a stale fork: the same chain hash twice in one stream
        if !seen.insert(event.chain_hash.clone()) {
            return Err(FieldpayError::ChainBroken {
                chain_hash: event.chain_hash.clone(),
                reason: "chain hash reused within stream".to_string(),
            });
        }

        verify_event_signature(event, ring)?;
        prev_hash = Some(&event.chain_hash);
    }

    Ok(())
}

/// Verify a single event's signature requirements against the key ring
pub fn verify_event_signature(event: &Event, ring: &KeyRing) -> Result<()> {
    let requires = event.actor.kind.requires_signature();

    let (key_id, signature) = match (&event.signer_key_id, &event.signature) {
        (Some(k), Some(s)) => (k, s),
        _ if !requires => return Ok(()),
        _ => {
            warn!(actor = %event.actor.id, chain_hash = %event.chain_hash, "unsigned event from non-system actor");
            return Err(FieldpayError::SignatureMissing {
                actor: event.actor.id.clone(),
            });
        }
    };

    let key_id = KeyId::from_string(key_id.clone());
    let public_key = ring
        .lookup(&key_id)
        .map_err(|_| FieldpayError::SignatureUnknownKey {
            key_id: key_id.to_string(),
        })?;

    let ok = Signature(signature.clone())
        .verify(public_key, event.chain_hash.as_bytes())
        .map_err(|_| FieldpayError::SignatureInvalid {
            key_id: key_id.to_string(),
        })?;

    if !ok {
        warn!(key_id = %key_id, chain_hash = %event.chain_hash, "event signature failed verification");
        return Err(FieldpayError::SignatureInvalid {
            key_id: key_id.to_string(),
        });
    }

    Ok(())
}
