//! Pairing-code exchange for DM senders that are not allowlisted yet.
//!
//! The store is a host collaborator: channels ask it for a code and read the
//! approved senders, and an operator approves codes out of band.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use {async_trait::async_trait, rand::Rng, tracing::debug};

use crate::Result;

/// How long an unapproved pairing request stays valid.
const PAIRING_TTL: Duration = Duration::from_secs(3600);

/// Outcome of asking the store for a sender's pairing code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRequest {
    pub code: String,
    /// `false` when an unexpired request already existed for this sender.
    pub created: bool,
}

#[async_trait]
pub trait PairingStore: Send + Sync {
    /// Return the sender's pending pairing code, creating one if needed.
    async fn upsert_request(
        &self,
        channel_type: &str,
        account_id: &str,
        sender_id: &str,
        sender_name: Option<&str>,
    ) -> Result<PairingRequest>;

    /// Senders approved through pairing for this account.
    async fn allow_list(&self, channel_type: &str, account_id: &str) -> Result<Vec<String>>;
}

struct PendingPairing {
    code: String,
    expires_at: Instant,
}

#[derive(Default)]
struct PairingState {
    pending: HashMap<(String, String, String), PendingPairing>,
    approved: HashMap<(String, String), Vec<String>>,
}

/// Process-local pairing store, for single-process hosts and tests.
#[derive(Default)]
pub struct InMemoryPairingStore {
    state: Mutex<PairingState>,
}

impl InMemoryPairingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Approve a pending code. Returns the approved sender id.
    pub fn approve(&self, channel_type: &str, account_id: &str, code: &str) -> Option<String> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let key = state
            .pending
            .iter()
            .find(|((ch, acct, _), p)| {
                ch == channel_type && acct == account_id && p.code == code && now < p.expires_at
            })
            .map(|(k, _)| k.clone())?;
        state.pending.remove(&key);
        let (ch, acct, sender) = key;
        debug!(channel_type, account_id, sender_id = %sender, "pairing approved");
        state
            .approved
            .entry((ch, acct))
            .or_default()
            .push(sender.clone());
        Some(sender)
    }
}

#[async_trait]
impl PairingStore for InMemoryPairingStore {
    async fn upsert_request(
        &self,
        channel_type: &str,
        account_id: &str,
        sender_id: &str,
        _sender_name: Option<&str>,
    ) -> Result<PairingRequest> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let key = (
            channel_type.to_string(),
            account_id.to_string(),
            sender_id.to_string(),
        );

        if let Some(existing) = state.pending.get(&key)
            && now < existing.expires_at
        {
            return Ok(PairingRequest {
                code: existing.code.clone(),
                created: false,
            });
        }

        let code = generate_pairing_code();
        debug!(channel_type, account_id, sender_id, "pairing request created");
        state.pending.insert(key, PendingPairing {
            code: code.clone(),
            expires_at: now + PAIRING_TTL,
        });
        Ok(PairingRequest {
            code,
            created: true,
        })
    }

    async fn allow_list(&self, channel_type: &str, account_id: &str) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .approved
            .get(&(channel_type.to_string(), account_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

/// Eight characters from an alphabet without look-alikes (no 0/O, 1/I).
fn generate_pairing_code() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut rng = rand::rng();
    (0..8)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_request_reuses_code() {
        let store = InMemoryPairingStore::new();
        let first = store
            .upsert_request("wechat", "main", "wxid_a", None)
            .await
            .unwrap();
        assert!(first.created);
        let second = store
            .upsert_request("wechat", "main", "wxid_a", Some("Alice"))
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(first.code, second.code);
    }

    #[tokio::test]
    async fn approve_moves_sender_to_allow_list() {
        let store = InMemoryPairingStore::new();
        let req = store
            .upsert_request("wechat", "main", "wxid_a", None)
            .await
            .unwrap();
        assert!(store.allow_list("wechat", "main").await.unwrap().is_empty());
        assert_eq!(store.approve("wechat", "other", &req.code), None);
        assert_eq!(
            store.approve("wechat", "main", &req.code).as_deref(),
            Some("wxid_a")
        );
        assert_eq!(store.allow_list("wechat", "main").await.unwrap(), vec![
            "wxid_a".to_string()
        ]);
        // Code is single-use.
        assert_eq!(store.approve("wechat", "main", &req.code), None);
    }

    #[test]
    fn pairing_code_uses_unambiguous_alphabet() {
        for _ in 0..50 {
            let code = generate_pairing_code();
            assert_eq!(code.len(), 8);
            assert!(
                code.chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
            );
            assert!(!code.contains(['0', 'O', '1', 'I']));
        }
    }
}
