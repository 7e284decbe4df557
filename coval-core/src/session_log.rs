//! The per-(covalue, session) signed hash chain.
//!
//! Each appended transaction advances a rolling BLAKE3 hash
//! (`after[k] = H(after[k-1] ‖ canonical(tx[k]))`, seeded from the session
//! id) and the session agent signs the latest hash. Verification is
//! deterministic and idempotent: replaying a known entry reports
//! `Duplicate` without touching state. The log knows nothing about peers.

use thiserror::Error;

use crate::canonical::{canonical_bytes, CanonicalError};
use crate::crypto::hashing::Hash;
use crate::crypto::signing::{sign_hash, verify_hash, SignError};
use crate::ids::{SessionId, Signature, SignerSecret};
use crate::transaction::Transaction;

#[derive(Error, Debug)]
pub enum SessionLogError {
    #[error("signature does not verify under the session agent")]
    InvalidSignature,

    #[error("after-hash does not extend this session's chain")]
    InvalidHashChain,

    #[error("entry already present")]
    Duplicate,

    #[error("batch starts at {claimed} but the log has {have} transactions")]
    Gap { claimed: usize, have: usize },

    #[error("transaction cannot be canonicalized: {0}")]
    Canonical(#[from] CanonicalError),

    #[error(transparent)]
    Sign(#[from] SignError),
}

pub type Result<T> = std::result::Result<T, SessionLogError>;

#[derive(Clone, Debug)]
pub struct SessionLog {
    session_id: SessionId,
    transactions: Vec<Transaction>,
    /// Rolling hash after each transaction. Reproducible, kept for O(1)
    /// duplicate detection and slicing.
    after_hashes: Vec<Hash>,
    last_signature: Option<Signature>,
}

impl SessionLog {
    pub fn new(session_id: SessionId) -> Self {
        SessionLog {
            session_id,
            transactions: Vec::new(),
            after_hashes: Vec::new(),
            last_signature: None,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Transactions from `from_index` to the end, for sync backfill.
    pub fn slice(&self, from_index: usize) -> &[Transaction] {
        &self.transactions[from_index.min(self.transactions.len())..]
    }

    /// The chain hash after the last transaction, or the session seed for an
    /// empty log.
    pub fn last_hash(&self) -> Hash {
        self.after_hashes
            .last()
            .copied()
            .unwrap_or_else(|| self.chain_seed())
    }

    pub fn last_signature(&self) -> Option<&Signature> {
        self.last_signature.as_ref()
    }

    pub fn last_made_at(&self) -> Option<u64> {
        self.transactions.last().map(|tx| tx.made_at())
    }

    /// The chain is seeded with the hash of the session id, binding every
    /// chain to its session identity.
    fn chain_seed(&self) -> Hash {
        crate::crypto::hashing::secure_hash_value(&serde_json::Value::String(
            self.session_id.to_string(),
        ))
    }

    fn chain_step(prev: &Hash, tx: &Transaction) -> Result<Hash> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(prev.as_bytes());
        hasher.update(&canonical_bytes(tx)?);
        Ok(Hash(*hasher.finalize().as_bytes()))
    }

    /// Compute `(afterHash, signature)` for appending `tx` next, without
    /// mutating the log. Used by the local writer that owns this session.
    pub fn sign(&self, secret: &SignerSecret, tx: &Transaction) -> Result<(Hash, Signature)> {
        let after = Self::chain_step(&self.last_hash(), tx)?;
        Ok((after, sign_hash(secret, &after)))
    }

    /// Verify and append one transaction.
    pub fn try_add(&mut self, tx: Transaction, after_hash: Hash, signature: Signature) -> Result<()> {
        if self.after_hashes.contains(&after_hash) {
            return Err(SessionLogError::Duplicate);
        }
        let expected = Self::chain_step(&self.last_hash(), &tx)?;
        if expected != after_hash {
            return Err(SessionLogError::InvalidHashChain);
        }
        if !verify_hash(&signature, &after_hash, &self.session_id.agent.signer)? {
            return Err(SessionLogError::InvalidSignature);
        }
        self.transactions.push(tx);
        self.after_hashes.push(after_hash);
        self.last_signature = Some(signature);
        Ok(())
    }

    /// Verify and append a batch of transactions claimed to start after
    /// index `after`, signed once over the final chain hash.
    ///
    /// Overlap with already-known transactions is skipped; a batch that is
    /// entirely known reports `Duplicate`. A batch starting past the end of
    /// the log is a `Gap` (the peer ignored our known state).
    pub fn try_add_batch(
        &mut self,
        after: usize,
        new_transactions: &[Transaction],
        last_signature: Signature,
    ) -> Result<usize> {
        let have = self.transactions.len();
        if after > have {
            return Err(SessionLogError::Gap {
                claimed: after,
                have,
            });
        }
        let fresh = &new_transactions[(have - after).min(new_transactions.len())..];
        if fresh.is_empty() {
            return Err(SessionLogError::Duplicate);
        }

        let mut hash = self.last_hash();
        let mut hashes = Vec::with_capacity(fresh.len());
        for tx in fresh {
            hash = Self::chain_step(&hash, tx)?;
            hashes.push(hash);
        }
        if !verify_hash(&last_signature, &hash, &self.session_id.agent.signer)? {
            return Err(SessionLogError::InvalidSignature);
        }

        self.transactions.extend_from_slice(fresh);
        self.after_hashes.append(&mut hashes);
        self.last_signature = Some(last_signature);
        Ok(fresh.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sealing::generate_sealer_keypair;
    use crate::crypto::signing::generate_signing_keypair;
    use crate::ids::{AgentId, SignerSecret};
    use serde_json::json;

    fn test_session() -> (SessionId, SignerSecret) {
        let (signer, signer_secret) = generate_signing_keypair();
        let (sealer, _) = generate_sealer_keypair();
        let agent = AgentId { sealer, signer };
        (SessionId::random(agent), signer_secret)
    }

    fn tx(made_at: u64, n: u64) -> Transaction {
        Transaction::Trusting {
            made_at,
            changes: vec![json!({"op": "set", "key": "n", "value": n})],
        }
    }

    #[test]
    fn test_sign_then_add() {
        let (session, secret) = test_session();
        let mut log = SessionLog::new(session);

        let t = tx(1, 0);
        let (after, sig) = log.sign(&secret, &t).unwrap();
        log.try_add(t, after, sig).unwrap();

        assert_eq!(log.len(), 1);
        assert_eq!(log.last_hash(), after);
        assert_eq!(log.last_signature(), Some(&sig));
    }

    #[test]
    fn test_chain_links_every_prefix() {
        let (session, secret) = test_session();
        let mut log = SessionLog::new(session);
        let mut hashes = Vec::new();

        for i in 0..5 {
            let t = tx(i + 1, i);
            let (after, sig) = log.sign(&secret, &t).unwrap();
            log.try_add(t, after, sig).unwrap();
            hashes.push(after);
        }

        // Recompute every prefix hash from scratch.
        let mut prev = SessionLog::new(log.session_id().clone()).last_hash();
        for (i, t) in log.transactions().iter().enumerate() {
            prev = SessionLog::chain_step(&prev, t).unwrap();
            assert_eq!(prev, hashes[i]);
        }
    }

    #[test]
    fn test_replay_is_duplicate() {
        let (session, secret) = test_session();
        let mut log = SessionLog::new(session);

        let t = tx(1, 0);
        let (after, sig) = log.sign(&secret, &t).unwrap();
        log.try_add(t.clone(), after, sig).unwrap();

        assert!(matches!(
            log.try_add(t, after, sig),
            Err(SessionLogError::Duplicate)
        ));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_wrong_signer_rejected() {
        let (session, _) = test_session();
        let (_, other_secret) = generate_signing_keypair();
        let mut log = SessionLog::new(session);

        let t = tx(1, 0);
        let (after, sig) = log.sign(&other_secret, &t).unwrap();
        assert!(matches!(
            log.try_add(t, after, sig),
            Err(SessionLogError::InvalidSignature)
        ));
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn test_broken_chain_rejected() {
        let (session, secret) = test_session();
        let mut log = SessionLog::new(session);

        let t = tx(1, 0);
        let (_, sig) = log.sign(&secret, &t).unwrap();
        let bogus = Hash([0xAB; 32]);
        assert!(matches!(
            log.try_add(t, bogus, sig),
            Err(SessionLogError::InvalidHashChain)
        ));
    }

    #[test]
    fn test_batch_roundtrip() {
        let (session, secret) = test_session();

        // Writer's log.
        let mut writer = SessionLog::new(session.clone());
        for i in 0..4 {
            let t = tx(i + 1, i);
            let (after, sig) = writer.sign(&secret, &t).unwrap();
            writer.try_add(t, after, sig).unwrap();
        }

        // Replica ingests the full batch at once.
        let mut replica = SessionLog::new(session);
        let added = replica
            .try_add_batch(0, writer.transactions(), *writer.last_signature().unwrap())
            .unwrap();
        assert_eq!(added, 4);
        assert_eq!(replica.last_hash(), writer.last_hash());
    }

    #[test]
    fn test_batch_skips_overlap() {
        let (session, secret) = test_session();
        let mut writer = SessionLog::new(session.clone());
        for i in 0..4 {
            let t = tx(i + 1, i);
            let (after, sig) = writer.sign(&secret, &t).unwrap();
            writer.try_add(t, after, sig).unwrap();
        }

        let mut replica = SessionLog::new(session);
        replica
            .try_add_batch(0, &writer.transactions()[..2], {
                // Signature over the first two entries only.
                let mut partial = SessionLog::new(replica.session_id().clone());
                for t in &writer.transactions()[..2] {
                    let (after, sig) = partial.sign(&secret, t).unwrap();
                    partial.try_add(t.clone(), after, sig).unwrap();
                }
                *partial.last_signature().unwrap()
            })
            .unwrap();

        // Batch [0..4) overlaps the two known entries.
        let added = replica
            .try_add_batch(0, writer.transactions(), *writer.last_signature().unwrap())
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(replica.len(), 4);
        assert_eq!(replica.last_hash(), writer.last_hash());
    }

    #[test]
    fn test_batch_with_gap_rejected() {
        let (session, secret) = test_session();
        let mut writer = SessionLog::new(session.clone());
        for i in 0..3 {
            let t = tx(i + 1, i);
            let (after, sig) = writer.sign(&secret, &t).unwrap();
            writer.try_add(t, after, sig).unwrap();
        }

        let mut replica = SessionLog::new(session);
        let result = replica.try_add_batch(
            2,
            writer.slice(2),
            *writer.last_signature().unwrap(),
        );
        assert!(matches!(result, Err(SessionLogError::Gap { claimed: 2, have: 0 })));
    }

    #[test]
    fn test_two_sessions_same_content_diverging_chains() {
        let (session_a, secret) = test_session();
        let (session_b, _) = test_session();

        let a_seed = SessionLog::new(session_a).last_hash();
        let b_seed = SessionLog::new(session_b).last_hash();
        assert_ne!(a_seed, b_seed);
        let _ = secret;
    }
}
