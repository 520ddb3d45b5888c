//! Document handle: thin ownership wrapper around one `yrs::Doc`.
//!
//! The handle exposes exactly what the sync path needs — state-vector and
//! diff encoding, origin-tagged update application, and update observation.
//! CRDT merge semantics stay inside yrs; nothing here re-implements them.
//!
//! Origin tagging is what keeps the sync loop echo-free: remote updates are
//! applied inside a transaction tagged with the owning client's instance
//! origin, so the update observer can tell a genuinely local edit (no origin,
//! or a foreign one) from the echo of a remote apply.
//!
//! Reference: Kleppmann — DDIA, Chapter 5 (Replication)

use tokio::sync::mpsc::UnboundedSender;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Origin, ReadTxn, StateVector, Subscription, Transact, Update};

use crate::protocol::SyncOp;

/// One observed document mutation, local or applied-remote.
#[derive(Debug, Clone)]
pub struct DocUpdate {
    /// v1-encoded incremental update.
    pub update: Vec<u8>,
    /// Transaction origin; `None` for untagged local edits.
    pub origin: Option<Origin>,
}

/// Owning wrapper around a `yrs::Doc`.
///
/// Clones share the same underlying document store.
#[derive(Debug, Clone)]
pub struct DocHandle {
    doc: Doc,
}

impl DocHandle {
    /// Create a handle over a fresh document.
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Wrap an existing document, carrying over any unsynced local edits.
    pub fn from_doc(doc: Doc) -> Self {
        Self { doc }
    }

    /// The yrs client id backing this document.
    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    /// Direct access for content edits (text/map roots and transactions).
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Encode the current state vector (v1).
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode everything a peer with `remote_state_vector` is missing (v1).
    pub fn diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, DocError> {
        let sv = StateVector::decode_v1(remote_state_vector)?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Encode the full document history as one update (v1).
    pub fn full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Apply a v1-encoded update inside a transaction tagged with `origin`.
    pub fn apply_update(&self, update: &[u8], origin: &Origin) -> Result<(), DocError> {
        let update = Update::decode_v1(update)?;
        let mut txn = self.doc.transact_mut_with(origin.clone());
        txn.apply_update(update)
            .map_err(|e| DocError::Apply(e.to_string()))
    }

    /// Interpret one inbound sync op, returning the reply op if one is due.
    ///
    /// Step 1 asks for state and produces a step 2 answer; step 2 and update
    /// carry state and are applied under `origin`.
    pub fn handle_sync_op(&self, op: SyncOp, origin: &Origin) -> Result<Option<SyncOp>, DocError> {
        match op {
            SyncOp::Step1(remote_sv) => Ok(Some(SyncOp::Step2(self.diff(&remote_sv)?))),
            SyncOp::Step2(update) | SyncOp::Update(update) => {
                self.apply_update(&update, origin)?;
                Ok(None)
            }
        }
    }

    /// Forward every committed update into `tx` until the returned guard is
    /// dropped.
    pub fn observe(&self, tx: UnboundedSender<DocUpdate>) -> Result<Subscription, DocError> {
        self.doc
            .observe_update_v1(move |txn, event| {
                let _ = tx.send(DocUpdate {
                    update: event.update.clone(),
                    origin: txn.origin().cloned(),
                });
            })
            .map_err(|e| DocError::Subscribe(e.to_string()))
    }
}

impl Default for DocHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Document-layer errors.
#[derive(Debug, Clone)]
pub enum DocError {
    /// Update or state-vector bytes failed to decode.
    Decode(String),
    /// yrs rejected an otherwise well-formed update.
    Apply(String),
    /// Update observer could not be registered.
    Subscribe(String),
}

impl From<yrs::encoding::read::Error> for DocError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        DocError::Decode(e.to_string())
    }
}

impl std::fmt::Display for DocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "Update decode error: {e}"),
            Self::Apply(e) => write!(f, "Update apply error: {e}"),
            Self::Subscribe(e) => write!(f, "Observer registration error: {e}"),
        }
    }
}

impl std::error::Error for DocError {}
