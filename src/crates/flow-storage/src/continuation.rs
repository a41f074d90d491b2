//! Persistence of suspended program state
//!
//! [`ContinuationStore`] stores the opaque bytes of a run's continuation in a
//! single unit, `program.dat`. It never looks inside the payload.
//!
//! # Validity
//!
//! The unit is a bincode envelope:
//!
//! ```text
//! ┌──────────┬────────────┬──────────────────┬─────────────┐
//! │ magic    │ generation │ sha256(payload)  │ payload     │
//! └──────────┴────────────┴──────────────────┴─────────────┘
//! ```
//!
//! Each [`persist`](ContinuationStore::persist) bumps the generation and
//! returns a [`ContinuationHandle`] naming it. [`load`](ContinuationStore::load)
//! yields the payload only when the envelope decodes, the magic matches, the
//! generation is the one the handle names, and the digest matches the payload.
//! Anything else - a missing unit, a torn write, a stale handle - is reported
//! as `None`, never as a half-valid continuation.

use crate::atomic::write_atomic;
use crate::error::Result;
use crate::serializer::{BincodeSerializer, SerializerProtocol};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;

/// File name of the continuation unit inside a run directory
pub const CONTINUATION_FILE: &str = "program.dat";

const MAGIC: [u8; 4] = *b"DFC1";

/// Reference to one persisted continuation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationHandle {
    pub generation: u64,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    magic: [u8; 4],
    generation: u64,
    digest: [u8; 32],
    payload: Vec<u8>,
}

/// Store for a single run's continuation
#[derive(Debug)]
pub struct ContinuationStore {
    path: PathBuf,
    generation: u64,
    serializer: BincodeSerializer,
}

impl ContinuationStore {
    /// Open the continuation unit for `run_dir`.
    ///
    /// `last` is the newest handle the caller knows about; new generations
    /// continue after it so a stale handle can never match a newer write.
    pub fn open(run_dir: &Path, last: Option<ContinuationHandle>) -> Self {
        Self {
            path: run_dir.join(CONTINUATION_FILE),
            generation: last.map(|h| h.generation).unwrap_or(0),
            serializer: BincodeSerializer::new(),
        }
    }

    /// Durably store `payload`, replacing any previous continuation
    pub async fn persist(&mut self, payload: &[u8]) -> Result<ContinuationHandle> {
        let generation = self.generation + 1;
        let envelope = Envelope {
            magic: MAGIC,
            generation,
            digest: Sha256::digest(payload).into(),
            payload: payload.to_vec(),
        };

        let bytes = self.serializer.dumps(&envelope)?;
        write_atomic(&self.path, &bytes, true).await?;
        self.generation = generation;

        tracing::debug!(
            path = %self.path.display(),
            generation,
            bytes = payload.len(),
            "Persisted continuation"
        );
        Ok(ContinuationHandle { generation })
    }

    /// Load the continuation named by `handle`, or `None` if it is not
    /// available in full
    pub async fn load(&self, handle: &ContinuationHandle) -> Option<Vec<u8>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %e, "Failed to read continuation");
                }
                return None;
            }
        };

        let envelope: Envelope = match self.serializer.loads(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Continuation envelope is corrupt");
                return None;
            }
        };

        if envelope.magic != MAGIC {
            tracing::warn!(path = %self.path.display(), "Continuation has unknown format");
            return None;
        }
        if envelope.generation != handle.generation {
            tracing::warn!(
                path = %self.path.display(),
                expected = handle.generation,
                found = envelope.generation,
                "Continuation generation does not match handle"
            );
            return None;
        }
        let digest: [u8; 32] = Sha256::digest(&envelope.payload).into();
        if digest != envelope.digest {
            tracing::warn!(path = %self.path.display(), "Continuation digest mismatch");
            return None;
        }

        Some(envelope.payload)
    }

    /// Remove the stored continuation
    pub async fn discard(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a continuation unit exists on disk, valid or not
    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}
