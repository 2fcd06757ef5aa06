//! Commit journal.
//!
//! Every write transaction is persisted as one framed record before the
//! in-memory state changes, which is what makes a reconciliation batch
//! (entities plus checkpoint) all-or-nothing across restarts.
//!
//! ## Record format
//!
//! ```text
//! | magic (4) | version (2) | kind (1) | length (4) | CBOR payload | crc32 (4) |
//! ```
//!
//! Integers are little-endian; the CRC covers every byte before it.
//!
//! ## Recovery
//!
//! - A truncated trailing record (torn write) ends the journal and is cut off
//! - A checksum mismatch, bad magic, unknown kind, or unknown version is fatal

use crate::error::{CacheError, CacheResult};
use crate::state::{CacheState, Mutation, Snapshot};
use kinvey_storage::StorageBackend;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Magic bytes identifying a journal record.
pub const JOURNAL_MAGIC: [u8; 4] = *b"KVCJ";

/// Current journal format version.
pub const JOURNAL_VERSION: u16 = 1;

/// magic (4) + version (2) + kind (1) + length (4)
const HEADER_SIZE: usize = 11;

const CRC_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordKind {
    Commit = 1,
    Snapshot = 2,
}

impl RecordKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Commit),
            2 => Some(Self::Snapshot),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CommitPayload {
    seq: u64,
    mutations: Vec<Mutation>,
}

#[derive(Debug)]
enum Record {
    Commit(CommitPayload),
    Snapshot(Snapshot),
}

/// Owns the storage backend and appends commit records to it.
pub(crate) struct Journal {
    backend: Box<dyn StorageBackend>,
    sync_on_commit: bool,
    next_seq: u64,
}

impl Journal {
    pub fn new(backend: Box<dyn StorageBackend>, sync_on_commit: bool) -> Self {
        Self {
            backend,
            sync_on_commit,
            next_seq: 1,
        }
    }

    /// Rebuilds the cache state from the journal.
    ///
    /// A torn trailing record is removed from storage so later appends
    /// start on a record boundary.
    pub fn replay(&mut self) -> CacheResult<CacheState> {
        let bytes = self.backend.read_all()?;
        let (records, valid_len) = decode_records(&bytes)?;

        let mut state = CacheState::default();
        let mut last_seq = 0;
        let mut commits = 0usize;
        for record in records {
            match record {
                Record::Snapshot(snapshot) => {
                    state = CacheState::from_snapshot(snapshot);
                }
                Record::Commit(commit) => {
                    if commit.seq <= last_seq {
                        return Err(CacheError::corrupted(format!(
                            "commit sequence went backwards: {} after {}",
                            commit.seq, last_seq
                        )));
                    }
                    last_seq = commit.seq;
                    commits += 1;
                    for mutation in commit.mutations {
                        state.apply(mutation);
                    }
                }
            }
        }

        if (valid_len as u64) < bytes.len() as u64 {
            warn!(
                valid_len,
                total_len = bytes.len(),
                "discarding torn record at end of cache journal"
            );
            self.backend.truncate(valid_len as u64)?;
        }

        self.next_seq = last_seq + 1;
        debug!(commits, bytes = valid_len, "cache journal replayed");
        Ok(state)
    }

    /// Durably appends one commit.
    ///
    /// On failure the journal is cut back to its previous length so a
    /// partial record never precedes later commits.
    pub fn append_commit(&mut self, mutations: &[Mutation]) -> CacheResult<()> {
        let payload = CommitPayload {
            seq: self.next_seq,
            mutations: mutations.to_vec(),
        };
        let frame = encode_record(RecordKind::Commit, &payload)?;

        let before = self.backend.size()?;
        if let Err(err) = self.write_frame(&frame) {
            if let Err(rollback) = self.backend.truncate(before) {
                warn!(error = %rollback, "failed to roll back partial journal append");
            }
            return Err(err);
        }
        self.next_seq += 1;
        Ok(())
    }

    fn write_frame(&mut self, frame: &[u8]) -> CacheResult<()> {
        self.backend.append(frame)?;
        if self.sync_on_commit {
            self.backend.sync()?;
        } else {
            self.backend.flush()?;
        }
        Ok(())
    }

    /// Replaces the whole journal with one snapshot of `state`.
    pub fn compact(&mut self, state: &CacheState) -> CacheResult<()> {
        let before = self.backend.size()?;
        let frame = encode_record(RecordKind::Snapshot, &state.to_snapshot())?;
        self.backend.replace(&frame)?;
        debug!(before, after = frame.len(), "cache journal compacted");
        Ok(())
    }

    pub fn size(&self) -> CacheResult<u64> {
        Ok(self.backend.size()?)
    }
}

fn encode_record<T: Serialize>(kind: RecordKind, payload: &T) -> CacheResult<Vec<u8>> {
    let mut body = Vec::new();
    ciborium::into_writer(payload, &mut body)
        .map_err(|e| CacheError::Codec(format!("failed to encode journal record: {e}")))?;
    let len = u32::try_from(body.len())
        .map_err(|_| CacheError::Codec("journal record payload too large".into()))?;

    let mut data = Vec::with_capacity(HEADER_SIZE + body.len() + CRC_SIZE);
    data.extend_from_slice(&JOURNAL_MAGIC);
    data.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
    data.push(kind as u8);
    data.extend_from_slice(&len.to_le_bytes());
    data.extend_from_slice(&body);
    let crc = compute_crc32(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    Ok(data)
}

/// Decodes every complete record; returns them with the length of the
/// valid prefix.
fn decode_records(bytes: &[u8]) -> CacheResult<(Vec<Record>, usize)> {
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < bytes.len() {
        let rest = &bytes[offset..];
        if rest.len() < HEADER_SIZE {
            break;
        }
        if rest[0..4] != JOURNAL_MAGIC {
            return Err(CacheError::corrupted(format!("bad record magic at offset {offset}")));
        }
        let version = u16::from_le_bytes([rest[4], rest[5]]);
        if version != JOURNAL_VERSION {
            return Err(CacheError::UnsupportedVersion { version });
        }
        let kind_byte = rest[6];
        let len = u32::from_le_bytes([rest[7], rest[8], rest[9], rest[10]]) as usize;
        let total = HEADER_SIZE + len + CRC_SIZE;
        if rest.len() < total {
            break;
        }

        let body_end = HEADER_SIZE + len;
        let expected = u32::from_le_bytes([
            rest[body_end],
            rest[body_end + 1],
            rest[body_end + 2],
            rest[body_end + 3],
        ]);
        let actual = compute_crc32(&rest[..body_end]);
        if expected != actual {
            return Err(CacheError::ChecksumMismatch {
                offset: offset as u64,
                expected,
                actual,
            });
        }

        let body = &rest[HEADER_SIZE..body_end];
        let record = match RecordKind::from_byte(kind_byte) {
            Some(RecordKind::Commit) => Record::Commit(decode_payload(body)?),
            Some(RecordKind::Snapshot) => Record::Snapshot(decode_payload(body)?),
            None => {
                return Err(CacheError::corrupted(format!(
                    "unknown record kind {kind_byte} at offset {offset}"
                )))
            }
        };
        records.push(record);
        offset += total;
    }

    Ok((records, offset))
}

fn decode_payload<T: for<'de> Deserialize<'de>>(body: &[u8]) -> CacheResult<T> {
    ciborium::from_reader(body)
        .map_err(|e| CacheError::Codec(format!("failed to decode journal record: {e}")))
}

/// CRC-32 (IEEE) checksum.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    !data.iter().fold(0xFFFF_FFFF_u32, |crc, &byte| {
        (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize]
    })
}
