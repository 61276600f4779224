//! Tar shards streamed into an [`ObjectStore`]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ArchiveError;
use crate::record::FetchedRecord;
use crate::sink::{ObjectStore, ShardWriter};

/// Fixed archive extension for shard names
pub const SHARD_EXTENSION: &str = "tar";

/// `<prefix><sequence>.tar`
pub fn shard_name(prefix: &str, seq: u64) -> String {
    format!("{prefix}{seq}.{SHARD_EXTENSION}")
}

/// Run-wide shard sequence; the first shard is 1.
#[derive(Debug, Default)]
pub struct ShardSequence(AtomicU64);

impl ShardSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Highest sequence number handed out so far
    pub fn last(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// An open shard: a tar stream being written to the sink.
pub struct Shard {
    seq: u64,
    name: String,
    size: u64,
    members: Vec<String>,
    builder: tar::Builder<Box<dyn ShardWriter>>,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("members", &self.members.len())
            .finish_non_exhaustive()
    }
}

/// What remains of a shard after finalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedShard {
    pub seq: u64,
    pub name: String,
    /// Cumulative payload bytes
    pub size: u64,
    /// Source locators in append order
    pub members: Vec<String>,
}

impl Shard {
    pub fn open(store: &dyn ObjectStore, prefix: &str, seq: u64) -> Result<Self, ArchiveError> {
        let name = shard_name(prefix, seq);
        let writer = store
            .open_write(&name)
            .map_err(|source| ArchiveError::Open {
                name: name.clone(),
                source,
            })?;
        Ok(Self {
            seq,
            name,
            size: 0,
            members: Vec::new(),
            builder: tar::Builder::new(writer),
        })
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cumulative payload bytes appended so far
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// Whether `len` more payload bytes stay within `max`.
    pub fn fits(&self, len: u64, max: u64) -> bool {
        self.size.saturating_add(len) <= max
    }

    /// Append one record: PAX attributes `<namespace><key>` for its metadata,
    /// then a regular-file entry holding the payload.
    pub fn append(&mut self, record: &FetchedRecord, namespace: &str) -> Result<(), ArchiveError> {
        let pax: Vec<(String, &[u8])> = record
            .metadata
            .iter()
            .map(|(k, v)| (format!("{namespace}{k}"), v.as_bytes()))
            .collect();

        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(record.len());
        header.set_mode(0o600);
        header.set_mtime(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        );

        self.builder
            .append_pax_extensions(pax.iter().map(|(k, v)| (k.as_str(), *v)))
            .and_then(|()| {
                self.builder
                    .append_data(&mut header, &record.name, record.data.as_slice())
            })
            .map_err(|source| ArchiveError::Encode {
                name: self.name.clone(),
                source,
            })?;

        self.members.push(record.url.clone());
        self.size += record.len();
        Ok(())
    }

    /// Finish the tar stream, then commit it to the sink.
    ///
    /// The closed shard is returned even when the commit fails so its members
    /// can be re-queued.
    pub fn finalize(self) -> (ClosedShard, Result<(), ArchiveError>) {
        let Self {
            seq,
            name,
            size,
            members,
            builder,
        } = self;

        let result = match builder.into_inner() {
            Ok(writer) => writer.commit().map_err(|source| ArchiveError::Commit {
                name: name.clone(),
                source,
            }),
            Err(source) => Err(ArchiveError::Encode {
                name: name.clone(),
                source,
            }),
        };

        (
            ClosedShard {
                seq,
                name,
                size,
                members,
            },
            result,
        )
    }
}
