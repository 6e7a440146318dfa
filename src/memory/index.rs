//! Exact nearest-neighbour index over record embeddings.
//!
//! Row `i` of the index is the embedding of the `i`-th record in insertion
//! order. The index owns no record data and can always be rebuilt from the
//! JSON log.

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::io::{Read as _, Write as _};

const SNAPSHOT_MAGIC: &[u8; 4] = b"AMIX";
const SNAPSHOT_VERSION: u8 = 1;
const HEADER_LEN: usize = SNAPSHOT_MAGIC.len() + 1 + FINGERPRINT_LEN;

/// Length of the log fingerprint stored in a snapshot.
pub const FINGERPRINT_LEN: usize = 32;

/// SHA-256 of the JSON log a snapshot was built from.
pub type Fingerprint = [u8; FINGERPRINT_LEN];

/// Cosine distance `1 - cos(a, b)`.
///
/// A zero-norm operand has no direction, so it sits at distance 1.0 from
/// everything.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    let cosine = (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0);
    1.0 - cosine
}

/// Flat, brute-force vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    dimension: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }

    /// Build an index from rows in order.
    ///
    /// Returns the position of the first row with the wrong length on failure.
    pub fn from_rows<'a>(
        dimension: usize,
        rows: impl IntoIterator<Item = &'a [f32]>,
    ) -> Result<Self, usize> {
        let mut index = Self::new(dimension);
        for (position, row) in rows.into_iter().enumerate() {
            if row.len() != dimension {
                return Err(position);
            }
            index.data.extend_from_slice(row);
        }
        Ok(index)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append a row. The caller guarantees the length.
    pub fn push(&mut self, row: &[f32]) {
        debug_assert_eq!(row.len(), self.dimension);
        self.data.extend_from_slice(row);
    }

    /// Drop every row at position `len` and beyond.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len * self.dimension);
    }

    pub fn row(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dimension)?;
        self.data.get(start..start + self.dimension)
    }

    /// The `k` rows closest to `query`, as `(position, distance)`.
    ///
    /// Ordered by ascending distance; equal distances keep insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        if k == 0 || self.dimension == 0 {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f32)> = self
            .data
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(position, row)| (position, cosine_distance(query, row)))
            .collect();

        // Stable sort, so ties stay in insertion order.
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.truncate(k);
        scored
    }

    /// Serialize into the snapshot format.
    pub fn encode_snapshot(&self, fingerprint: &Fingerprint) -> std::io::Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.data.len());
        bytes.extend_from_slice(SNAPSHOT_MAGIC);
        bytes.push(SNAPSHOT_VERSION);
        bytes.extend_from_slice(fingerprint);

        let mut encoder = ZlibEncoder::new(bytes, Compression::fast());
        encoder.write_all(&(self.dimension as u32).to_le_bytes())?;
        encoder.write_all(&(self.len() as u64).to_le_bytes())?;
        for value in &self.data {
            encoder.write_all(&value.to_le_bytes())?;
        }
        encoder.finish()
    }

    /// Parse a snapshot, returning the fingerprint it was built from.
    pub fn decode_snapshot(bytes: &[u8]) -> Result<(Fingerprint, Self), String> {
        if bytes.len() < HEADER_LEN {
            return Err("snapshot is truncated".into());
        }
        if &bytes[..SNAPSHOT_MAGIC.len()] != SNAPSHOT_MAGIC {
            return Err("not an index snapshot".into());
        }
        let version = bytes[SNAPSHOT_MAGIC.len()];
        if version != SNAPSHOT_VERSION {
            return Err(format!("unsupported snapshot version {version}"));
        }

        let mut fingerprint = [0u8; FINGERPRINT_LEN];
        fingerprint.copy_from_slice(&bytes[SNAPSHOT_MAGIC.len() + 1..HEADER_LEN]);

        let mut payload = Vec::new();
        ZlibDecoder::new(&bytes[HEADER_LEN..])
            .read_to_end(&mut payload)
            .map_err(|error| format!("snapshot payload is unreadable: {error}"))?;

        if payload.len() < 12 {
            return Err("snapshot payload is truncated".into());
        }
        let dimension = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
        let mut rows_bytes = [0u8; 8];
        rows_bytes.copy_from_slice(&payload[4..12]);
        let rows = u64::from_le_bytes(rows_bytes) as usize;

        let body = &payload[12..];
        let expected = rows
            .checked_mul(dimension)
            .and_then(|values| values.checked_mul(4))
            .ok_or_else(|| "snapshot header overflows".to_string())?;
        if body.len() != expected {
            return Err(format!(
                "snapshot holds {} bytes of vectors, header promises {expected}",
                body.len()
            ));
        }

        let data = body
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        Ok((fingerprint, Self { dimension, data }))
    }
}
