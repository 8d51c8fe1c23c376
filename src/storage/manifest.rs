//! The manifest: ordered list of segments defining the canonical log for a
//! branch. Replaced atomically; never edited in place.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::segment::SegmentMeta;
use super::{manifest_path, BlobStore, StorageError};

/// Current manifest format version.
const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: u32,
    pub branch: String,
    /// Sorted by `min_id`; adjacent segments never overlap on id ranges.
    pub segments: Vec<SegmentMeta>,
    pub last_event_id: Option<String>,
    pub last_event_ts: Option<i64>,
}

impl Manifest {
    pub fn empty(branch: &str) -> Self {
        Self {
            version: MANIFEST_VERSION,
            branch: branch.to_string(),
            segments: Vec::new(),
            last_event_id: None,
            last_event_ts: None,
        }
    }

    /// Insert a segment keeping `segments` sorted by `min_id`, and advance the
    /// last-event tracking monotonically.
    pub fn add_segment(&mut self, segment: SegmentMeta) {
        if self
            .last_event_id
            .as_ref()
            .map(|last| segment.max_id > *last)
            .unwrap_or(true)
        {
            self.last_event_id = Some(segment.max_id.clone());
        }
        if self
            .last_event_ts
            .map(|last| segment.max_ts > last)
            .unwrap_or(true)
        {
            self.last_event_ts = Some(segment.max_ts);
        }

        let pos = self
            .segments
            .partition_point(|s| s.min_id <= segment.min_id);
        self.segments.insert(pos, segment);
    }

    /// Drop a segment by checksum. Last-event tracking is not rewound; the
    /// log's high-water mark only moves forward.
    pub fn remove_segment(&mut self, checksum: &str) -> bool {
        let before = self.segments.len();
        self.segments.retain(|s| s.checksum != checksum);
        self.segments.len() != before
    }

    pub fn total_events(&self) -> u64 {
        self.segments.iter().map(|s| s.count).sum()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Segments whose ts bounds intersect `[min_ts, max_ts]`.
    pub fn find_segments_in_range(&self, min_ts: i64, max_ts: i64) -> Vec<&SegmentMeta> {
        self.segments
            .iter()
            .filter(|s| s.max_ts >= min_ts && s.min_ts <= max_ts)
            .collect()
    }

    /// The segment whose id range covers the given event id.
    pub fn find_segment_for_event(&self, event_id: &str) -> Option<&SegmentMeta> {
        self.segments
            .iter()
            .find(|s| s.min_id.as_str() <= event_id && event_id <= s.max_id.as_str())
    }

    /// Check the non-overlap invariant between adjacent segments.
    pub fn check_invariants(&self) -> Result<(), StorageError> {
        for pair in self.segments.windows(2) {
            if pair[0].max_id >= pair[1].min_id {
                return Err(StorageError::InvalidSegment(format!(
                    "segments '{}' and '{}' overlap on id range",
                    pair[0].file, pair[1].file
                )));
            }
        }
        Ok(())
    }

    /// Load a branch manifest. A missing manifest means a fresh store.
    pub fn load(blob: &dyn BlobStore, branch: &str) -> Result<Option<Self>, StorageError> {
        let path = manifest_path(branch);
        if !blob.exists(&path)? {
            return Ok(None);
        }
        let bytes = blob.read(&path)?;
        let manifest: Manifest = serde_json::from_slice(&bytes)?;
        Ok(Some(manifest))
    }

    /// Atomically replace the branch manifest.
    pub fn save(&self, blob: &dyn BlobStore) -> Result<(), StorageError> {
        let path = manifest_path(&self.branch);
        let bytes = serde_json::to_vec_pretty(self)?;
        blob.write_atomic(&path, &bytes)?;
        debug!(
            "Saved manifest for '{}' with {} segments",
            self.branch,
            self.segments.len()
        );
        Ok(())
    }
}
