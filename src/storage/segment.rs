//! Event segments: immutable Parquet files holding an ordered run of events.
//!
//! Segments are content-addressable: the file name is derived from the sha256
//! checksum of the encoded bytes, so identical event content produces an
//! identical segment file. Rows are sorted ascending by event id and row
//! groups carry min/max statistics for `id` and `ts`.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::models::{Event, EventOp};

use super::parquet::{ColumnType, ColumnValue, ParquetCodec, TableColumn, TableSchema};
use super::{segment_path, BlobStore, StorageError};

/// Segment metadata as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMeta {
    pub file: String,
    pub min_id: String,
    pub max_id: String,
    pub min_ts: i64,
    pub max_ts: i64,
    pub count: u64,
    /// sha256 of the segment bytes; the only content identity.
    pub checksum: String,
}

/// Options for segment writing.
#[derive(Debug, Clone)]
pub struct SegmentWriteOptions {
    pub branch: String,
    /// Split threshold for multi-segment writes. Use `usize::MAX` to force a
    /// single segment (compaction does).
    pub max_events_per_segment: usize,
}

impl SegmentWriteOptions {
    pub fn new(branch: &str, max_events_per_segment: usize) -> Self {
        Self {
            branch: branch.to_string(),
            max_events_per_segment: max_events_per_segment.max(1),
        }
    }
}

/// Parquet schema of a segment file.
pub fn event_table_schema() -> TableSchema {
    TableSchema::new(vec![
        TableColumn::required("id", ColumnType::String),
        TableColumn::required("ts", ColumnType::Int64),
        TableColumn::required("op", ColumnType::String),
        TableColumn::required("target", ColumnType::String),
        TableColumn::optional("actor", ColumnType::String),
        TableColumn::optional("before", ColumnType::String),
        TableColumn::optional("after", ColumnType::String),
        TableColumn::optional("metadata", ColumnType::String),
    ])
}

/// Events must be non-decreasing by id before they can form a segment.
pub fn validate_event_order(events: &[Event]) -> Result<(), StorageError> {
    for pair in events.windows(2) {
        if pair[1].id < pair[0].id {
            return Err(StorageError::InvalidSegment(format!(
                "event '{}' out of order after '{}'",
                pair[1].id, pair[0].id
            )));
        }
    }
    Ok(())
}

/// Drop duplicate event ids, keeping the first occurrence.
pub fn deduplicate_events(events: Vec<Event>) -> Vec<Event> {
    let mut seen = HashSet::new();
    events
        .into_iter()
        .filter(|e| seen.insert(e.id.clone()))
        .collect()
}

fn encode_json_opt(value: &Option<Value>) -> Result<ColumnValue, StorageError> {
    match value {
        Some(v) => Ok(ColumnValue::Str(serde_json::to_string(v)?)),
        None => Ok(ColumnValue::Null),
    }
}

fn encode_events(events: &[Event]) -> Result<Vec<Vec<ColumnValue>>, StorageError> {
    let mut ids = Vec::with_capacity(events.len());
    let mut tss = Vec::with_capacity(events.len());
    let mut ops = Vec::with_capacity(events.len());
    let mut targets = Vec::with_capacity(events.len());
    let mut actors = Vec::with_capacity(events.len());
    let mut befores = Vec::with_capacity(events.len());
    let mut afters = Vec::with_capacity(events.len());
    let mut metadatas = Vec::with_capacity(events.len());

    for event in events {
        ids.push(ColumnValue::Str(event.id.clone()));
        tss.push(ColumnValue::Int(event.ts));
        ops.push(ColumnValue::Str(event.op.as_str().to_string()));
        targets.push(ColumnValue::Str(event.target.clone()));
        actors.push(match &event.actor {
            Some(actor) => ColumnValue::Str(actor.to_string()),
            None => ColumnValue::Null,
        });
        befores.push(encode_json_opt(&event.before)?);
        afters.push(encode_json_opt(&event.after)?);
        metadatas.push(encode_json_opt(&event.metadata)?);
    }

    Ok(vec![ids, tss, ops, targets, actors, befores, afters, metadatas])
}

fn decode_event(row: serde_json::Map<String, Value>) -> Result<Event, StorageError> {
    let get_str = |row: &serde_json::Map<String, Value>, key: &str| -> Result<String, StorageError> {
        row.get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| StorageError::InvalidSegment(format!("missing column '{}'", key)))
    };
    let parse_json_opt = |row: &serde_json::Map<String, Value>,
                          key: &str|
     -> Result<Option<Value>, StorageError> {
        match row.get(key) {
            Some(Value::String(s)) => Ok(Some(serde_json::from_str(s)?)),
            _ => Ok(None),
        }
    };

    let op_str = get_str(&row, "op")?;
    let op = EventOp::parse(&op_str)
        .ok_or_else(|| StorageError::InvalidSegment(format!("unknown op '{}'", op_str)))?;

    let mut event = Event::new(
        get_str(&row, "id")?,
        row.get("ts").and_then(|v| v.as_i64()).unwrap_or(0),
        op,
        get_str(&row, "target")?,
    );
    event.actor = row
        .get("actor")
        .and_then(|v| v.as_str())
        .and_then(|s| crate::models::EntityId::parse(s).ok());
    event.before = parse_json_opt(&row, "before")?;
    event.after = parse_json_opt(&row, "after")?;
    event.metadata = parse_json_opt(&row, "metadata")?;
    Ok(event)
}

/// Write one run of events as a single segment. The events must already be
/// ordered; the segment file is content-addressed by checksum and the write
/// is skipped when an identical segment already exists.
pub fn write_events_to_segment(
    blob: &dyn BlobStore,
    events: &[Event],
    opts: &SegmentWriteOptions,
) -> Result<SegmentMeta, StorageError> {
    if events.is_empty() {
        return Err(StorageError::InvalidSegment(
            "cannot write an empty segment".to_string(),
        ));
    }
    validate_event_order(events)?;

    let columns = encode_events(events)?;
    let bytes = ParquetCodec::write_table("segment", &event_table_schema(), &columns)?;

    let checksum = hex::encode(Sha256::digest(&bytes));
    let file = segment_path(&opts.branch, &checksum);

    if !blob.exists(&file)? {
        blob.write_atomic(&file, &bytes)?;
    }
    debug!("Wrote segment {} with {} events", file, events.len());

    Ok(SegmentMeta {
        file,
        min_id: events[0].id.clone(),
        max_id: events[events.len() - 1].id.clone(),
        min_ts: events.iter().map(|e| e.ts).min().unwrap_or(0),
        max_ts: events.iter().map(|e| e.ts).max().unwrap_or(0),
        count: events.len() as u64,
        checksum,
    })
}

/// Split a long run into multiple segments; the last may be short.
pub fn write_events(
    blob: &dyn BlobStore,
    events: &[Event],
    opts: &SegmentWriteOptions,
) -> Result<Vec<SegmentMeta>, StorageError> {
    validate_event_order(events)?;
    let mut segments = Vec::new();
    for chunk in events.chunks(opts.max_events_per_segment) {
        segments.push(write_events_to_segment(blob, chunk, opts)?);
    }
    Ok(segments)
}

/// Result of appending against existing tail segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Tail segments superseded by the merge (to drop from the manifest).
    pub replaced: Vec<SegmentMeta>,
    /// Newly written segments (to add to the manifest).
    pub written: Vec<SegmentMeta>,
}

/// Merge new events with the last segment when the merged run stays under the
/// size cap; otherwise write the new events as fresh segments.
pub fn append_events(
    blob: &dyn BlobStore,
    new_events: &[Event],
    tail_segments: &[SegmentMeta],
    opts: &SegmentWriteOptions,
) -> Result<AppendOutcome, StorageError> {
    if new_events.is_empty() {
        return Ok(AppendOutcome {
            replaced: Vec::new(),
            written: Vec::new(),
        });
    }

    if let Some(last) = tail_segments.last() {
        let merged_len = last.count as usize + new_events.len();
        if merged_len <= opts.max_events_per_segment {
            let mut merged: Vec<Event> =
                read_segment_events(blob, last)?.collect::<Result<Vec<_>, _>>()?;
            merged.extend(new_events.iter().cloned());
            merged.sort_by(|a, b| a.id.cmp(&b.id));
            let merged = deduplicate_events(merged);

            let seg = write_events_to_segment(blob, &merged, opts)?;
            return Ok(AppendOutcome {
                replaced: vec![last.clone()],
                written: vec![seg],
            });
        }
    }

    let mut sorted: Vec<Event> = new_events.to_vec();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    let sorted = deduplicate_events(sorted);
    Ok(AppendOutcome {
        replaced: Vec::new(),
        written: write_events(blob, &sorted, opts)?,
    })
}

/// Accumulator producing segments on flush.
pub struct SegmentBatchWriter {
    opts: SegmentWriteOptions,
    buffer: Vec<Event>,
    produced: Vec<SegmentMeta>,
}

impl SegmentBatchWriter {
    pub fn new(opts: SegmentWriteOptions) -> Self {
        Self {
            opts,
            buffer: Vec::new(),
            produced: Vec::new(),
        }
    }

    pub fn add(&mut self, event: Event) {
        self.buffer.push(event);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Write everything buffered and return all segments this writer produced.
    pub fn flush(&mut self, blob: &dyn BlobStore) -> Result<Vec<SegmentMeta>, StorageError> {
        if !self.buffer.is_empty() {
            self.buffer.sort_by(|a, b| a.id.cmp(&b.id));
            let events = deduplicate_events(std::mem::take(&mut self.buffer));
            let segments = write_events(blob, &events, &self.opts)?;
            self.produced.extend(segments);
        }
        Ok(self.produced.clone())
    }
}

/// Lazy event sequence from one segment.
#[derive(Debug)]
pub struct SegmentEvents {
    rows: super::parquet::RowReader,
}

impl Iterator for SegmentEvents {
    type Item = Result<Event, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.rows.next()? {
            Ok(row) => Some(decode_event(row)),
            Err(e) => Some(Err(e)),
        }
    }
}

/// Read one segment's events, verifying its checksum first.
pub fn read_segment_events(
    blob: &dyn BlobStore,
    segment: &SegmentMeta,
) -> Result<SegmentEvents, StorageError> {
    let bytes = blob.read(&segment.file)?;
    let checksum = hex::encode(Sha256::digest(&bytes));
    if checksum != segment.checksum {
        return Err(StorageError::ParquetRead {
            path: segment.file.clone(),
            cause: format!(
                "checksum mismatch: expected {}, got {}",
                segment.checksum, checksum
            ),
        });
    }
    let rows = ParquetCodec::read_rows(&segment.file, &bytes, None, None)?;
    Ok(SegmentEvents { rows })
}

/// Concatenate events across segments, in manifest order.
pub fn read_events_from_segments(
    blob: &dyn BlobStore,
    segments: &[SegmentMeta],
) -> Result<Vec<Event>, StorageError> {
    let mut events = Vec::new();
    for segment in segments {
        for event in read_segment_events(blob, segment)? {
            events.push(event?);
        }
    }
    Ok(events)
}

/// Read events within `[min_ts, max_ts]`, pruning segments whose bounds fall
/// entirely outside the range.
pub fn read_events_in_range(
    blob: &dyn BlobStore,
    segments: &[SegmentMeta],
    min_ts: i64,
    max_ts: i64,
) -> Result<Vec<Event>, StorageError> {
    let mut events = Vec::new();
    for segment in segments {
        if segment.max_ts < min_ts || segment.min_ts > max_ts {
            continue;
        }
        for event in read_segment_events(blob, segment)? {
            let event = event?;
            if event.ts >= min_ts && event.ts <= max_ts {
                events.push(event);
            }
        }
    }
    Ok(events)
}

/// Constant-memory batch iterator: holds at most one segment plus one batch.
pub struct EventBatches<'a> {
    blob: &'a dyn BlobStore,
    segments: std::slice::Iter<'a, SegmentMeta>,
    pending: VecDeque<Event>,
    batch_size: usize,
    failed: bool,
}

impl<'a> Iterator for EventBatches<'a> {
    type Item = Result<Vec<Event>, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        while self.pending.len() < self.batch_size {
            let Some(segment) = self.segments.next() else {
                break;
            };
            let events = match read_segment_events(self.blob, segment)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            {
                Ok(events) => events,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            };
            self.pending.extend(events);
        }
        if self.pending.is_empty() {
            return None;
        }
        let take = self.batch_size.min(self.pending.len());
        Some(Ok(self.pending.drain(..take).collect()))
    }
}

/// Iterate events in fixed-size batches without loading the whole log.
pub fn read_event_batches<'a>(
    blob: &'a dyn BlobStore,
    segments: &'a [SegmentMeta],
    batch_size: usize,
) -> EventBatches<'a> {
    EventBatches {
        blob,
        segments: segments.iter(),
        pending: VecDeque::new(),
        batch_size: batch_size.max(1),
        failed: false,
    }
}

/// Count events. `accurate = false` sums segment metadata only; `accurate =
/// true` streams every segment.
pub fn count_events(
    blob: &dyn BlobStore,
    segments: &[SegmentMeta],
    accurate: bool,
) -> Result<u64, StorageError> {
    if !accurate {
        return Ok(segments.iter().map(|s| s.count).sum());
    }
    let mut count = 0u64;
    for segment in segments {
        for event in read_segment_events(blob, segment)? {
            event?;
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlobStore;
    use serde_json::json;

    fn event(id: &str, ts: i64, op: EventOp, target: &str) -> Event {
        Event::new(id.to_string(), ts, op, target.to_string())
            .with_after(json!({"$id": target.replace(':', "/"), "n": ts}))
    }

    fn sample_events() -> Vec<Event> {
        vec![
            event("01A", 100, EventOp::Create, "posts:p1"),
            event("01B", 200, EventOp::Update, "posts:p1"),
            event("01C", 300, EventOp::Create, "posts:p2"),
            event("01D", 400, EventOp::Delete, "posts:p1"),
        ]
    }

    fn opts() -> SegmentWriteOptions {
        SegmentWriteOptions::new("events", 10_000)
    }

    #[test]
    fn test_validate_event_order() {
        let events = sample_events();
        assert!(validate_event_order(&events).is_ok());

        let mut shuffled = events;
        shuffled.swap(0, 2);
        assert!(validate_event_order(&shuffled).is_err());
    }

    #[test]
    fn test_write_and_read_round_trip() {
        let blob = MemoryBlobStore::new();
        let events = sample_events();
        let seg = write_events_to_segment(&blob, &events, &opts()).unwrap();

        assert_eq!(seg.count, 4);
        assert_eq!(seg.min_id, "01A");
        assert_eq!(seg.max_id, "01D");
        assert_eq!(seg.min_ts, 100);
        assert_eq!(seg.max_ts, 400);
        assert!(seg.file.starts_with("events/seg-"));

        let read: Vec<Event> = read_segment_events(&blob, &seg)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(read.len(), 4);
        assert_eq!(read[0].id, "01A");
        assert_eq!(read[3].op, EventOp::Delete);
        assert_eq!(read[0].after, events[0].after);
    }

    #[test]
    fn test_checksum_is_content_identity() {
        let blob = MemoryBlobStore::new();
        let events = sample_events();
        let a = write_events_to_segment(&blob, &events, &opts()).unwrap();
        let b = write_events_to_segment(&blob, &events, &opts()).unwrap();

        assert_eq!(a.checksum, b.checksum);
        assert_eq!(a.file, b.file);
        // Only one file exists.
        assert_eq!(blob.list("events/seg-").unwrap().len(), 1);
    }

    #[test]
    fn test_checksum_verified_on_read() {
        let blob = MemoryBlobStore::new();
        let seg = write_events_to_segment(&blob, &sample_events(), &opts()).unwrap();

        // Corrupt the stored bytes.
        let mut bytes = blob.read(&seg.file).unwrap();
        bytes[10] ^= 0xFF;
        blob.write(&seg.file, &bytes).unwrap();

        assert!(matches!(
            read_segment_events(&blob, &seg).unwrap_err(),
            StorageError::ParquetRead { .. }
        ));
    }

    #[test]
    fn test_write_events_splits_runs() {
        let blob = MemoryBlobStore::new();
        let events = sample_events();
        let opts = SegmentWriteOptions::new("events", 3);
        let segments = write_events(&blob, &events, &opts).unwrap();

        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].count, 3);
        assert_eq!(segments[1].count, 1);
        assert!(segments[0].max_id < segments[1].min_id);
    }

    #[test]
    fn test_deduplicate_first_wins() {
        let mut events = sample_events();
        let mut dup = events[0].clone();
        dup.after = Some(json!({"changed": true}));
        events.push(dup);

        let deduped = deduplicate_events(events);
        assert_eq!(deduped.len(), 4);
        assert_eq!(deduped[0].after.as_ref().unwrap()["n"], json!(100));
    }

    #[test]
    fn test_append_merges_into_tail_under_cap() {
        let blob = MemoryBlobStore::new();
        let opts = SegmentWriteOptions::new("events", 100);
        let tail = write_events(&blob, &sample_events()[..2], &opts).unwrap();

        let outcome = append_events(&blob, &sample_events()[2..], &tail, &opts).unwrap();
        assert_eq!(outcome.replaced.len(), 1);
        assert_eq!(outcome.written.len(), 1);
        assert_eq!(outcome.written[0].count, 4);
    }

    #[test]
    fn test_append_writes_fresh_segment_over_cap() {
        let blob = MemoryBlobStore::new();
        let opts = SegmentWriteOptions::new("events", 2);
        let tail = write_events(&blob, &sample_events()[..2], &opts).unwrap();

        let outcome = append_events(&blob, &sample_events()[2..], &tail, &opts).unwrap();
        assert!(outcome.replaced.is_empty());
        assert_eq!(outcome.written.len(), 1);
        assert_eq!(outcome.written[0].count, 2);
    }

    #[test]
    fn test_batch_writer_accumulates() {
        let blob = MemoryBlobStore::new();
        let mut writer = SegmentBatchWriter::new(SegmentWriteOptions::new("events", 3));
        for e in sample_events() {
            writer.add(e);
        }
        let produced = writer.flush(&blob).unwrap();
        assert_eq!(produced.len(), 2);

        // A second flush with nothing buffered returns the same set.
        let again = writer.flush(&blob).unwrap();
        assert_eq!(again, produced);
    }

    #[test]
    fn test_read_events_in_range_prunes_segments() {
        let blob = MemoryBlobStore::new();
        let opts = SegmentWriteOptions::new("events", 2);
        let segments = write_events(&blob, &sample_events(), &opts).unwrap();

        // [100,200] lives entirely in the first segment.
        let events = read_events_in_range(&blob, &segments, 100, 200).unwrap();
        assert_eq!(events.len(), 2);

        let events = read_events_in_range(&blob, &segments, 250, 350).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "01C");

        let events = read_events_in_range(&blob, &segments, 1000, 2000).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_read_event_batches_windows() {
        let blob = MemoryBlobStore::new();
        let opts = SegmentWriteOptions::new("events", 2);
        let segments = write_events(&blob, &sample_events(), &opts).unwrap();

        let batches: Vec<Vec<Event>> = read_event_batches(&blob, &segments, 3)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[1].len(), 1);
    }

    #[test]
    fn test_count_events_metadata_vs_accurate() {
        let blob = MemoryBlobStore::new();
        let opts = SegmentWriteOptions::new("events", 2);
        let segments = write_events(&blob, &sample_events(), &opts).unwrap();

        assert_eq!(count_events(&blob, &segments, false).unwrap(), 4);
        assert_eq!(count_events(&blob, &segments, true).unwrap(), 4);
    }

    #[test]
    fn test_empty_segment_rejected() {
        let blob = MemoryBlobStore::new();
        assert!(write_events_to_segment(&blob, &[], &opts()).is_err());
    }

    #[test]
    fn test_events_without_payloads_round_trip() {
        let blob = MemoryBlobStore::new();
        let events = vec![Event::new(
            "01A".to_string(),
            100,
            EventOp::Delete,
            "posts:p1".to_string(),
        )];
        let seg = write_events_to_segment(&blob, &events, &opts()).unwrap();
        let read: Vec<Event> = read_segment_events(&blob, &seg)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert!(read[0].before.is_none());
        assert!(read[0].after.is_none());
        assert!(read[0].actor.is_none());
    }
}
