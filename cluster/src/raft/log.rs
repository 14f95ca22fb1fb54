//! Durable log and hard-state storage for a consensus node.
//!
//! The log is a sequence of fixed-capacity segment files plus an in-memory
//! cache of the live suffix. Hard state (term, vote, commit) lives in its own
//! file and is synced before any vote is granted or append acknowledged, so
//! a node can never vote twice in one term across a crash. Snapshots replace
//! the covered log prefix; whole segments under a snapshot are deleted.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::message::LogEntry;
use super::segment::Segment;
use super::NodeId;

const HARD_STATE_FILE: &str = "hardstate";
const SNAPSHOT_FILE: &str = "snapshot";

/// State that must be durable before answering any peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<NodeId>,
    pub commit: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    last_index: u64,
    last_term: u64,
    data: Vec<u8>,
}

pub struct LogStore {
    base_path: PathBuf,
    entries_per_segment: u64,
    segments: BTreeMap<u64, Segment>,
    /// Live suffix of the log; `entries[0].index == snapshot_last_index + 1`.
    entries: Vec<LogEntry>,
    snapshot_last_index: u64,
    snapshot_last_term: u64,
    hard_state: HardState,
}

impl LogStore {
    pub fn open<P: AsRef<Path>>(base_path: P, entries_per_segment: u64) -> io::Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;

        let (snapshot_last_index, snapshot_last_term) =
            match Self::read_snapshot_file(&base_path)? {
                Some(snap) => (snap.last_index, snap.last_term),
                None => (0, 0),
            };

        let mut hard_state = match fs::read(base_path.join(HARD_STATE_FILE)) {
            Ok(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => HardState::default(),
            Err(e) => return Err(e),
        };

        // Collect segment files sorted by their start index
        let mut segment_files: Vec<(u64, PathBuf)> = Vec::new();
        for dir_entry in fs::read_dir(&base_path)? {
            let path = dir_entry?.path();
            if !path.is_file() {
                continue;
            }
            let name = path.file_name().unwrap_or_default().to_string_lossy().to_string();
            if let Some(start) = name
                .strip_prefix("segment_")
                .and_then(|s| s.strip_suffix(".log"))
                .and_then(|s| s.parse::<u64>().ok())
            {
                segment_files.push((start, path));
            }
        }
        segment_files.sort_by_key(|(start, _)| *start);

        let mut segments = BTreeMap::new();
        let mut entries: Vec<LogEntry> = Vec::new();
        for (start, path) in segment_files {
            let mut segment = Segment::new(&path, start)?;
            for index in segment.start_index()..=segment.end_index() {
                let bytes = segment.read_entry(index)?;
                let entry: LogEntry = bincode::deserialize(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                // Entries already covered by the snapshot are dead weight
                // left behind by a crash between snapshot and compaction.
                if entry.index > snapshot_last_index {
                    entries.push(entry);
                }
            }
            segments.insert(start, segment);
        }

        // A crash can leave commit ahead of what actually hit disk.
        let last_index = snapshot_last_index + entries.len() as u64;
        if hard_state.commit > last_index {
            hard_state.commit = last_index;
        }

        Ok(LogStore {
            base_path,
            entries_per_segment,
            segments,
            entries,
            snapshot_last_index,
            snapshot_last_term,
            hard_state,
        })
    }

    pub fn first_index(&self) -> u64 {
        self.snapshot_last_index + 1
    }

    pub fn last_index(&self) -> u64 {
        self.snapshot_last_index + self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_last_term)
    }

    /// Term of the entry at `index`, if it is still known. Index 0 and the
    /// snapshot boundary both resolve, so `prev_log` checks work right after
    /// compaction.
    pub fn term(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_last_index {
            return Some(self.snapshot_last_term);
        }
        self.entry(index).map(|e| e.term)
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index < self.first_index() || index > self.last_index() {
            return None;
        }
        self.entries.get((index - self.first_index()) as usize)
    }

    /// Entries from `from` (inclusive), at most `max`.
    pub fn entries_from(&self, from: u64, max: usize) -> Vec<LogEntry> {
        if from < self.first_index() || from > self.last_index() {
            return Vec::new();
        }
        let start = (from - self.first_index()) as usize;
        self.entries[start..]
            .iter()
            .take(max)
            .cloned()
            .collect()
    }

    fn segment_start(&self, index: u64) -> u64 {
        ((index - 1) / self.entries_per_segment) * self.entries_per_segment + 1
    }

    fn segment_path(&self, start_index: u64) -> PathBuf {
        self.base_path.join(format!("segment_{}.log", start_index))
    }

    fn get_or_create_segment(&mut self, start_index: u64) -> io::Result<&mut Segment> {
        if !self.segments.contains_key(&start_index) {
            let path = self.segment_path(start_index);
            let segment = Segment::new(path, start_index)?;
            self.segments.insert(start_index, segment);
        }
        Ok(self.segments.get_mut(&start_index).unwrap())
    }

    /// Appends a dense continuation of the log and syncs it to disk.
    pub fn append(&mut self, new_entries: &[LogEntry]) -> io::Result<()> {
        if new_entries.is_empty() {
            return Ok(());
        }
        if new_entries[0].index != self.last_index() + 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "append would leave a gap: log ends at {}, entries start at {}",
                    self.last_index(),
                    new_entries[0].index
                ),
            ));
        }

        // Group by segment so each file is written and synced once
        let mut by_segment: BTreeMap<u64, Vec<Vec<u8>>> = BTreeMap::new();
        for entry in new_entries {
            let bytes = bincode::serialize(entry)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            by_segment
                .entry(self.segment_start(entry.index))
                .or_default()
                .push(bytes);
        }
        for (segment_start, encoded) in by_segment {
            let segment = self.get_or_create_segment(segment_start)?;
            segment.append(&encoded)?;
        }

        self.entries.extend_from_slice(new_entries);
        Ok(())
    }

    /// Removes the uncommitted suffix starting at `index`, on disk and in
    /// memory.
    pub fn truncate_from(&mut self, index: u64) -> io::Result<()> {
        if index <= self.snapshot_last_index {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot truncate into the snapshotted prefix",
            ));
        }
        if index > self.last_index() {
            return Ok(());
        }

        // Drop whole segments past the one containing `index`
        let containing = self.segment_start(index);
        let later: Vec<u64> = self
            .segments
            .range(containing + 1..)
            .map(|(start, _)| *start)
            .collect();
        for start in later {
            if let Some(segment) = self.segments.remove(&start) {
                segment.clear()?;
            }
        }
        if let Some(segment) = self.segments.get_mut(&containing) {
            if index <= segment.end_index() {
                if index <= segment.start_index() {
                    let segment = self.segments.remove(&containing).unwrap();
                    segment.clear()?;
                } else {
                    segment.truncate_from(index)?;
                }
            }
        }

        self.entries.truncate((index - self.first_index()) as usize);
        Ok(())
    }

    pub fn hard_state(&self) -> &HardState {
        &self.hard_state
    }

    /// Persists hard state with fsync; must complete before the vote or
    /// append acknowledgement it covers leaves the node.
    pub fn save_hard_state(&mut self, hard_state: HardState) -> io::Result<()> {
        let bytes = bincode::serialize(&hard_state)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp_path = self.base_path.join(format!("{}.tmp", HARD_STATE_FILE));
        let final_path = self.base_path.join(HARD_STATE_FILE);

        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &final_path)?;

        self.hard_state = hard_state;
        Ok(())
    }

    fn read_snapshot_file(base_path: &Path) -> io::Result<Option<SnapshotFile>> {
        match fs::read(base_path.join(SNAPSHOT_FILE)) {
            Ok(bytes) => {
                let snap: SnapshotFile = bincode::deserialize(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(snap))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// State-machine snapshot as stored, if any: (last_index, last_term, data).
    pub fn load_snapshot(&self) -> io::Result<Option<(u64, u64, Vec<u8>)>> {
        Ok(Self::read_snapshot_file(&self.base_path)?
            .map(|s| (s.last_index, s.last_term, s.data)))
    }

    fn write_snapshot_file(&self, snap: &SnapshotFile) -> io::Result<()> {
        let bytes = bincode::serialize(snap)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp_path = self.base_path.join(format!("{}.tmp", SNAPSHOT_FILE));
        let final_path = self.base_path.join(SNAPSHOT_FILE);

        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    /// Saves a snapshot of the applied state through `last_index` and drops
    /// every segment it fully covers.
    pub fn save_snapshot(&mut self, data: Vec<u8>, last_index: u64, last_term: u64) -> io::Result<()> {
        if last_index <= self.snapshot_last_index {
            return Ok(());
        }
        self.write_snapshot_file(&SnapshotFile {
            last_index,
            last_term,
            data,
        })?;

        let covered: Vec<u64> = self
            .segments
            .iter()
            .filter(|(_, s)| s.end_index() <= last_index && !s.is_empty())
            .map(|(start, _)| *start)
            .collect();
        for start in covered {
            if let Some(segment) = self.segments.remove(&start) {
                segment.clear()?;
            }
        }

        let drop_count = (last_index - self.snapshot_last_index) as usize;
        self.entries.drain(..drop_count.min(self.entries.len()));
        self.snapshot_last_index = last_index;
        self.snapshot_last_term = last_term;
        Ok(())
    }

    /// Replaces the whole log with a snapshot received from the leader.
    pub fn install_snapshot(&mut self, last_index: u64, last_term: u64, data: Vec<u8>) -> io::Result<()> {
        self.write_snapshot_file(&SnapshotFile {
            last_index,
            last_term,
            data,
        })?;

        let all: Vec<u64> = self.segments.keys().copied().collect();
        for start in all {
            if let Some(segment) = self.segments.remove(&start) {
                segment.clear()?;
            }
        }
        self.entries.clear();
        self.snapshot_last_index = last_index;
        self.snapshot_last_term = last_term;

        let mut hs = self.hard_state.clone();
        if hs.commit < last_index {
            hs.commit = last_index;
            self.save_hard_state(hs)?;
        }
        Ok(())
    }
}
