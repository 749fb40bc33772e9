//! # wal
//!
//! why: persist log entries and hard state in one fsynced write so a crash never tears them apart
//! relations: implements LogStore for replica-node's driver
//! what: FileLog (append-only json-lines write-ahead log), lazy replay iterator

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use replica_core::{HardState, LogEntry};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::fs_util::atomic_write;
use crate::{plan_append, AppendPlan, LogStore, Replay, StorageError, StorageResult};

const WAL_FILE: &str = "wal.log";

/// entries per line when the log is rewritten
const REWRITE_CHUNK: usize = 256;

/// one line of the write-ahead log
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Record {
    /// entries at or below index were compacted away; only valid as the first line
    Base { index: u64 },
    /// one atomic append
    Batch {
        #[serde(default)]
        entries: Vec<LogEntry>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hard_state: Option<HardState>,
    },
}

/// file-based log store
///
/// stores the log in a directory with:
/// - wal.log: one json record per line, each line one append
///
/// a last line without its newline was never acknowledged and is dropped on open
pub struct FileLog {
    /// directory path for storing the log
    dir: PathBuf,
    /// append handle on wal.log
    file: File,
    base: u64,
    last: u64,
    hard_state: HardState,
}

#[derive(Debug, Default)]
struct Scan {
    base: u64,
    last: u64,
    hard_state: HardState,
    /// bytes up to the end of the last complete record
    valid_len: u64,
    torn: bool,
}

impl FileLog {
    /// open (or create) the log in the given directory
    pub fn open(dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let path = dir.join(WAL_FILE);

        let scan = scan(&path)?;
        if scan.torn {
            warn!(
                path = %path.display(),
                valid_len = scan.valid_len,
                "discarding torn tail of write-ahead log"
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(scan.valid_len)?;
            file.sync_all()?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(
            path = %path.display(),
            base = scan.base,
            last = scan.last,
            "opened write-ahead log"
        );

        Ok(Self {
            dir,
            file,
            base: scan.base,
            last: scan.last,
            hard_state: scan.hard_state,
        })
    }

    fn path(&self) -> PathBuf {
        self.dir.join(WAL_FILE)
    }

    fn write_record(&mut self, record: &Record) -> StorageResult<()> {
        let mut line = Vec::new();
        push_line(&mut line, record)?;
        self.file.write_all(&line)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// replace the whole file with base + entries + current hard state
    fn rewrite(&mut self, base: u64, entries: &[LogEntry]) -> StorageResult<()> {
        let mut buf = Vec::new();
        if base > 0 {
            push_line(&mut buf, &Record::Base { index: base })?;
        }
        for chunk in entries.chunks(REWRITE_CHUNK) {
            push_line(
                &mut buf,
                &Record::Batch {
                    entries: chunk.to_vec(),
                    hard_state: None,
                },
            )?;
        }
        if !self.hard_state.is_empty() {
            push_line(
                &mut buf,
                &Record::Batch {
                    entries: Vec::new(),
                    hard_state: Some(self.hard_state),
                },
            )?;
        }

        atomic_write(&self.dir, WAL_FILE, &buf)?;
        self.file = OpenOptions::new().append(true).open(self.path())?;
        self.base = base;
        self.last = entries.last().map_or(base, |e| e.index);
        Ok(())
    }

    fn collect_since(&self, index: u64) -> StorageResult<Vec<LogEntry>> {
        self.replay_since(index)?.collect()
    }
}

impl LogStore for FileLog {
    fn append(&mut self, entries: &[LogEntry], hard_state: Option<&HardState>) -> StorageResult<()> {
        match plan_append(self.base, self.last, entries)? {
            AppendPlan::Nothing => {
                if let Some(hs) = hard_state {
                    self.write_record(&Record::Batch {
                        entries: Vec::new(),
                        hard_state: Some(*hs),
                    })?;
                    self.hard_state = *hs;
                }
                Ok(())
            }
            AppendPlan::Extend => {
                self.write_record(&Record::Batch {
                    entries: entries.to_vec(),
                    hard_state: hard_state.copied(),
                })?;
                if let Some(hs) = hard_state {
                    self.hard_state = *hs;
                }
                self.last = entries.last().map_or(self.last, |e| e.index);
                Ok(())
            }
            AppendPlan::Truncate(from) => {
                debug!(from, last = self.last, "replacing conflicting log suffix");
                let mut kept: Vec<LogEntry> = self
                    .collect_since(self.base + 1)?
                    .into_iter()
                    .filter(|e| e.index < from)
                    .collect();
                kept.extend_from_slice(entries);
                if let Some(hs) = hard_state {
                    self.hard_state = *hs;
                }
                let base = self.base;
                self.rewrite(base, &kept)
            }
        }
    }

    fn replay_since(&self, index: u64) -> StorageResult<Replay> {
        let path = self.path();
        let reader = match File::open(&path) {
            Ok(file) => Some(BufReader::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(Box::new(FileReplay {
            path,
            reader,
            from: index,
            line: 0,
            pending: VecDeque::new(),
        }))
    }

    fn compact_through(&mut self, index: u64) -> StorageResult<()> {
        if index <= self.base {
            return Ok(());
        }
        let through = index.min(self.last);
        let kept = self.collect_since(through + 1)?;
        self.rewrite(through, &kept)?;
        info!(through, retained = kept.len(), "compacted write-ahead log");
        Ok(())
    }

    fn reset_to(&mut self, index: u64) -> StorageResult<()> {
        self.rewrite(index, &[])?;
        info!(index, "reset write-ahead log to snapshot");
        Ok(())
    }

    fn hard_state(&self) -> HardState {
        self.hard_state
    }

    fn first_index(&self) -> u64 {
        self.base + 1
    }

    fn last_index(&self) -> u64 {
        self.last
    }
}

fn push_line(buf: &mut Vec<u8>, record: &Record) -> StorageResult<()> {
    serde_json::to_writer(&mut *buf, record)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    buf.push(b'\n');
    Ok(())
}

fn parse_record(path: &Path, line: usize, bytes: &[u8]) -> StorageResult<Record> {
    let body = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    serde_json::from_slice(body).map_err(|e| StorageError::corrupt(path, line, e))
}

/// validate every complete record and locate the torn tail, if any
fn scan(path: &Path) -> StorageResult<Scan> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Scan::default()),
        Err(e) => return Err(e.into()),
    };

    let mut reader = BufReader::new(file);
    let mut scan = Scan::default();
    let mut buf = Vec::new();
    let mut line = 0;

    loop {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf)?;
        if read == 0 {
            break;
        }
        line += 1;
        if buf.last() != Some(&b'\n') {
            scan.torn = true;
            break;
        }

        match parse_record(path, line, &buf)? {
            Record::Base { index } => {
                if line != 1 {
                    return Err(StorageError::corrupt(
                        path,
                        line,
                        "base record after the first line",
                    ));
                }
                scan.base = index;
                scan.last = index;
            }
            Record::Batch {
                entries,
                hard_state,
            } => {
                for entry in &entries {
                    if entry.index != scan.last + 1 {
                        return Err(StorageError::corrupt(
                            path,
                            line,
                            format!("expected index {}, found {}", scan.last + 1, entry.index),
                        ));
                    }
                    scan.last = entry.index;
                }
                if let Some(hs) = hard_state {
                    scan.hard_state = hs;
                }
            }
        }
        scan.valid_len += read as u64;
    }

    Ok(scan)
}

struct FileReplay {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    from: u64,
    line: usize,
    pending: VecDeque<LogEntry>,
}

impl Iterator for FileReplay {
    type Item = StorageResult<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                return Some(Ok(entry));
            }

            let reader = self.reader.as_mut()?;
            let mut buf = Vec::new();
            match reader.read_until(b'\n', &mut buf) {
                // end of file, or an append still in progress
                Ok(0) => {
                    self.reader = None;
                    return None;
                }
                Ok(_) if buf.last() != Some(&b'\n') => {
                    self.reader = None;
                    return None;
                }
                Ok(_) => {
                    self.line += 1;
                    match parse_record(&self.path, self.line, &buf) {
                        Ok(Record::Batch { entries, .. }) => {
                            let from = self.from;
                            self.pending
                                .extend(entries.into_iter().filter(|e| e.index >= from));
                        }
                        Ok(Record::Base { .. }) => {}
                        Err(e) => {
                            self.reader = None;
                            return Some(Err(e));
                        }
                    }
                }
                Err(e) => {
                    self.reader = None;
                    return Some(Err(e.into()));
                }
            }
        }
    }
}
