//! Crash-recoverable key-value map: an in-memory `BTreeMap` backed by an
//! append-only log and a periodic checkpoint.
//!
//! Recovery loads the checkpoint and replays the log on top of it. Every
//! mutation is appended to the log and synced before it is applied. Once
//! the log holds `log_max_size` records the map is written to a fresh
//! checkpoint, renamed into place, and the log is truncated. A torn
//! trailing record is cut off during recovery so later appends start on a
//! clean line.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chordkv_lib::dht_messages::NodeId;

use crate::error::StoreError;

pub const DEFAULT_LOG_MAX_SIZE: usize = 100;

const INVALID_KEY: &str = "Invalid key value";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LogMethod {
    Insert,
    Remove,
}

#[derive(Debug, Serialize, Deserialize)]
struct LogRecord {
    method: LogMethod,
    key: u64,
    #[serde(default)]
    value: Value,
}

/// Coerces a client key into a non-negative integer.
///
/// Accepts JSON integers and decimal strings, mirroring what clients send.
pub fn validate_key(key: &Value) -> Result<u64, StoreError> {
    match key {
        Value::Number(number) => number
            .as_u64()
            .ok_or_else(|| StoreError::Validation(INVALID_KEY.to_string())),
        Value::String(text) => text
            .trim()
            .parse::<u64>()
            .map_err(|_| StoreError::Validation(INVALID_KEY.to_string())),
        _ => Err(StoreError::Validation(INVALID_KEY.to_string())),
    }
}

#[derive(Debug)]
pub struct DurableStore {
    data: BTreeMap<u64, Value>,
    ckpt_path: PathBuf,
    log_path: PathBuf,
    log: File,
    log_size: usize,
    log_max_size: usize,
}

impl DurableStore {
    /// Opens (or creates) the store files for `node_id` under `dir` and recovers state.
    pub fn open(dir: &Path, node_id: NodeId, log_max_size: usize) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        let ckpt_path = dir.join(format!("{}_kv.ckpt", node_id));
        let log_path = dir.join(format!("{}_kv.log", node_id));

        let mut data = load_checkpoint(&ckpt_path);
        let replay = replay_log(&log_path, &mut data)?;
        debug!(
            "Recovered {} keys for node {} ({} log records replayed)",
            data.len(),
            node_id,
            replay.records
        );

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        if replay.torn {
            // New records must start on a clean line.
            log.set_len(replay.valid_len)?;
            log.sync_all()?;
            warn!(
                "Truncated torn tail of {} at byte {}",
                log_path.display(),
                replay.valid_len
            );
        }
        let log_size = replay.records;

        Ok(Self {
            data,
            ckpt_path,
            log_path,
            log,
            log_size,
            log_max_size: log_max_size.max(1),
        })
    }

    pub fn insert(&mut self, key: &Value, value: Value) -> Result<u64, StoreError> {
        let key = validate_key(key)?;
        self.insert_key(key, value)?;
        Ok(key)
    }

    pub fn lookup(&self, key: &Value) -> Result<Option<&Value>, StoreError> {
        let key = validate_key(key)?;
        Ok(self.data.get(&key))
    }

    /// Returns the validated key and whether it was present.
    pub fn remove(&mut self, key: &Value) -> Result<(u64, bool), StoreError> {
        let key = validate_key(key)?;
        let removed = self.remove_key(key)?;
        Ok((key, removed))
    }

    /// Inserts an already validated key. Used for replicas and hand-off.
    pub fn insert_key(&mut self, key: u64, value: Value) -> Result<(), StoreError> {
        self.write_log(LogMethod::Insert, key, &value)?;
        self.data.insert(key, value);
        self.maybe_compact();
        Ok(())
    }

    /// Removes an already validated key; absent keys are not logged.
    pub fn remove_key(&mut self, key: u64) -> Result<bool, StoreError> {
        if !self.data.contains_key(&key) {
            return Ok(false);
        }
        self.write_log(LogMethod::Remove, key, &Value::Null)?;
        self.data.remove(&key);
        self.maybe_compact();
        Ok(true)
    }

    pub fn get(&self, key: u64) -> Option<&Value> {
        self.data.get(&key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &Value)> {
        self.data.iter()
    }

    /// Number of records in the log since the last compaction.
    pub fn log_size(&self) -> usize {
        self.log_size
    }

    pub fn checkpoint_path(&self) -> &Path {
        &self.ckpt_path
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    fn write_log(&mut self, method: LogMethod, key: u64, value: &Value) -> Result<(), StoreError> {
        let record = LogRecord {
            method,
            key,
            value: value.clone(),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        self.log.write_all(line.as_bytes())?;
        self.log.flush()?;
        self.log.sync_all()?;
        self.log_size += 1;
        Ok(())
    }

    fn maybe_compact(&mut self) {
        if self.log_size < self.log_max_size {
            return;
        }
        if let Err(e) = self.compact_log() {
            warn!(
                "Checkpoint of {} failed, keeping {} log records: {}",
                self.ckpt_path.display(),
                self.log_size,
                e
            );
        }
    }

    /// Writes the map to `<ckpt>_new`, renames it over the checkpoint and
    /// truncates the log. On failure the log is left untouched.
    pub fn compact_log(&mut self) -> Result<(), StoreError> {
        let mut new_path = self.ckpt_path.clone().into_os_string();
        new_path.push("_new");
        let new_path = PathBuf::from(new_path);

        {
            let mut file = File::create(&new_path)?;
            serde_json::to_writer(&mut file, &self.data)?;
            file.flush()?;
            file.sync_all()?;
        }
        fs::rename(&new_path, &self.ckpt_path)?;

        self.log.set_len(0)?;
        self.log.sync_all()?;
        self.log_size = 0;
        debug!(
            "Compacted {} keys into {}",
            self.data.len(),
            self.ckpt_path.display()
        );
        Ok(())
    }
}

// A missing or unreadable checkpoint is an empty map.
fn load_checkpoint(path: &Path) -> BTreeMap<u64, Value> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(_) => return BTreeMap::new(),
    };
    match serde_json::from_reader(BufReader::new(file)) {
        Ok(data) => data,
        Err(e) => {
            warn!("Ignoring corrupt checkpoint {}: {}", path.display(), e);
            BTreeMap::new()
        }
    }
}

/// Outcome of replaying the log: how many records applied and where the
/// last complete record ends.
#[derive(Debug, Default)]
struct Replay {
    records: usize,
    valid_len: u64,
    torn: bool,
}

fn replay_log(path: &Path, data: &mut BTreeMap<u64, Value>) -> Result<Replay, StoreError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Replay::default()),
        Err(e) => return Err(e.into()),
    };

    let mut replay = Replay::default();
    let mut reader = BufReader::new(file);
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 {
            break;
        }
        // A record is only acknowledged once its terminator is synced.
        if line.last() != Some(&b'\n') {
            warn!("Stopping log replay at unterminated record");
            replay.torn = true;
            break;
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            replay.valid_len += read as u64;
            continue;
        }
        let record: LogRecord = match serde_json::from_slice(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!("Stopping log replay at unreadable record: {}", e);
                replay.torn = true;
                break;
            }
        };
        match record.method {
            LogMethod::Insert => {
                data.insert(record.key, record.value);
            }
            LogMethod::Remove => {
                data.remove(&record.key);
            }
        }
        replay.records += 1;
        replay.valid_len += read as u64;
    }
    Ok(replay)
}
