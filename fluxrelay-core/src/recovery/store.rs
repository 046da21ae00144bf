//! Per-target recovery logs
//!
//! One append-only file per unavailable member, named after the hex of the
//! member name. A record is fsynced before its hint is written, so a hint
//! in the metadata store always has data behind it.
//!
//! A replay first moves the live log aside; appends arriving meanwhile
//! start a fresh log, and the replay picks that up once the moved segment
//! is delivered.

use super::record::{Record, MAX_RECORD};
use crate::meta::{HintStatus, HintStore};
use crate::tsdb::WriteRequest;
use crate::{RelayError, Result};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const LOG_SUFFIX: &str = ".rlog";
const REPLAY_SUFFIX: &str = ".replaying";

#[derive(Default)]
struct TargetLog {
    /// Live log handle; held only while appending or rotating
    file: tokio::sync::Mutex<Option<File>>,
    /// Held for the whole of a replay
    replay: tokio::sync::Mutex<()>,
}

/// Recovery logs held by this member
pub struct RecoveryStore {
    dir: PathBuf,
    holder: String,
    hints: HintStore,
    logs: Mutex<HashMap<String, Arc<TargetLog>>>,
}

impl RecoveryStore {
    /// Open the store rooted at `dir`, creating it if needed
    pub fn open(dir: impl Into<PathBuf>, holder: impl Into<String>, hints: HintStore) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            holder: holder.into(),
            hints,
            logs: Mutex::new(HashMap::new()),
        })
    }

    /// Name of the member holding these logs
    pub fn holder(&self) -> &str {
        &self.holder
    }

    fn path(&self, target: &str) -> PathBuf {
        self.dir.join(format!("{}{}", hex::encode(target), LOG_SUFFIX))
    }

    fn replay_path(&self, target: &str) -> PathBuf {
        self.dir.join(format!("{}{}", hex::encode(target), REPLAY_SUFFIX))
    }

    fn log(&self, target: &str) -> Arc<TargetLog> {
        self.logs
            .lock()
            .entry(target.to_string())
            .or_default()
            .clone()
    }

    /// Append a write for `target`, then record the hint
    pub async fn put(&self, target: &str, request: &WriteRequest) -> Result<()> {
        let encoded = Record::from_request(request).encode()?;
        let log = self.log(target);
        let file = {
            let mut handle = log.file.lock().await;
            if handle.is_none() {
                let path = self.path(target);
                repair(&path)?;
                *handle = Some(OpenOptions::new().create(true).append(true).open(&path)?);
            }
            let file = handle
                .as_mut()
                .ok_or_else(|| RelayError::Internal(format!("recovery log for {} not open", target)))?;
            file.write_all(&encoded)?;
            file.try_clone()?
        };
        tokio::task::spawn_blocking(move || file.sync_all())
            .await
            .map_err(|e| RelayError::Internal(format!("recovery log sync: {}", e)))??;
        self.hints.put(target, &self.holder, HintStatus::Waiting).await?;
        debug!(member = %target, bytes = encoded.len(), "buffered write for recovery");
        Ok(())
    }

    /// Records buffered for `target`, read lazily, oldest first
    pub fn get(&self, target: &str) -> Result<RecordReader> {
        Ok(RecordReader::open([self.replay_path(target), self.path(target)]))
    }

    /// Delete every log of `target`
    pub async fn drop_log(&self, target: &str) -> Result<()> {
        let log = self.log(target);
        let _replay = log.replay.lock().await;
        let mut handle = log.file.lock().await;
        *handle = None;
        remove_if_exists(&self.replay_path(target))?;
        remove_if_exists(&self.path(target))
    }

    /// Targets with a log on disk
    pub fn targets(&self) -> Result<Vec<String>> {
        let mut targets = BTreeSet::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(encoded) = name
                .strip_suffix(LOG_SUFFIX)
                .or_else(|| name.strip_suffix(REPLAY_SUFFIX))
            else {
                continue;
            };
            match hex::decode(encoded).ok().and_then(|b| String::from_utf8(b).ok()) {
                Some(target) => {
                    targets.insert(target);
                }
                None => warn!(file = %name, "ignoring unrecognised recovery log"),
            }
        }
        Ok(targets.into_iter().collect())
    }

    /// Send every buffered record of `target` through `send`
    ///
    /// Appends are not blocked while records are sent. On success the logs
    /// are deleted and the hint removed; on failure the moved segment stays
    /// and is sent again from its start next time, which the TSDB absorbs
    /// because rewriting a point is idempotent.
    pub async fn replay<F, Fut>(&self, target: &str, mut send: F) -> Result<usize>
    where
        F: FnMut(Record) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let log = self.log(target);
        let _replay = log.replay.lock().await;
        let live = self.path(target);
        let segment = self.replay_path(target);

        let mut sent = 0;
        loop {
            if !segment.exists() {
                let mut handle = log.file.lock().await;
                *handle = None;
                if !live.exists() {
                    break;
                }
                fs::rename(&live, &segment)?;
            }
            for record in RecordReader::open([segment.clone()]) {
                let record = match record {
                    Ok(record) => record,
                    Err(e) if e.is_corruption() => {
                        warn!(member = %target, error = %e, "discarding corrupt recovery records");
                        break;
                    }
                    Err(e) => return Err(e),
                };
                send(record).await?;
                sent += 1;
            }
            remove_if_exists(&segment)?;
        }

        self.hints.done(target, &self.holder).await?;
        if live.exists() {
            // an append landed between the last rotation and the hint removal
            self.hints.put(target, &self.holder, HintStatus::Waiting).await?;
        }
        info!(member = %target, records = sent, "recovery log replayed");
        Ok(sent)
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RelayError::Io(e)),
    }
}

/// Truncate a torn final record left by a crash mid-append
fn repair(path: &Path) -> Result<()> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(RelayError::Io(e)),
    };
    let mut offset = 0;
    loop {
        match Record::decode(&data[offset..]) {
            Ok(Some((_, used))) => offset += used,
            Ok(None) => break,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "recovery log corrupt past offset {}", offset);
                break;
            }
        }
    }
    if offset < data.len() {
        warn!(path = %path.display(), torn = data.len() - offset, "truncating torn recovery record");
        OpenOptions::new().write(true).open(path)?.set_len(offset as u64)?;
    }
    Ok(())
}

struct Segment {
    reader: BufReader<File>,
    /// Bytes not yet consumed
    remaining: u64,
}

impl Segment {
    fn read_next(&mut self) -> Result<Option<Record>> {
        let mut prefix = [0u8; 4];
        if !read_full(&mut self.reader, &mut prefix)? {
            return Ok(None);
        }
        self.remaining = self.remaining.saturating_sub(4);
        let len = u32::from_le_bytes(prefix);
        if len as usize > MAX_RECORD {
            return Err(RelayError::Corruption(format!(
                "record length {} exceeds {}",
                len, MAX_RECORD
            )));
        }
        if u64::from(len) > self.remaining {
            warn!(len, remaining = self.remaining, "recovery log ends in a torn record");
            return Ok(None);
        }
        let mut frame = vec![0u8; 4 + len as usize];
        frame[..4].copy_from_slice(&prefix);
        if !read_full(&mut self.reader, &mut frame[4..])? {
            warn!("recovery log ends in a torn record");
            return Ok(None);
        }
        self.remaining -= u64::from(len);
        Ok(Record::decode(&frame)?.map(|(record, _)| record))
    }
}

/// Streams records from recovery logs, stopping at EOF or a torn tail
pub struct RecordReader {
    paths: VecDeque<PathBuf>,
    current: Option<Segment>,
}

impl RecordReader {
    fn open(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            paths: paths.into_iter().collect(),
            current: None,
        }
    }

    /// Open the next file that exists
    fn advance(&mut self) -> Result<bool> {
        while let Some(path) = self.paths.pop_front() {
            match File::open(&path) {
                Ok(file) => {
                    let remaining = file.metadata()?.len();
                    self.current = Some(Segment {
                        reader: BufReader::new(file),
                        remaining,
                    });
                    return Ok(true);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(RelayError::Io(e)),
            }
        }
        Ok(false)
    }
}

/// Fill `buf`; false when EOF came first
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => return Ok(false),
            n => filled += n,
        }
    }
    Ok(true)
}

impl Iterator for RecordReader {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                match self.advance() {
                    Ok(true) => {}
                    Ok(false) => return None,
                    Err(e) => {
                        self.paths.clear();
                        return Some(Err(e));
                    }
                }
            }
            let segment = self.current.as_mut()?;
            match segment.read_next() {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => self.current = None,
                Err(e) => {
                    self.current = None;
                    self.paths.clear();
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{Keyspace, MemoryMetaStore, SharedMetaStore};
    use std::time::Duration;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> (RecoveryStore, HintStore) {
        let meta: SharedMetaStore = Arc::new(MemoryMetaStore::new());
        let hints = HintStore::new(meta, Keyspace::new("/fluxrelay", "t"));
        let store = RecoveryStore::open(dir.path(), "a", hints.clone()).unwrap();
        (store, hints)
    }

    fn request(line: &str) -> WriteRequest {
        WriteRequest::new("db", line.to_string())
    }

    #[tokio::test]
    async fn test_put_writes_hint_and_records() {
        let dir = TempDir::new().unwrap();
        let (store, hints) = store(&dir);

        store.put("b", &request("cpu value=1 1")).await.unwrap();
        store.put("b", &request("cpu value=2 2")).await.unwrap();

        assert_eq!(hints.get_by_target("b").await.unwrap(), vec![("a".to_string(), HintStatus::Waiting)]);
        let records: Vec<Record> = store.get("b").unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(&records[1].body[..], b"cpu value=2 2");
        assert_eq!(store.targets().unwrap(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_replay_success_clears_log_and_hint() {
        let dir = TempDir::new().unwrap();
        let (store, hints) = store(&dir);
        store.put("b", &request("cpu value=1 1")).await.unwrap();

        let sent = store.replay("b", |_| async { Ok(()) }).await.unwrap();
        assert_eq!(sent, 1);
        assert!(hints.get_by_target("b").await.unwrap().is_empty());
        assert_eq!(store.get("b").unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_replay_failure_keeps_log_and_hint() {
        let dir = TempDir::new().unwrap();
        let (store, hints) = store(&dir);
        store.put("b", &request("cpu value=1 1")).await.unwrap();

        let result = store
            .replay("b", |_| async { Err(RelayError::Tsdb { status: 503, message: "down".into() }) })
            .await;
        assert!(result.is_err());
        assert_eq!(hints.get_by_target("b").await.unwrap().len(), 1);

        // appends still work after a failed replay
        store.put("b", &request("cpu value=2 2")).await.unwrap();
        assert_eq!(store.get("b").unwrap().count(), 2);
    }

    #[tokio::test]
    async fn test_appends_proceed_while_replay_sends() {
        let dir = TempDir::new().unwrap();
        let (store, hints) = store(&dir);
        let store = Arc::new(store);
        store.put("b", &request("cpu value=1 1")).await.unwrap();

        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let replay = {
            let (store, gate) = (store.clone(), gate.clone());
            tokio::spawn(async move {
                store
                    .replay("b", |_| {
                        let gate = gate.clone();
                        async move {
                            gate.acquire().await.unwrap().forget();
                            Ok(())
                        }
                    })
                    .await
            })
        };
        // let the replay park inside its first send
        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::time::timeout(Duration::from_secs(1), store.put("b", &request("cpu value=2 2")))
            .await
            .expect("append waited for the replay")
            .unwrap();
        assert_eq!(store.get("b").unwrap().count(), 2);

        gate.add_permits(2);
        assert_eq!(replay.await.unwrap().unwrap(), 2);
        assert!(hints.get_by_target("b").await.unwrap().is_empty());
        assert!(store.targets().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_replay_resumes_before_newer_appends() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store(&dir);
        store.put("b", &request("cpu value=1 1")).await.unwrap();
        assert!(store
            .replay("b", |_| async { Err(RelayError::Tsdb { status: 503, message: "down".into() }) })
            .await
            .is_err());
        store.put("b", &request("cpu value=2 2")).await.unwrap();
        assert_eq!(store.targets().unwrap(), vec!["b".to_string()]);

        let mut bodies = Vec::new();
        store
            .replay("b", |record| {
                bodies.push(record.body.clone());
                async { Ok(()) }
            })
            .await
            .unwrap();
        assert_eq!(bodies, vec![&b"cpu value=1 1"[..], &b"cpu value=2 2"[..]]);
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_is_corruption() {
        let dir = TempDir::new().unwrap();
        {
            let (store, _) = store(&dir);
            store.put("b", &request("cpu value=1 1")).await.unwrap();
        }
        let path = dir.path().join(format!("{}{}", hex::encode("b"), LOG_SUFFIX));
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xF0, 0xFF, 0xFF, 0xFF, 1, 2, 3]).unwrap();
        drop(file);

        let (store, _) = store(&dir);
        let records: Vec<Result<Record>> = store.get("b").unwrap().collect();
        assert_eq!(records.len(), 2);
        assert!(records[0].is_ok());
        assert!(records[1].as_ref().unwrap_err().is_corruption());

        // a length within bounds but past the end of the file is a torn tail
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        let good = fs::metadata(&path).unwrap().len() - 7;
        file.set_len(good).unwrap();
        drop(file);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0, 0, 1, 0, 9]).unwrap();
        drop(file);
        assert_eq!(store.get("b").unwrap().filter(|r| r.is_ok()).count(), 1);

        store.put("b", &request("cpu value=2 2")).await.unwrap();
        assert_eq!(store.get("b").unwrap().map(|r| r.unwrap()).count(), 2);
    }

    #[tokio::test]
    async fn test_torn_tail_is_truncated_on_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let (store, _) = store(&dir);
            store.put("b", &request("cpu value=1 1")).await.unwrap();
        }
        let path = dir.path().join(format!("{}{}", hex::encode("b"), LOG_SUFFIX));
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[42, 0, 0, 0, 1, 2]).unwrap();
        drop(file);

        let (store, _) = store(&dir);
        assert_eq!(store.get("b").unwrap().count(), 1);
        store.put("b", &request("cpu value=2 2")).await.unwrap();
        let records: Vec<Record> = store.get("b").unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
    }
}
