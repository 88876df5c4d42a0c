//! Store, snapshot, and editor implementation
//!
//! On-disk layout: one `journal` file plus `{key}.{index}` value files
//! (`{key}.{index}.tmp` while an edit is staged). The journal starts with a
//! magic/version header and then one record per line:
//!
//! ```text
//! CLEAN <key> <len0> [len1 ...]   entry committed, readable
//! DIRTY <key>                     edit opened, outcome unknown
//! REMOVE <key>                    entry deleted or edit aborted
//! READ <key>                      entry read, promotes LRU order
//! ```
//!
//! Replay order is significant: records are applied oldest-first so the
//! rebuilt index ends up in the same access order the store had before.

use crate::error::{Result, StoreError};
use lru::LruCache;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

const JOURNAL_FILE: &str = "journal";
const JOURNAL_TMP_FILE: &str = "journal.tmp";
const JOURNAL_BACKUP_FILE: &str = "journal.bkp";
const MAGIC: &str = "disk-lru-store";
const JOURNAL_VERSION: &str = "1";
const MAX_KEY_LEN: usize = 120;

/// Journal records that only repeat information already captured by a CLEAN
/// record accumulate without bound; once they dominate, the journal is
/// rewritten from the live index.
const COMPACT_THRESHOLD: usize = 2000;

/// In-memory index record for one entry.
struct Entry {
    /// Committed length of each value stream in bytes.
    lengths: Vec<u64>,
    /// True once the entry has been committed at least once.
    readable: bool,
    /// True while an edit is open (or, during replay, while a DIRTY record
    /// has no matching CLEAN/REMOVE).
    editing: bool,
}

impl Entry {
    fn new(value_count: usize) -> Self {
        Self {
            lengths: vec![0; value_count],
            readable: false,
            editing: false,
        }
    }

    fn total_length(&self) -> u64 {
        self.lengths.iter().sum()
    }
}

/// A journal-backed, size-bounded LRU key/value store.
///
/// All methods take `&mut self`; callers that share a store serialize access
/// externally. The store is not safe for concurrent multi-stream commits and
/// does not try to be.
pub struct Store {
    directory: PathBuf,
    journal_path: PathBuf,
    journal_tmp_path: PathBuf,
    journal_backup_path: PathBuf,
    app_version: u32,
    value_count: usize,
    max_size: u64,
    size: u64,
    entries: LruCache<String, Entry>,
    journal: Option<File>,
    redundant_op_count: usize,
    closed: bool,
}

impl Store {
    /// Open the store in `directory`, creating it if necessary.
    ///
    /// An existing journal is replayed to rebuild the index; leftovers from
    /// edits that never completed are discarded. A journal that cannot be
    /// parsed (or that was written by a different `app_version` or
    /// `value_count`) causes the directory contents to be cleared and the
    /// store to start empty.
    pub async fn open(
        directory: impl AsRef<Path>,
        app_version: u32,
        value_count: usize,
        max_size: u64,
    ) -> Result<Store> {
        if max_size == 0 {
            return Err(StoreError::Config("max_size must be positive".to_string()));
        }
        if value_count == 0 {
            return Err(StoreError::Config("value_count must be positive".to_string()));
        }

        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory).await?;

        let mut store = Store {
            journal_path: directory.join(JOURNAL_FILE),
            journal_tmp_path: directory.join(JOURNAL_TMP_FILE),
            journal_backup_path: directory.join(JOURNAL_BACKUP_FILE),
            directory,
            app_version,
            value_count,
            max_size,
            size: 0,
            entries: LruCache::unbounded(),
            journal: None,
            redundant_op_count: 0,
            closed: false,
        };

        // Prefer the backup if a journal rewrite was interrupted mid-rename.
        if fs::try_exists(&store.journal_backup_path).await? {
            if fs::try_exists(&store.journal_path).await? {
                fs::remove_file(&store.journal_backup_path).await?;
            } else {
                fs::rename(&store.journal_backup_path, &store.journal_path).await?;
            }
        }

        if fs::try_exists(&store.journal_path).await? {
            match store.read_journal().await {
                Ok(()) => {
                    store.process_journal().await?;
                    let journal = fs::OpenOptions::new()
                        .append(true)
                        .open(&store.journal_path)
                        .await?;
                    store.journal = Some(journal);
                    debug!(
                        directory = ?store.directory,
                        entries = store.entries.len(),
                        size = store.size,
                        "Journal replayed"
                    );
                    return Ok(store);
                }
                Err(e) => {
                    warn!(
                        directory = ?store.directory,
                        error = %e,
                        "Journal unreadable, starting empty"
                    );
                    store.clear_directory().await?;
                }
            }
        }

        store.rebuild_journal().await?;
        Ok(store)
    }

    /// Look up `key`, returning a snapshot of its committed value streams.
    ///
    /// A hit promotes the entry to most-recently-used and appends a READ
    /// record. Entries that have never been committed are not visible.
    pub async fn get(&mut self, key: &str) -> Result<Option<Snapshot>> {
        self.check_open()?;
        validate_key(key)?;

        let lengths = match self.entries.get(key) {
            Some(entry) if entry.readable => entry.lengths.clone(),
            _ => return Ok(None),
        };

        let mut streams = Vec::with_capacity(self.value_count);
        for index in 0..self.value_count {
            match File::open(self.clean_path(key, index)).await {
                Ok(file) => streams.push(file),
                // A value file vanished under us; treat the entry as gone.
                Err(_) => return Ok(None),
            }
        }

        self.redundant_op_count += 1;
        self.journal_write(format!("READ {key}\n")).await?;
        if self.journal_rebuild_required() {
            self.rebuild_journal().await?;
        }

        Ok(Some(Snapshot {
            key: key.to_string(),
            lengths,
            streams,
        }))
    }

    /// Open an edit for `key`, creating the entry if it does not exist.
    ///
    /// Returns `None` if the key already has an uncommitted edit. The entry
    /// stays invisible to [`Store::get`] until the editor commits.
    pub async fn edit(&mut self, key: &str) -> Result<Option<Editor<'_>>> {
        self.check_open()?;
        validate_key(key)?;

        if !self.entries.contains(key) {
            self.entries
                .put(key.to_string(), Entry::new(self.value_count));
        }
        match self.entries.peek(key) {
            Some(entry) if entry.editing => return Ok(None),
            Some(_) => {}
            None => return Ok(None),
        }

        self.journal_write(format!("DIRTY {key}\n")).await?;
        if let Some(entry) = self.entries.get_mut(key) {
            entry.editing = true;
        }

        let stream_count = self.value_count;
        Ok(Some(Editor {
            key: key.to_string(),
            streams: (0..stream_count).map(|_| None).collect(),
            store: self,
        }))
    }

    /// Remove `key` and its value files. Returns false if the entry does not
    /// exist or is currently being edited.
    pub async fn remove(&mut self, key: &str) -> Result<bool> {
        self.check_open()?;
        validate_key(key)?;

        let total = match self.entries.peek(key) {
            Some(entry) if !entry.editing => entry.total_length(),
            _ => return Ok(false),
        };

        for index in 0..self.value_count {
            remove_file_if_exists(&self.clean_path(key, index)).await?;
        }

        self.size -= total;
        self.entries.pop(key);
        self.redundant_op_count += 1;
        self.journal_write(format!("REMOVE {key}\n")).await?;
        if self.journal_rebuild_required() {
            self.rebuild_journal().await?;
        }

        Ok(true)
    }

    /// Total size of all committed values in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Configured size bound in bytes.
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Number of entries in the store, including uncommitted ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Directory holding the journal and value files.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Force buffered journal records to disk.
    pub async fn flush(&mut self) -> Result<()> {
        self.check_open()?;
        if let Some(journal) = self.journal.as_mut() {
            journal.flush().await?;
            journal.sync_all().await?;
        }
        Ok(())
    }

    /// Close the store. Further operations return [`StoreError::Closed`].
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if let Some(mut journal) = self.journal.take() {
            journal.flush().await?;
            journal.sync_all().await?;
        }
        self.closed = true;
        Ok(())
    }

    /// Close the store and delete the backing directory with everything in
    /// it. Irreversible.
    pub async fn delete(mut self) -> Result<()> {
        self.close().await?;
        fs::remove_dir_all(&self.directory).await?;
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn clean_path(&self, key: &str, index: usize) -> PathBuf {
        self.directory.join(format!("{key}.{index}"))
    }

    fn dirty_path(&self, key: &str, index: usize) -> PathBuf {
        self.directory.join(format!("{key}.{index}.tmp"))
    }

    fn entry_is_readable(&self, key: &str) -> bool {
        self.entries.peek(key).map(|e| e.readable).unwrap_or(false)
    }

    async fn journal_write(&mut self, record: String) -> Result<()> {
        if let Some(journal) = self.journal.as_mut() {
            journal.write_all(record.as_bytes()).await?;
            journal.flush().await?;
        }
        Ok(())
    }

    fn journal_rebuild_required(&self) -> bool {
        self.redundant_op_count >= COMPACT_THRESHOLD
            && self.redundant_op_count >= self.entries.len()
    }

    async fn read_journal(&mut self) -> Result<()> {
        let contents = fs::read_to_string(&self.journal_path).await?;
        if !contents.ends_with('\n') {
            return Err(StoreError::Corrupt("truncated journal".to_string()));
        }

        let mut lines = contents.lines();
        let magic = lines.next();
        let version = lines.next();
        let app_version = lines.next();
        let value_count = lines.next();
        let blank = lines.next();
        if magic != Some(MAGIC)
            || version != Some(JOURNAL_VERSION)
            || app_version != Some(self.app_version.to_string().as_str())
            || value_count != Some(self.value_count.to_string().as_str())
            || blank != Some("")
        {
            return Err(StoreError::Corrupt("unexpected journal header".to_string()));
        }

        let mut record_count = 0usize;
        for line in lines {
            self.apply_journal_record(line)?;
            record_count += 1;
        }
        self.redundant_op_count = record_count.saturating_sub(self.entries.len());
        Ok(())
    }

    fn apply_journal_record(&mut self, line: &str) -> Result<()> {
        let (op, rest) = line
            .split_once(' ')
            .ok_or_else(|| StoreError::Corrupt(format!("malformed journal record {line:?}")))?;

        match op {
            "REMOVE" => {
                self.entries.pop(rest);
            }
            "READ" => {
                let _ = self.entries.get(rest);
            }
            "DIRTY" => {
                if !self.entries.contains(rest) {
                    self.entries
                        .put(rest.to_string(), Entry::new(self.value_count));
                }
                if let Some(entry) = self.entries.get_mut(rest) {
                    entry.editing = true;
                }
            }
            "CLEAN" => {
                let mut parts = rest.split(' ');
                let key = parts
                    .next()
                    .ok_or_else(|| StoreError::Corrupt(format!("malformed CLEAN record {line:?}")))?;
                let lengths = parts
                    .map(|p| p.parse::<u64>())
                    .collect::<std::result::Result<Vec<u64>, _>>()
                    .map_err(|_| StoreError::Corrupt(format!("malformed CLEAN record {line:?}")))?;
                if lengths.len() != self.value_count {
                    return Err(StoreError::Corrupt(format!(
                        "CLEAN record has {} lengths, expected {}",
                        lengths.len(),
                        self.value_count
                    )));
                }
                if !self.entries.contains(key) {
                    self.entries
                        .put(key.to_string(), Entry::new(self.value_count));
                }
                if let Some(entry) = self.entries.get_mut(key) {
                    entry.lengths = lengths;
                    entry.readable = true;
                    entry.editing = false;
                }
            }
            _ => {
                return Err(StoreError::Corrupt(format!(
                    "unknown journal record {line:?}"
                )));
            }
        }
        Ok(())
    }

    /// After replay: drop the temp journal, discard entries whose last record
    /// was DIRTY, and compute the total committed size.
    async fn process_journal(&mut self) -> Result<()> {
        remove_file_if_exists(&self.journal_tmp_path).await?;

        let keys: Vec<String> = self.entries.iter().map(|(key, _)| key.clone()).collect();
        for key in keys {
            let (editing, total) = match self.entries.peek(&key) {
                Some(entry) => (entry.editing, entry.total_length()),
                None => continue,
            };
            if editing {
                for index in 0..self.value_count {
                    remove_file_if_exists(&self.clean_path(&key, index)).await?;
                    remove_file_if_exists(&self.dirty_path(&key, index)).await?;
                }
                self.entries.pop(&key);
            } else {
                self.size += total;
            }
        }
        Ok(())
    }

    /// Rewrite the journal from the live index via tmp + backup renames so a
    /// crash at any point leaves a readable journal behind.
    async fn rebuild_journal(&mut self) -> Result<()> {
        if let Some(mut journal) = self.journal.take() {
            journal.flush().await?;
        }

        let mut contents = String::new();
        contents.push_str(MAGIC);
        contents.push('\n');
        contents.push_str(JOURNAL_VERSION);
        contents.push('\n');
        contents.push_str(&self.app_version.to_string());
        contents.push('\n');
        contents.push_str(&self.value_count.to_string());
        contents.push('\n');
        contents.push('\n');

        let records: Vec<String> = self
            .entries
            .iter()
            .map(|(key, entry)| {
                if entry.editing {
                    format!("DIRTY {key}\n")
                } else {
                    format!("CLEAN {key} {}\n", join_lengths(&entry.lengths))
                }
            })
            .collect();
        // iter() walks most-recently-used first; records replay oldest-first
        for record in records.iter().rev() {
            contents.push_str(record);
        }

        fs::write(&self.journal_tmp_path, contents.as_bytes()).await?;
        if fs::try_exists(&self.journal_path).await? {
            fs::rename(&self.journal_path, &self.journal_backup_path).await?;
            fs::rename(&self.journal_tmp_path, &self.journal_path).await?;
            fs::remove_file(&self.journal_backup_path).await?;
        } else {
            fs::rename(&self.journal_tmp_path, &self.journal_path).await?;
        }

        let journal = fs::OpenOptions::new()
            .append(true)
            .open(&self.journal_path)
            .await?;
        self.journal = Some(journal);
        self.redundant_op_count = 0;
        Ok(())
    }

    async fn clear_directory(&mut self) -> Result<()> {
        let mut dir = fs::read_dir(&self.directory).await?;
        while let Some(dirent) = dir.next_entry().await? {
            let path = dirent.path();
            if dirent.file_type().await?.is_dir() {
                fs::remove_dir_all(&path).await?;
            } else {
                fs::remove_file(&path).await?;
            }
        }
        self.entries.clear();
        self.size = 0;
        Ok(())
    }

    /// Finish an edit: on success, rename staged streams into place and log
    /// CLEAN; on failure, drop the staging files and log either CLEAN (entry
    /// keeps its previous committed value) or REMOVE (entry was never
    /// committed).
    async fn complete_edit(&mut self, key: &str, written: &[bool], success: bool) -> Result<()> {
        let (previously_readable, old_lengths) = match self.entries.peek(key) {
            Some(entry) => (entry.readable, entry.lengths.clone()),
            None => {
                return Err(StoreError::Corrupt(format!(
                    "edit completed for unknown entry {key}"
                )))
            }
        };

        let mut new_lengths = old_lengths.clone();
        for index in 0..self.value_count {
            let dirty = self.dirty_path(key, index);
            if success && written[index] {
                let clean = self.clean_path(key, index);
                fs::rename(&dirty, &clean).await?;
                new_lengths[index] = fs::metadata(&clean).await?.len();
            } else {
                remove_file_if_exists(&dirty).await?;
            }
        }

        self.redundant_op_count += 1;

        if previously_readable || success {
            if success {
                let old_total: u64 = if previously_readable {
                    old_lengths.iter().sum()
                } else {
                    0
                };
                self.size = self.size + new_lengths.iter().sum::<u64>() - old_total;
            }
            let journal_lengths = match self.entries.get_mut(key) {
                Some(entry) => {
                    entry.editing = false;
                    entry.readable = true;
                    if success {
                        entry.lengths = new_lengths;
                    }
                    entry.lengths.clone()
                }
                None => {
                    return Err(StoreError::Corrupt(format!(
                        "edit completed for unknown entry {key}"
                    )))
                }
            };
            self.journal_write(format!("CLEAN {key} {}\n", join_lengths(&journal_lengths)))
                .await?;
        } else {
            self.entries.pop(key);
            self.journal_write(format!("REMOVE {key}\n")).await?;
        }

        if self.size > self.max_size {
            self.trim_to_size().await?;
        }
        if self.journal_rebuild_required() {
            self.rebuild_journal().await?;
        }

        Ok(())
    }

    async fn trim_to_size(&mut self) -> Result<()> {
        while self.size > self.max_size {
            let (key, entry) = match self.entries.pop_lru() {
                Some(evicted) => evicted,
                None => break,
            };
            for index in 0..self.value_count {
                remove_file_if_exists(&self.clean_path(&key, index)).await?;
            }
            self.size -= entry.total_length();
            self.redundant_op_count += 1;
            self.journal_write(format!("REMOVE {key}\n")).await?;
            debug!(key = %key, "Evicted least-recently-used entry");
        }
        Ok(())
    }
}

/// A read-only view of one committed entry.
///
/// The value files are opened while the snapshot is created, so the streams
/// stay readable even if the entry is evicted afterwards.
pub struct Snapshot {
    key: String,
    lengths: Vec<u64>,
    streams: Vec<File>,
}

impl Snapshot {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Committed length of the stream at `index`.
    pub fn stream_length(&self, index: usize) -> Option<u64> {
        self.lengths.get(index).copied()
    }

    /// The open value file for `index`.
    pub fn stream(&mut self, index: usize) -> Option<&mut File> {
        self.streams.get_mut(index)
    }

    /// Read the stream at `index` to the end.
    pub async fn read_to_vec(&mut self, index: usize) -> Result<Vec<u8>> {
        let capacity = self.lengths.get(index).copied().unwrap_or(0) as usize;
        let stream = self
            .streams
            .get_mut(index)
            .ok_or_else(|| StoreError::Config(format!("stream index {index} out of range")))?;
        let mut bytes = Vec::with_capacity(capacity);
        stream.read_to_end(&mut bytes).await?;
        Ok(bytes)
    }
}

/// An open edit on one entry.
///
/// Streams write to `.tmp` staging files; nothing becomes visible until
/// [`Editor::commit`]. Exactly one of `commit` or `abort` must be called.
/// A brand-new entry must write every stream before committing.
pub struct Editor<'a> {
    store: &'a mut Store,
    key: String,
    streams: Vec<Option<File>>,
}

impl<'a> Editor<'a> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The staging sink for `index`, created on first use.
    pub async fn stream(&mut self, index: usize) -> Result<&mut File> {
        if index >= self.streams.len() {
            return Err(StoreError::Config(format!(
                "stream index {index} out of range"
            )));
        }
        if self.streams[index].is_none() {
            let path = self.store.dirty_path(&self.key, index);
            self.streams[index] = Some(File::create(&path).await?);
        }
        match self.streams[index].as_mut() {
            Some(file) => Ok(file),
            None => Err(StoreError::Config(format!(
                "stream index {index} out of range"
            ))),
        }
    }

    /// Write `data` to the stream at `index`.
    pub async fn write(&mut self, index: usize, data: &[u8]) -> Result<()> {
        let stream = self.stream(index).await?;
        stream.write_all(data).await?;
        Ok(())
    }

    /// Atomically publish every written stream. On any failure the edit is
    /// rolled back as if aborted and the error is returned.
    pub async fn commit(mut self) -> Result<()> {
        let written: Vec<bool> = self.streams.iter().map(Option::is_some).collect();

        if !self.store.entry_is_readable(&self.key) && written.iter().any(|w| !w) {
            self.drop_streams();
            self.store.complete_edit(&self.key, &written, false).await?;
            return Err(StoreError::Config(format!(
                "new entry {} did not write every stream",
                self.key
            )));
        }

        if let Err(e) = self.sync_streams().await {
            self.drop_streams();
            let _ = self.store.complete_edit(&self.key, &written, false).await;
            return Err(e);
        }

        self.store.complete_edit(&self.key, &written, true).await
    }

    /// Discard the edit, deleting any staged data. The entry keeps its
    /// previous committed value, if it had one.
    pub async fn abort(mut self) -> Result<()> {
        let written: Vec<bool> = self.streams.iter().map(Option::is_some).collect();
        self.drop_streams();
        self.store.complete_edit(&self.key, &written, false).await
    }

    async fn sync_streams(&mut self) -> Result<()> {
        for stream in self.streams.iter_mut() {
            if let Some(file) = stream.take() {
                file.sync_all().await?;
            }
        }
        Ok(())
    }

    fn drop_streams(&mut self) {
        for stream in self.streams.iter_mut() {
            stream.take();
        }
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key.len() > MAX_KEY_LEN
        || key
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '/' || c == '\\')
    {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn join_lengths(lengths: &[u64]) -> String {
    lengths
        .iter()
        .map(u64::to_string)
        .collect::<Vec<String>>()
        .join(" ")
}

async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
