// Copyright 2022 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The experience store controller: the lifecycle around the position index.
//!
//! A store owns one position index and at most one background loader thread.
//! File loading happens off the engine thread; every other entry point first
//! waits for the loader to finish, so the index is only ever touched by one
//! thread at a time. Writers append fresh observations to per-kind staging
//! vectors (PV and MultiPV) and link them into the index immediately;
//! saving drains the staging vectors to disk.
//!
//! Two save shapes exist. The incremental save appends staged observations
//! to the file and is cheap enough to run on every game boundary. The full
//! save rewrites the file from the index, one record per `(key, move)` pair,
//! which is how defragmentation, n-way merge, and the version upgrade all
//! produce canonical files. A full rewrite first renames the existing file
//! to `<path>.bak` and restores it if writing fails.
//!
//! Write gates (`enabled`, `paused`, `readonly`, and the bench pair) are
//! atomics on the store so any engine thread may consult them.

use std::{
    cmp,
    collections::HashSet,
    fs::{self, File, OpenOptions},
    io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::{self, JoinHandle},
};

use thiserror::Error;

use crate::{
    entry::{ExperienceEntry, MIN_DEPTH},
    format::{self, Format, FormatError, ENTRY_SIZE, SIGNATURE_V2, WRITE_CHUNK},
    index::{ChainOrder, Linked, PositionIndex},
};

/// Errors surfaced by store operations. All of them are recoverable; the
/// index is left in a usable state.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: FormatError,
    },
    #[error("failed to load experience file {path}")]
    LoadFailed { path: PathBuf },
}

/// What a finished load reported.
#[derive(Clone, Debug, Default)]
pub struct LoadOutcome {
    /// Whether the file was read to the end and linked.
    pub ok: bool,
    /// The format the file matched, if any.
    pub format: Option<Format>,
    /// Records read from the file.
    pub total_moves: usize,
    /// Records that were new `(key, move)` pairs.
    pub new_moves: usize,
    /// Positions not previously present in the index.
    pub new_positions: usize,
    /// Records absorbed into an existing entry.
    pub duplicates: usize,
    /// Duplicate percentage, reported only when loading into an empty
    /// index (it describes the file itself, not the union).
    pub fragmentation: Option<f64>,
    /// Whether the load stopped early on request. Partial links are kept.
    pub cancelled: bool,
}

/// What a save wrote.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SaveSummary {
    pub pv_written: usize,
    pub multipv_written: usize,
    pub total_written: usize,
}

struct Shared {
    index: Mutex<PositionIndex>,
    loading: Mutex<bool>,
    loading_cv: Condvar,
    abort_loading: AtomicBool,
    load_result: Mutex<Option<LoadOutcome>>,
    enabled: AtomicBool,
    paused: AtomicBool,
    readonly: AtomicBool,
    bench_mode: AtomicBool,
    bench_single_shot: AtomicBool,
}

/// The experience store. One value owns the whole subsystem; dropping it
/// cancels any in-flight load and joins the loader thread.
pub struct ExperienceStore {
    shared: Arc<Shared>,
    loader: Option<JoinHandle<()>>,
    filename: Option<PathBuf>,
    pv_staging: Vec<ExperienceEntry>,
    multipv_staging: Vec<ExperienceEntry>,
}

impl Default for ExperienceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExperienceStore {
    pub fn new() -> ExperienceStore {
        ExperienceStore {
            shared: Arc::new(Shared {
                index: Mutex::new(PositionIndex::new()),
                loading: Mutex::new(false),
                loading_cv: Condvar::new(),
                abort_loading: AtomicBool::new(false),
                load_result: Mutex::new(None),
                enabled: AtomicBool::new(true),
                paused: AtomicBool::new(false),
                readonly: AtomicBool::new(false),
                bench_mode: AtomicBool::new(false),
                bench_single_shot: AtomicBool::new(false),
            }),
            loader: None,
            filename: None,
            pv_staging: Vec::new(),
            multipv_staging: Vec::new(),
        }
    }

    /// The file this store was last pointed at.
    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_readonly(&self) -> bool {
        self.shared.readonly.load(Ordering::Acquire)
    }

    pub fn set_readonly(&self, readonly: bool) {
        self.shared.readonly.store(readonly, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    pub fn pause_learning(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    pub fn resume_learning(&self) {
        self.shared.paused.store(false, Ordering::Release);
    }

    /// Enters bench mode: at most one PV observation will be accepted until
    /// the mode is left, and MultiPV observations are dropped outright.
    pub fn begin_bench(&self) {
        self.shared.bench_single_shot.store(true, Ordering::Release);
        self.shared.bench_mode.store(true, Ordering::Release);
    }

    pub fn end_bench(&self) {
        self.shared.bench_mode.store(false, Ordering::Release);
    }

    fn can_record(&self) -> bool {
        self.is_enabled() && !self.is_paused() && !self.is_readonly()
    }

    /// Blocks until no load is in flight. Cheap when the loader is idle.
    pub fn wait_for_loading_finished(&self) {
        let guard = self.shared.loading.lock().unwrap();
        let _guard = self
            .shared
            .loading_cv
            .wait_while(guard, |loading| *loading)
            .unwrap();
    }

    /// The outcome of the most recent load, if one has finished.
    pub fn load_result(&self) -> Option<LoadOutcome> {
        self.shared.load_result.lock().unwrap().clone()
    }

    /// Requests that an in-flight load stop at the next record. Whatever
    /// has been linked stays linked.
    pub fn abort_loading(&self) {
        self.shared.abort_loading.store(true, Ordering::Release);
    }

    /// Points the store at a file, loading it in the background. A no-op
    /// when the store already loaded this exact path successfully.
    pub fn init(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        if self.filename.as_deref() == Some(path) {
            self.wait_for_loading_finished();
            if self.load_result().map_or(false, |outcome| outcome.ok) {
                return;
            }
        }
        self.unload();
        self.load(path, false);
    }

    /// Loads an experience file into the index, merging with whatever the
    /// index already holds. Returns the outcome when `synchronous`.
    pub fn load(&mut self, path: impl AsRef<Path>, synchronous: bool) -> Option<LoadOutcome> {
        let path = path.as_ref();
        self.wait_for_loading_finished();
        if let Some(handle) = self.loader.take() {
            let _ = handle.join();
        }
        self.filename = Some(path.to_owned());
        *self.shared.loading.lock().unwrap() = true;
        *self.shared.load_result.lock().unwrap() = None;
        self.shared.abort_loading.store(false, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let path = path.to_owned();
        let handle = thread::Builder::new()
            .name("experience loader".into())
            .spawn(move || loader_main(shared, path))
            .expect("failed to spawn loader thread");
        self.loader = Some(handle);

        if synchronous {
            self.wait_for_loading_finished();
            self.load_result()
        } else {
            None
        }
    }

    /// Saves observations to `path`.
    ///
    /// The incremental shape (`save_all == false`) appends staged entries of
    /// sufficient depth, de-duplicated within the batch, then clears the
    /// staging vectors. The full shape rewrites the whole file from the
    /// index behind a `.bak` backup, scaling observation counts down by
    /// `1 + chain_max/128` per chain.
    pub fn save(
        &mut self,
        path: impl AsRef<Path>,
        save_all: bool,
        ignore_loading_check: bool,
    ) -> Result<SaveSummary, StoreError> {
        let path = path.as_ref();
        if !ignore_loading_check {
            self.wait_for_loading_finished();
        }
        if !save_all && self.pv_staging.is_empty() && self.multipv_staging.is_empty() {
            return Ok(SaveSummary::default());
        }
        if save_all {
            // Staged entries were linked when they were added, so the index
            // already reflects them.
            self.pv_staging.clear();
            self.multipv_staging.clear();
            save_full_shared(&self.shared, path)
        } else {
            self.save_incremental(path)
        }
    }

    fn save_incremental(&mut self, path: &Path) -> Result<SaveSummary, StoreError> {
        let file = open_for_append(path)?;
        let len = file_len(&file, path)?;
        let mut out = BufWriter::with_capacity(WRITE_CHUNK, file);
        if len == 0 {
            write_all(&mut out, SIGNATURE_V2, path)?;
        }
        let mut seen: HashSet<(u64, u32)> = HashSet::new();
        let mut pv_written = 0;
        let mut multipv_written = 0;
        for entry in &self.pv_staging {
            if entry.depth < MIN_DEPTH || !seen.insert((entry.key, entry.mv)) {
                continue;
            }
            write_all(&mut out, &format::encode(entry), path)?;
            pv_written += 1;
        }
        for entry in &self.multipv_staging {
            if entry.depth < MIN_DEPTH || !seen.insert((entry.key, entry.mv)) {
                continue;
            }
            write_all(&mut out, &format::encode(entry), path)?;
            multipv_written += 1;
        }
        flush(&mut out, path)?;
        self.pv_staging.clear();
        self.multipv_staging.clear();
        tracing::info!(pv = pv_written, multipv = multipv_written, "experience saved");
        Ok(SaveSummary {
            pv_written,
            multipv_written,
            total_written: pv_written + multipv_written,
        })
    }

    /// Saves pending observations and releases everything the store holds.
    pub fn unload(&mut self) {
        self.wait_for_loading_finished();
        if let Some(path) = self.filename.clone() {
            if let Err(err) = self.save(&path, false, false) {
                tracing::warn!("failed to save experience on unload: {}", err);
            }
        }
        if let Some(handle) = self.loader.take() {
            let _ = handle.join();
        }
        self.shared.index.lock().unwrap().clear();
        *self.shared.load_result.lock().unwrap() = None;
        self.pv_staging.clear();
        self.multipv_staging.clear();
        self.filename = None;
    }

    /// The chain recorded for a position, best move first. Callers must
    /// have waited for load completion (every command entry point does).
    pub fn probe(&self, key: u64) -> Option<Vec<ExperienceEntry>> {
        let index = self.shared.index.lock().unwrap();
        index.probe(key).map(|chain| chain.to_vec())
    }

    /// The best remembered entry for a position.
    pub fn find_best_entry(&self, key: u64) -> Option<ExperienceEntry> {
        self.shared.index.lock().unwrap().find_best_entry(key)
    }

    pub fn positions(&self) -> usize {
        self.shared.index.lock().unwrap().positions()
    }

    pub fn total_moves(&self) -> usize {
        self.shared.index.lock().unwrap().total_moves()
    }

    /// Records a principal-variation observation. Returns whether the
    /// observation was accepted.
    pub fn add_pv_experience(&mut self, key: u64, mv: u32, value: i32, depth: i32) -> bool {
        if !self.can_record() {
            return false;
        }
        if self.shared.bench_mode.load(Ordering::Acquire)
            && !self.shared.bench_single_shot.swap(false, Ordering::AcqRel)
        {
            return false;
        }
        self.stage(ExperienceEntry::new(key, mv, value, depth), true)
    }

    /// Records a MultiPV observation. Dropped entirely in bench mode.
    pub fn add_multipv_experience(&mut self, key: u64, mv: u32, value: i32, depth: i32) -> bool {
        if !self.can_record() || self.shared.bench_mode.load(Ordering::Acquire) {
            return false;
        }
        self.stage(ExperienceEntry::new(key, mv, value, depth), false)
    }

    fn stage(&mut self, entry: ExperienceEntry, pv: bool) -> bool {
        self.wait_for_loading_finished();
        if pv {
            self.pv_staging.push(entry);
        } else {
            self.multipv_staging.push(entry);
        }
        self.shared
            .index
            .lock()
            .unwrap()
            .link(entry, ChainOrder::Current);
        true
    }

    /// Creates `path` holding only the current signature, so a later append
    /// finds a well-formed file. A no-op when recording is disabled or the
    /// path is empty.
    pub fn touch(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let path = path.as_ref();
        if !self.is_enabled() || path.as_os_str().is_empty() {
            return Ok(());
        }
        let mut file = open_for_append(path)?;
        if file_len(&file, path)? == 0 {
            file.write_all(SIGNATURE_V2).map_err(|e| io_error(path, e))?;
        }
        Ok(())
    }
}

impl Drop for ExperienceStore {
    fn drop(&mut self) {
        self.abort_loading();
        if let Some(handle) = self.loader.take() {
            let _ = handle.join();
        }
    }
}

/// Rewrites `path` in canonical form: every `(key, move)` pair exactly once,
/// quality-ordered within its chain.
pub fn defrag(path: impl AsRef<Path>) -> Result<SaveSummary, StoreError> {
    let path = path.as_ref();
    let mut store = ExperienceStore::new();
    let outcome = store
        .load(path, true)
        .expect("synchronous load reports an outcome");
    if !outcome.ok {
        return Err(StoreError::LoadFailed {
            path: path.to_owned(),
        });
    }
    store.save(path, true, false)
}

/// Unions any number of experience files into `target`.
pub fn merge(
    target: impl AsRef<Path>,
    sources: &[PathBuf],
) -> Result<SaveSummary, StoreError> {
    let mut store = ExperienceStore::new();
    for source in sources {
        let outcome = store
            .load(source, true)
            .expect("synchronous load reports an outcome");
        if !outcome.ok {
            return Err(StoreError::LoadFailed {
                path: source.clone(),
            });
        }
    }
    store.save(target, true, false)
}

fn loader_main(shared: Arc<Shared>, path: PathBuf) {
    let outcome = match run_load(&shared, &path) {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::info!("failed to load experience file: {}", err);
            LoadOutcome::default()
        }
    };
    *shared.load_result.lock().unwrap() = Some(outcome);
    let mut loading = shared.loading.lock().unwrap();
    *loading = false;
    shared.loading_cv.notify_all();
}

fn run_load(shared: &Shared, path: &Path) -> Result<LoadOutcome, StoreError> {
    let mut file = File::open(path).map_err(|e| io_error(path, e))?;
    let len = file_len(&file, path)?;

    let header_len = cmp::min(len, SIGNATURE_V2.len() as u64) as usize;
    let mut header = vec![0u8; header_len];
    file.read_exact(&mut header).map_err(|e| io_error(path, e))?;
    let (fmt, records) = format::detect(&header, len).map_err(|e| StoreError::Format {
        path: path.to_owned(),
        source: e,
    })?;
    file.seek(SeekFrom::Start(fmt.signature().len() as u64))
        .map_err(|e| io_error(path, e))?;
    let mut reader = BufReader::new(file);

    let order = if fmt.is_current() {
        ChainOrder::Current
    } else {
        ChainOrder::Legacy
    };
    let mut read = 0;
    let mut duplicates = 0;
    let mut cancelled = false;
    let (was_empty, new_positions) = {
        let mut index = shared.index.lock().unwrap();
        let was_empty = index.is_empty();
        let positions_before = index.positions();
        let mut raw = [0u8; ENTRY_SIZE];
        while read < records {
            if shared.abort_loading.load(Ordering::Acquire) {
                cancelled = true;
                break;
            }
            reader.read_exact(&mut raw).map_err(|e| io_error(path, e))?;
            match index.link(format::decode(fmt, &raw), order) {
                Linked::Inserted => {}
                Linked::Merged => duplicates += 1,
            }
            read += 1;
        }
        (was_empty, index.positions() - positions_before)
    };

    if !fmt.is_current() && !cancelled {
        tracing::info!(
            from = fmt.version(),
            to = Format::V2.version(),
            "upgrading experience file"
        );
        save_full_shared(shared, path)?;
    }

    let fragmentation = if was_empty && read > 0 {
        Some(duplicates as f64 * 100.0 / read as f64)
    } else {
        None
    };
    tracing::info!(
        total = read,
        new_moves = read - duplicates,
        new_positions,
        duplicates,
        cancelled,
        "experience file loaded"
    );
    Ok(LoadOutcome {
        ok: !cancelled,
        format: Some(fmt),
        total_moves: read,
        new_moves: read - duplicates,
        new_positions,
        duplicates,
        fragmentation,
        cancelled,
    })
}

fn save_full_shared(shared: &Shared, path: &Path) -> Result<SaveSummary, StoreError> {
    let backup = backup_path(path);
    let existed = path.exists();
    if existed {
        let _ = fs::remove_file(&backup);
        fs::rename(path, &backup).map_err(|e| io_error(path, e))?;
    }
    match write_index(shared, path) {
        Ok(summary) => Ok(summary),
        Err(err) => {
            if existed {
                let _ = fs::remove_file(path);
                let _ = fs::rename(&backup, path);
            }
            Err(err)
        }
    }
}

fn write_index(shared: &Shared, path: &Path) -> Result<SaveSummary, StoreError> {
    let file = open_for_append(path)?;
    let len = file_len(&file, path)?;
    let mut out = BufWriter::with_capacity(WRITE_CHUNK, file);
    if len == 0 {
        write_all(&mut out, SIGNATURE_V2, path)?;
    }
    let mut index = shared.index.lock().unwrap();
    let total_written = write_chains(&index, &mut out, path)?;
    flush(&mut out, path)?;
    // The rewrite is on disk; only now fold the same scaling into the live
    // index. A failed write leaves the counts exactly as they were, so a
    // retried save scales once, not twice.
    commit_count_scaling(&mut index);
    drop(index);
    tracing::info!(total = total_written, "experience file rewritten");
    Ok(SaveSummary {
        pv_written: 0,
        multipv_written: 0,
        total_written,
    })
}

/// Writes every chain with the per-chain count scaling applied to the
/// records as written. The index itself is not touched.
fn write_chains<W: Write>(
    index: &PositionIndex,
    out: &mut W,
    path: &Path,
) -> Result<usize, StoreError> {
    let mut total = 0;
    for chain in index.iter() {
        let scale = chain_scale(chain);
        for entry in chain {
            let mut scaled = *entry;
            scaled.count = cmp::max(scaled.count / scale, 1);
            if scaled.depth >= MIN_DEPTH {
                write_all(out, &format::encode(&scaled), path)?;
                total += 1;
            }
        }
    }
    Ok(total)
}

/// Applies the count scaling a full save writes to the in-memory chains.
fn commit_count_scaling(index: &mut PositionIndex) {
    for chain in index.iter_mut() {
        let scale = chain_scale(chain);
        for entry in chain.iter_mut() {
            entry.count = cmp::max(entry.count / scale, 1);
        }
    }
}

fn chain_scale(chain: &[ExperienceEntry]) -> u16 {
    1 + chain.iter().map(|e| e.count).max().unwrap_or(1) / 128
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".bak");
    PathBuf::from(name)
}

fn io_error(path: &Path, source: io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_owned(),
        source,
    }
}

fn open_for_append(path: &Path) -> Result<File, StoreError> {
    OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .map_err(|e| io_error(path, e))
}

fn file_len(file: &File, path: &Path) -> Result<u64, StoreError> {
    Ok(file.metadata().map_err(|e| io_error(path, e))?.len())
}

fn write_all<W: Write>(out: &mut W, bytes: &[u8], path: &Path) -> Result<(), StoreError> {
    out.write_all(bytes).map_err(|e| io_error(path, e))
}

fn flush<W: Write>(out: &mut W, path: &Path) -> Result<(), StoreError> {
    out.flush().map_err(|e| io_error(path, e))
}
