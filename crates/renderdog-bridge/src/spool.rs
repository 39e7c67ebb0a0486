use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant, SystemTime},
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::{
    Request, Response, SpoolError,
    protocol::{age_since, unix_now},
};

const HEARTBEAT_FILE: &str = "heartbeat";
const SNAPSHOT_FILE: &str = "bridge_diagnostics.json";

/// Request/response slot pairs in the spool. The diagnostics pair is independent of the call pair
/// so a hung call never blocks a diagnostics query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Call,
    Diagnostics,
}

impl Slot {
    fn prefix(self) -> &'static str {
        match self {
            Slot::Call => "",
            Slot::Diagnostics => "diagnostics.",
        }
    }

    fn request_file(self) -> String {
        format!("{}request.json", self.prefix())
    }

    fn inflight_file(self) -> String {
        format!("{}request.inflight.json", self.prefix())
    }

    fn response_file(self) -> String {
        format!("{}response.json", self.prefix())
    }

    fn lock_file(self) -> String {
        match self {
            Slot::Call => "lock".to_string(),
            Slot::Diagnostics => "diagnostics.lock".to_string(),
        }
    }
}

/// Returned by [`SpoolStore::publish`]; identifies the response the publisher waits for.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub slot: Slot,
    pub request: Request,
    pub published: Instant,
}

/// Result of inspecting an unclaimed leftover before publishing.
#[derive(Debug, Clone, PartialEq)]
pub enum Leftover {
    /// The slot is free (or the remote side claimed the previous request).
    None,
    /// An unclaimed request was withdrawn from the slot and must be accounted for.
    Withdrawn(Option<Request>),
}

/// Queue depth derived from the spool itself.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SlotQueue {
    pub pending_count: u64,
    pub oldest_pending_age: Option<Duration>,
}

/// The shared directory both processes exchange messages through.
///
/// Every write goes to a unique temporary file first and is renamed into place, so readers only
/// ever see complete messages. Every read of a slot claims the file by renaming it away, so each
/// published message is consumed at most once.
#[derive(Debug, Clone)]
pub struct SpoolStore {
    dir: PathBuf,
}

impl SpoolStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates the spool directory (remote side).
    pub fn ensure_dir(&self) -> Result<(), SpoolError> {
        fs::create_dir_all(&self.dir).map_err(|e| SpoolError::io("create spool dir", &self.dir, e))
    }

    /// Fails when the directory is missing (client side; the remote owns its creation).
    pub fn check_available(&self) -> Result<(), SpoolError> {
        if self.dir.is_dir() {
            Ok(())
        } else {
            Err(SpoolError::MissingDir(self.dir.clone()))
        }
    }

    pub fn request_path(&self, slot: Slot) -> PathBuf {
        self.dir.join(slot.request_file())
    }

    pub fn response_path(&self, slot: Slot) -> PathBuf {
        self.dir.join(slot.response_file())
    }

    pub fn lock_path(&self, slot: Slot) -> PathBuf {
        self.dir.join(slot.lock_file())
    }

    pub fn heartbeat_path(&self) -> PathBuf {
        self.dir.join(HEARTBEAT_FILE)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    /// Writes `payload` to a unique temp file in the spool and renames it over `path`.
    pub fn write_json_atomic<T: Serialize>(&self, path: &Path, payload: &T) -> Result<(), SpoolError> {
        let bytes = serde_json::to_vec(payload).map_err(|source| SpoolError::Encode {
            path: path.to_path_buf(),
            source,
        })?;
        self.write_bytes_atomic(path, &bytes)
    }

    fn write_bytes_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), SpoolError> {
        let tmp = self.unique_sibling(path, "tmp");
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp);
            return Err(SpoolError::io("write", &tmp, e));
        }
        fs::rename(&tmp, path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            SpoolError::io("publish", path, e)
        })
    }

    fn unique_sibling(&self, path: &Path, tag: &str) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "spool".to_string());
        self.dir.join(format!(
            "{name}.{tag}.{}.{}",
            std::process::id(),
            Uuid::new_v4().simple()
        ))
    }

    /// Atomically moves `path` aside and parses it. `Ok(None)` when nothing is there.
    fn claim<T: DeserializeOwned>(&self, path: &Path, claimed: &Path) -> Result<Option<T>, SpoolError> {
        match fs::rename(path, claimed) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SpoolError::io("claim", path, e)),
        }
        let read = fs::read(claimed);
        let _ = fs::remove_file(claimed);
        let bytes = read.map_err(|e| SpoolError::io("read", claimed, e))?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| SpoolError::Corrupt {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Takes an unclaimed request out of the slot so the publisher can account for it.
    pub fn withdraw_request(&self, slot: Slot) -> Result<Leftover, SpoolError> {
        let path = self.request_path(slot);
        let aside = self.unique_sibling(&path, "withdrawn");
        match self.claim::<Request>(&path, &aside) {
            Ok(None) => Ok(Leftover::None),
            Ok(Some(request)) => Ok(Leftover::Withdrawn(Some(request))),
            Err(SpoolError::Corrupt { .. }) => Ok(Leftover::Withdrawn(None)),
            Err(e) => Err(e),
        }
    }

    /// Peeks at the request slot without claiming it.
    pub fn has_pending_request(&self, slot: Slot) -> bool {
        self.request_path(slot).is_file()
    }

    pub fn publish(&self, slot: Slot, request: &Request) -> Result<PendingRequest, SpoolError> {
        self.write_json_atomic(&self.request_path(slot), request)?;
        Ok(PendingRequest {
            slot,
            request: request.clone(),
            published: Instant::now(),
        })
    }

    /// Claims the next request in `slot`, if any (remote side).
    pub fn poll_for_request(&self, slot: Slot) -> Result<Option<Request>, SpoolError> {
        let path = self.request_path(slot);
        let inflight = self.dir.join(slot.inflight_file());
        self.claim(&path, &inflight)
    }

    pub fn publish_response(&self, slot: Slot, response: &Response) -> Result<(), SpoolError> {
        self.write_json_atomic(&self.response_path(slot), response)
    }

    /// Claims whatever response currently sits in `slot`, matching or not.
    pub fn take_response(&self, slot: Slot) -> Result<Option<Response>, SpoolError> {
        let path = self.response_path(slot);
        let claimed = self.unique_sibling(&path, "claimed");
        self.claim(&path, &claimed)
    }

    pub fn pending(&self, slot: Slot) -> SlotQueue {
        let path = self.request_path(slot);
        match fs::metadata(&path) {
            Ok(meta) => SlotQueue {
                pending_count: 1,
                oldest_pending_age: meta
                    .modified()
                    .ok()
                    .and_then(|m| SystemTime::now().duration_since(m).ok()),
            },
            Err(_) => SlotQueue::default(),
        }
    }

    pub fn write_heartbeat(&self) -> Result<(), SpoolError> {
        self.write_bytes_atomic(&self.heartbeat_path(), format!("{:.3}", unix_now()).as_bytes())
    }

    pub fn read_heartbeat(&self) -> Option<f64> {
        let raw = fs::read_to_string(self.heartbeat_path()).ok()?;
        raw.trim().parse::<f64>().ok()
    }

    /// `None` when the marker is missing or unreadable.
    pub fn heartbeat_age(&self) -> Option<Duration> {
        self.read_heartbeat().and_then(age_since)
    }

    pub fn remove_heartbeat(&self) {
        let _ = remove_if_exists(&self.heartbeat_path());
    }

    pub fn persist_snapshot<T: Serialize>(&self, snapshot: &T) -> Result<(), SpoolError> {
        self.write_json_atomic(&self.snapshot_path(), snapshot)
    }

    pub fn read_snapshot<T: DeserializeOwned>(&self) -> Result<Option<T>, SpoolError> {
        let path = self.snapshot_path();
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SpoolError::io("read", &path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| SpoolError::Corrupt { path, source })
    }

    /// Removes leftovers from a previous run: slot files, claimed/withdrawn/temp files and the
    /// persisted snapshot. Lock files are left alone; they recover through staleness.
    pub fn clear_leftovers(&self) -> Result<usize, SpoolError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(SpoolError::io("list", &self.dir, e)),
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
            let is_slot_file = [Slot::Call, Slot::Diagnostics].iter().any(|slot| {
                name == slot.request_file()
                    || name == slot.inflight_file()
                    || name == slot.response_file()
            });
            let is_scratch = [".tmp.", ".claimed.", ".withdrawn."]
                .iter()
                .any(|tag| name.contains(tag));
            if (is_slot_file || is_scratch || name == SNAPSHOT_FILE)
                && fs::remove_file(entry.path()).is_ok()
            {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<(), std::io::Error> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LockOwner {
    pid: u32,
    token: String,
    acquired_at: f64,
}

/// Cross-process exclusive token for one slot, backed by a lock file created with
/// `create_new`. A lock older than the staleness age is treated as abandoned.
///
/// `acquired_at` is never refreshed, so a holder must release well within the staleness age;
/// [`BridgeConfig::cap_timeout`](crate::BridgeConfig::cap_timeout) keeps call budgets under
/// that limit.
#[derive(Debug)]
pub struct SlotLock {
    path: PathBuf,
    token: String,
    recovered_from: Option<String>,
}

impl SlotLock {
    pub fn acquire(
        store: &SpoolStore,
        slot: Slot,
        deadline: Instant,
        stale_after: Duration,
        retry: Duration,
    ) -> Result<Self, SpoolError> {
        let path = store.lock_path(slot);
        let owner = LockOwner {
            pid: std::process::id(),
            token: Uuid::new_v4().to_string(),
            acquired_at: unix_now(),
        };
        let mut recovered_from = None;
        loop {
            match Self::try_create(&path, &owner) {
                Ok(()) => {
                    return Ok(Self {
                        path,
                        token: owner.token,
                        recovered_from,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(SpoolError::io("create lock", &path, e)),
            }

            let holder = read_owner(&path);
            let age = holder
                .as_ref()
                .and_then(|h| age_since(h.acquired_at))
                .or_else(|| file_age(&path));
            if let Some(age) = age
                && age > stale_after
                && Self::break_stale(store, &path, holder.as_ref())
            {
                tracing::warn!(
                    lock = %path.display(),
                    age_sec = age.as_secs_f64(),
                    "recovered stale slot lock"
                );
                recovered_from = Some(describe_owner(holder.as_ref(), Some(age)));
                continue;
            }

            if Instant::now() >= deadline {
                return Err(SpoolError::LockContended {
                    path,
                    holder: describe_owner(holder.as_ref(), age),
                });
            }
            std::thread::sleep(retry);
        }
    }

    fn try_create(path: &Path, owner: &LockOwner) -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let bytes = serde_json::to_vec(owner).map_err(std::io::Error::other)?;
        file.write_all(&bytes)?;
        file.sync_all()
    }

    /// Moves a stale lock aside. If someone replaced it with a fresh lock in the meantime, the
    /// fresh one is put back.
    fn break_stale(store: &SpoolStore, path: &Path, seen: Option<&LockOwner>) -> bool {
        let aside = store.unique_sibling(path, "stale");
        if fs::rename(path, &aside).is_err() {
            return false;
        }
        let moved = read_owner(&aside);
        let same = match (seen, moved.as_ref()) {
            (Some(a), Some(b)) => a.token == b.token,
            (None, None) => true,
            _ => false,
        };
        if !same {
            let _ = fs::hard_link(&aside, path);
        }
        let _ = fs::remove_file(&aside);
        same
    }

    /// Description of the abandoned holder this acquisition replaced, if any.
    pub fn recovered_from(&self) -> Option<&str> {
        self.recovered_from.as_deref()
    }
}

impl Drop for SlotLock {
    fn drop(&mut self) {
        // Only release our own lock; after a stale recovery the file belongs to someone else.
        if read_owner(&self.path).is_some_and(|o| o.token == self.token) {
            let _ = remove_if_exists(&self.path);
        }
    }
}

fn read_owner(path: &Path) -> Option<LockOwner> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn file_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

fn describe_owner(owner: Option<&LockOwner>, age: Option<Duration>) -> String {
    let age = age
        .map(|a| format!("{:.1}s", a.as_secs_f64()))
        .unwrap_or_else(|| "unknown age".to_string());
    match owner {
        Some(o) => format!("pid {} ({age})", o.pid),
        None => format!("unknown owner ({age})"),
    }
}
