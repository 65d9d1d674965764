//! Named advisory locks for kiln's critical sections: stage builds
//! (`stage:{signature}`), local runtime image namespace mutation
//! (`image:{localName}`), and per-(repo,tag) publish serialization
//! (`image:{repo}:{tag}`).
//!
//! Composed of two layers, both held by one [`LockManager`]:
//! - an in-process registry (`Mutex`/`Condvar` per name) that serializes
//!   same-process contenders first;
//! - a cross-process file lock, one file per lock name, using an
//!   atomic-rename-then-check protocol.
//!
//! Cross-process locking only has an exclusive mode — there is no portable
//! atomic primitive for a cross-process *shared* lock without `flock`.
//! Shared mode is fully supported in-process; cross-process shared
//! acquisition is treated as exclusive (documented in DESIGN.md).

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kiln_types::{KilnError, KilnErrorKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    pub mode: LockMode,
    /// `None` means block indefinitely.
    pub timeout: Option<Duration>,
    /// If true, never block: fail immediately with `lock-timeout` if the
    /// lock cannot be taken right away.
    pub non_blocking: bool,
}

impl LockOptions {
    pub fn exclusive() -> Self {
        Self { mode: LockMode::Exclusive, timeout: None, non_blocking: false }
    }

    pub fn shared() -> Self {
        Self { mode: LockMode::Shared, timeout: None, non_blocking: false }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn non_blocking(mut self) -> Self {
        self.non_blocking = true;
        self
    }
}

/// Opaque token returned by [`LockManager::lock`]. Its lifetime is the
/// critical section; dropping it without calling [`LockManager::unlock`]
/// leaks the in-process slot. Callers are expected to always unlock;
/// explicit unlock (rather than `Drop`-releases-on-scope-exit) lets the
/// Conveyor detect lock misuse.
#[derive(Debug)]
pub struct LockHandle {
    name: String,
    mode: LockMode,
    token: u64,
    cross_process: Option<CrossProcessGuard>,
}

impl LockHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

#[derive(Debug)]
struct CrossProcessGuard {
    path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockFileInfo {
    pid: u32,
    hostname: String,
    acquired_at: DateTime<Utc>,
    lock_name: String,
}

#[derive(Default)]
struct NamedLockState {
    exclusive_holder: Option<u64>,
    shared_holders: std::collections::HashSet<u64>,
}

impl NamedLockState {
    fn is_free_for(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Exclusive => self.exclusive_holder.is_none() && self.shared_holders.is_empty(),
            LockMode::Shared => self.exclusive_holder.is_none(),
        }
    }

    fn acquire(&mut self, mode: LockMode, token: u64) {
        match mode {
            LockMode::Exclusive => self.exclusive_holder = Some(token),
            LockMode::Shared => {
                self.shared_holders.insert(token);
            }
        }
    }

    fn release(&mut self, mode: LockMode, token: u64) -> Result<(), KilnError> {
        match mode {
            LockMode::Exclusive => {
                if self.exclusive_holder != Some(token) {
                    return Err(lock_misuse("exclusive unlock by non-owner or double-unlock"));
                }
                self.exclusive_holder = None;
            }
            LockMode::Shared => {
                if !self.shared_holders.remove(&token) {
                    return Err(lock_misuse("shared unlock by non-owner or double-unlock"));
                }
            }
        }
        Ok(())
    }
}

fn lock_misuse(detail: impl Into<String>) -> KilnError {
    KilnError::new(KilnErrorKind::LockMisuse, detail)
}

struct Slot {
    state: Mutex<NamedLockState>,
    condvar: Condvar,
}

/// Owns every named lock for one invocation. Cross-process locks are rooted
/// at `cross_process_dir` (typically the project's `.kiln` work directory);
/// pass `None` to disable cross-process locking entirely (tests, or a
/// read-only command that never races another process).
pub struct LockManager {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    next_token: Mutex<u64>,
    cross_process_dir: Option<PathBuf>,
}

impl LockManager {
    pub fn new(cross_process_dir: Option<PathBuf>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_token: Mutex::new(1),
            cross_process_dir,
        }
    }

    fn take_token(&self) -> u64 {
        let mut next = self.next_token.lock().expect("lock manager token mutex poisoned");
        let token = *next;
        *next += 1;
        token
    }

    fn slot_for(&self, name: &str) -> Arc<Slot> {
        let mut slots = self.slots.lock().expect("lock manager registry mutex poisoned");
        slots
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Slot { state: Mutex::new(NamedLockState::default()), condvar: Condvar::new() }))
            .clone()
    }

    pub fn lock(&self, name: &str, options: LockOptions) -> Result<LockHandle, KilnError> {
        let token = self.take_token();
        let slot = self.slot_for(name);
        self.acquire_in_process(&slot, name, options, token)?;

        let cross_process = match &self.cross_process_dir {
            Some(dir) => match self.acquire_cross_process(dir, name, options) {
                Ok(guard) => Some(guard),
                Err(err) => {
                    let mut state = slot.state.lock().expect("named lock state mutex poisoned");
                    let _ = state.release(options.mode, token);
                    drop(state);
                    slot.condvar.notify_all();
                    return Err(err);
                }
            },
            None => None,
        };

        Ok(LockHandle { name: name.to_string(), mode: options.mode, token, cross_process })
    }

    fn acquire_in_process(&self, slot: &Arc<Slot>, name: &str, options: LockOptions, token: u64) -> Result<(), KilnError> {
        let mut state = slot.state.lock().expect("named lock state mutex poisoned");
        if state.is_free_for(options.mode) {
            state.acquire(options.mode, token);
            return Ok(());
        }
        if options.non_blocking {
            return Err(KilnError::new(
                KilnErrorKind::LockTimeout,
                format!("lock {name} held; non-blocking acquire refused"),
            ));
        }

        let deadline = options.timeout.map(|d| Instant::now() + d);
        loop {
            let wait_result = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(KilnError::new(KilnErrorKind::LockTimeout, format!("timed out waiting for lock {name}")));
                    }
                    let (guard, timeout_result) = slot
                        .condvar
                        .wait_timeout(state, remaining)
                        .expect("named lock condvar mutex poisoned");
                    state = guard;
                    if timeout_result.timed_out() && !state.is_free_for(options.mode) {
                        return Err(KilnError::new(KilnErrorKind::LockTimeout, format!("timed out waiting for lock {name}")));
                    }
                    Ok(())
                }
                None => {
                    state = slot.condvar.wait(state).expect("named lock condvar mutex poisoned");
                    Ok(())
                }
            };
            wait_result?;
            if state.is_free_for(options.mode) {
                state.acquire(options.mode, token);
                return Ok(());
            }
        }
    }

    fn acquire_cross_process(&self, dir: &Path, name: &str, options: LockOptions) -> Result<CrossProcessGuard, KilnError> {
        fs::create_dir_all(dir)
            .map_err(|e| KilnError::new(KilnErrorKind::LockTimeout, format!("failed to create lock dir: {e}")).with_source(e))?;
        let path = dir.join(format!("{}.lock", sanitize_lock_name(name)));

        let deadline = options.timeout.map(|d| Instant::now() + d);
        loop {
            match try_create_lock_file(&path, name) {
                Ok(()) => return Ok(CrossProcessGuard { path }),
                Err(_) if options.non_blocking => {
                    return Err(KilnError::new(KilnErrorKind::LockTimeout, format!("cross-process lock {name} held")));
                }
                Err(_) => {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return Err(KilnError::new(KilnErrorKind::LockTimeout, format!("timed out waiting for cross-process lock {name}")));
                        }
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
            }
        }
    }

    /// Release a previously acquired handle. Double-unlock and wrong-owner
    /// unlock (a stale handle whose token no longer matches the registry)
    /// are programmer errors and return `KilnErrorKind::LockMisuse`, which
    /// the Conveyor treats as fatal rather than retryable.
    pub fn unlock(&self, handle: LockHandle) -> Result<(), KilnError> {
        let slot = self.slot_for(&handle.name);
        let result = {
            let mut state = slot.state.lock().expect("named lock state mutex poisoned");
            state.release(handle.mode, handle.token)
        };
        slot.condvar.notify_all();
        if let Some(guard) = handle.cross_process {
            let _ = fs::remove_file(&guard.path);
        }
        result
    }
}

fn sanitize_lock_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// `create_new` is the atomic primitive: the open fails with `AlreadyExists`
/// if another process won the race, so there is no separate check-then-act
/// window the way a plain `exists()` check would leave.
fn try_create_lock_file(path: &Path, lock_name: &str) -> anyhow::Result<()> {
    let info = LockFileInfo {
        pid: std::process::id(),
        hostname: gethostname::gethostname().to_string_lossy().to_string(),
        acquired_at: Utc::now(),
        lock_name: lock_name.to_string(),
    };
    let mut file = File::options().write(true).create_new(true).open(path)?;
    file.write_all(serde_json::to_string(&info)?.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_lock_excludes_second_exclusive() {
        let mgr = LockManager::new(None);
        let h1 = mgr.lock("stage:abc", LockOptions::exclusive()).expect("first lock");
        let err = mgr.lock("stage:abc", LockOptions::exclusive().non_blocking()).unwrap_err();
        assert_eq!(err.kind, KilnErrorKind::LockTimeout);
        mgr.unlock(h1).expect("unlock");
        let h2 = mgr.lock("stage:abc", LockOptions::exclusive().non_blocking());
        assert!(h2.is_ok());
    }

    #[test]
    fn shared_locks_coexist() {
        let mgr = LockManager::new(None);
        let h1 = mgr.lock("image:web", LockOptions::shared()).expect("first shared");
        let h2 = mgr.lock("image:web", LockOptions::shared().non_blocking()).expect("second shared");
        mgr.unlock(h1).unwrap();
        mgr.unlock(h2).unwrap();
    }

    #[test]
    fn shared_lock_blocks_exclusive() {
        let mgr = LockManager::new(None);
        let h1 = mgr.lock("image:web", LockOptions::shared()).expect("shared");
        let err = mgr.lock("image:web", LockOptions::exclusive().non_blocking()).unwrap_err();
        assert_eq!(err.kind, KilnErrorKind::LockTimeout);
        mgr.unlock(h1).unwrap();
    }

    #[test]
    fn double_unlock_is_reported_as_lock_misuse() {
        let mgr = LockManager::new(None);
        let h1 = mgr.lock("stage:x", LockOptions::exclusive()).unwrap();
        let token = h1.token;
        let name = h1.name.clone();
        mgr.unlock(h1).unwrap();
        let ghost = LockHandle { name, mode: LockMode::Exclusive, token, cross_process: None };
        let err = mgr.unlock(ghost).unwrap_err();
        assert_eq!(err.kind, KilnErrorKind::LockMisuse);
        assert!(err.kind.is_fatal_programmer_error());
    }

    #[test]
    fn composed_locks_stage_then_image_does_not_deadlock() {
        let mgr = LockManager::new(None);
        let stage = mgr.lock("stage:sig1", LockOptions::exclusive()).unwrap();
        let image = mgr.lock("image:web", LockOptions::exclusive()).unwrap();
        mgr.unlock(image).unwrap();
        mgr.unlock(stage).unwrap();
    }

    #[test]
    fn cross_process_lock_excludes_second_manager() {
        let dir = tempfile::tempdir().unwrap();
        let mgr_a = LockManager::new(Some(dir.path().to_path_buf()));
        let mgr_b = LockManager::new(Some(dir.path().to_path_buf()));
        let h1 = mgr_a.lock("image:repo:tag", LockOptions::exclusive()).unwrap();
        let err = mgr_b.lock("image:repo:tag", LockOptions::exclusive().non_blocking()).unwrap_err();
        assert_eq!(err.kind, KilnErrorKind::LockTimeout);
        mgr_a.unlock(h1).unwrap();
        let h2 = mgr_b.lock("image:repo:tag", LockOptions::exclusive().non_blocking());
        assert!(h2.is_ok());
    }

    #[test]
    fn lock_name_with_colons_is_sanitized_for_filesystem() {
        assert_eq!(sanitize_lock_name("image:repo/name:tag"), "image_repo_name_tag");
    }
}
