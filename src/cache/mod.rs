//! Directory handle cache
//!
//! Resolving a plaintext path means walking the backing tree component by
//! component, reading each directory's IV on the way. This cache keeps the
//! last few resolved directories as `(plaintext relative path, O_PATH
//! descriptor, directory IV)` so consecutive operations in the same
//! directory skip the walk. Three round-robin slots are enough for parallel
//! archive extractions to hit well over 90%.
//!
//! A purger thread empties the cache once per second. That bounds how long
//! a deleted or renamed directory stays reachable through a cached
//! descriptor.

use crate::names::DIRIV_LEN;
use nix::unistd::{close, dup};
use parking_lot::Mutex;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Number of cache slots.
pub const DIR_CACHE_SIZE: usize = 3;

/// How often the purger empties the cache.
const PURGE_INTERVAL: Duration = Duration::from_secs(1);

struct Entry {
    rel_path: String,
    fd: RawFd,
    iv: [u8; DIRIV_LEN],
}

impl Entry {
    fn close_fd(&mut self) {
        if let Err(e) = close(self.fd) {
            warn!(fd = self.fd, "dircache: close failed: {}", e);
        }
    }
}

#[derive(Default)]
struct Slots {
    entries: [Option<Entry>; DIR_CACHE_SIZE],
    // Round-robin replacement works well enough.
    next_index: usize,
}

impl Slots {
    fn clear(&mut self) {
        for slot in self.entries.iter_mut() {
            if let Some(mut e) = slot.take() {
                e.close_fd();
            }
        }
    }
}

/// Bounded cache of open directory handles and their IVs.
pub struct DirCache {
    slots: Arc<Mutex<Slots>>,
    purger: Mutex<Option<Purger>>,
}

struct Purger {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl DirCache {
    pub fn new() -> Self {
        DirCache {
            slots: Arc::new(Mutex::new(Slots::default())),
            purger: Mutex::new(None),
        }
    }

    /// Store `(rel_path, fd, iv)`. The descriptor is duplicated; the caller
    /// keeps ownership of its own copy. The evicted slot's descriptor is
    /// closed under the lock.
    pub fn store(&self, rel_path: &str, fd: RawFd, iv: &[u8; DIRIV_LEN]) {
        // Descriptors 0-2 are pinned to scratch files at startup; seeing one
        // here means an ownership bug that silently corrupts standard
        // streams if tolerated.
        if fd <= 2 {
            panic!("dircache: refusing to store fd {}", fd);
        }
        let fd2 = match dup(fd) {
            Ok(fd2) => fd2,
            Err(e) => {
                warn!("dircache: dup failed: {}", e);
                return;
            }
        };
        let mut slots = self.slots.lock();
        let index = slots.next_index;
        slots.next_index = (index + 1) % DIR_CACHE_SIZE;
        if let Some(mut old) = slots.entries[index].take() {
            old.close_fd();
        }
        debug!(rel_path, fd = fd2, "dircache: store");
        slots.entries[index] = Some(Entry {
            rel_path: rel_path.to_string(),
            fd: fd2,
            iv: *iv,
        });
        drop(slots);
        self.ensure_purger();
    }

    /// Look up a directory by plaintext relative path. On a hit the stored
    /// descriptor is duplicated and the duplicate is owned by the caller.
    pub fn lookup(&self, rel_path: &str) -> Option<(OwnedFd, [u8; DIRIV_LEN])> {
        let slots = self.slots.lock();
        for slot in slots.entries.iter().flatten() {
            if slot.rel_path != rel_path {
                continue;
            }
            if slot.fd <= 2 {
                panic!("dircache: fd {} in cache slot", slot.fd);
            }
            let fd2 = match dup(slot.fd) {
                Ok(fd2) => fd2,
                Err(e) => {
                    warn!("dircache: dup failed: {}", e);
                    return None;
                }
            };
            debug!(rel_path, fd = fd2, "dircache: hit");
            return Some((unsafe { OwnedFd::from_raw_fd(fd2) }, slot.iv));
        }
        debug!(rel_path, "dircache: miss");
        None
    }

    /// Close all descriptors and empty all slots.
    pub fn clear(&self) {
        self.slots.lock().clear();
    }

    fn ensure_purger(&self) {
        let mut purger = self.purger.lock();
        if purger.is_some() {
            return;
        }
        let (stop, stop_rx) = mpsc::channel::<()>();
        let slots = Arc::clone(&self.slots);
        let handle = std::thread::spawn(move || loop {
            match stop_rx.recv_timeout(PURGE_INTERVAL) {
                Err(RecvTimeoutError::Timeout) => slots.lock().clear(),
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
        });
        *purger = Some(Purger { stop, handle });
    }
}

impl Default for DirCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DirCache {
    fn drop(&mut self) {
        if let Some(purger) = self.purger.get_mut().take() {
            let _ = purger.stop.send(());
            let _ = purger.handle.join();
        }
        self.slots.lock().clear();
    }
}
