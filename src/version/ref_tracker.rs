//! File liveness tracking.
//!
//! A dedicated coordinator thread owns the per-file reference counts. It
//! consumes three event streams: a version being published (with its full
//! file list), a published version being superseded (the add/delete delta
//! of the record that replaced it), and a version's last reference going
//! away. Versions are kept "virtual" — not yet expanded into per-file
//! counts — until the backlog exceeds a threshold or the oldest entry ages
//! out; expansion then proceeds in strict version order. Short-lived
//! versions therefore come and go as pure delta arithmetic without
//! touching most files' counts at all.
//!
//! When a file's count drops to zero no reachable version references it
//! and it is handed to the deletion callback.

use std::collections::{HashMap, HashSet};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};

/// Backlog size beyond which virtual versions are expanded.
const MAX_VIRTUAL_VERSIONS: u64 = 256;

/// Age beyond which the oldest virtual version is expanded.
const MAX_VIRTUAL_AGE: Duration = Duration::from_secs(5 * 60);

pub enum RefEvent {
    /// A version was published with this file list.
    Ref {
        vid: u64,
        files: Vec<u64>,
        created: Instant,
    },
    /// The version was superseded; the committed record added and deleted
    /// these file numbers.
    Delta {
        vid: u64,
        added: Vec<u64>,
        deleted: Vec<u64>,
    },
    /// The version's reference count reached zero.
    Release { vid: u64, files: Vec<u64> },
    /// Shut the coordinator down.
    Close,
}

/// Runs the coordinator thread and hands out its event sender.
pub struct RefTracker {
    tx: Sender<RefEvent>,
    handle: Option<JoinHandle<()>>,
}

impl RefTracker {
    /// `on_zero` receives each file number whose count reaches zero.
    pub fn start(on_zero: Box<dyn Fn(u64) + Send>) -> Self {
        let (tx, rx) = unbounded();
        let handle = std::thread::Builder::new()
            .name("emberdb-refs".to_string())
            .spawn(move || coordinator_loop(rx, on_zero))
            .expect("failed to spawn ref coordinator");
        Self {
            tx,
            handle: Some(handle),
        }
    }

    pub fn sender(&self) -> Sender<RefEvent> {
        self.tx.clone()
    }

    /// Stops the thread; events already queued are processed first.
    pub fn stop(mut self) {
        let _ = self.tx.send(RefEvent::Close);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct VirtualVersion {
    files: Vec<u64>,
    created: Instant,
}

struct Delta {
    added: Vec<u64>,
    deleted: Vec<u64>,
}

struct Coordinator {
    file_refs: HashMap<u64, i64>,
    virtuals: HashMap<u64, VirtualVersion>,
    deltas: HashMap<u64, Delta>,
    /// Released while still virtual: the delta (possibly none) to apply
    /// when its turn comes.
    released: HashMap<u64, Option<Delta>>,
    /// Versions already expanded into file counts.
    expanded: HashSet<u64>,
    /// Files deleted by some committed record; only these are unlinked
    /// when their count reaches zero. A count that dips to zero through
    /// expansion arithmetic alone belongs to a still-virtual version.
    doomed: HashSet<u64>,
    /// Next version id to expand or retire; strictly monotonic.
    next: u64,
    /// Highest version id seen.
    last: u64,
    on_zero: Box<dyn Fn(u64) + Send>,
}

impl Coordinator {
    fn add_file_ref(&mut self, num: u64, delta: i64) {
        let count = self.file_refs.entry(num).or_insert(0);
        *count += delta;
        if *count < 0 {
            // State damage; continuing would delete live files.
            panic!("file {num} reference count went negative");
        }
        if *count == 0 {
            self.file_refs.remove(&num);
            if self.doomed.remove(&num) {
                (self.on_zero)(num);
            }
        }
    }

    fn apply_delta(&mut self, delta: &Delta) {
        for &num in &delta.added {
            self.add_file_ref(num, 1);
        }
        for &num in &delta.deleted {
            self.doomed.insert(num);
            self.add_file_ref(num, -1);
        }
    }

    /// Expands or retires versions in id order as far as possible.
    fn process(&mut self) {
        // Virtual versions old or numerous enough become per-file counts.
        loop {
            if self.released.contains_key(&self.next) {
                break;
            }
            let expand = match self.virtuals.get(&self.next) {
                None => return,
                Some(v) => {
                    self.last - self.next > MAX_VIRTUAL_VERSIONS
                        || v.created.elapsed() > MAX_VIRTUAL_AGE
                }
            };
            if !expand {
                return;
            }
            let version = self
                .virtuals
                .remove(&self.next)
                .expect("virtual version vanished");
            for num in version.files {
                self.add_file_ref(num, 1);
            }
            if let Some(delta) = self.deltas.remove(&self.next) {
                self.apply_delta(&delta);
            }
            self.expanded.insert(self.next);
            self.next += 1;
        }

        // Retire released virtual versions, applying only their deltas:
        // their base file lists were never counted.
        while let Some(delta) = self.released.remove(&self.next) {
            if let Some(delta) = delta {
                self.apply_delta(&delta);
            }
            self.virtuals.remove(&self.next);
            self.next += 1;
        }
    }

    fn handle(&mut self, event: RefEvent) {
        match event {
            RefEvent::Ref { vid, files, created } => {
                if self.virtuals.contains_key(&vid) {
                    panic!("version {vid} published twice");
                }
                self.virtuals.insert(vid, VirtualVersion { files, created });
                if vid > self.last {
                    self.last = vid;
                }
            }
            RefEvent::Delta { vid, added, deleted } => {
                let delta = Delta { added, deleted };
                if self.virtuals.contains_key(&vid) {
                    self.deltas.insert(vid, delta);
                } else if self.expanded.contains(&vid) {
                    self.apply_delta(&delta);
                } else {
                    panic!("delta for unknown version {vid}");
                }
            }
            RefEvent::Release { vid, files } => {
                if self.virtuals.contains_key(&vid) {
                    self.released.insert(vid, self.deltas.remove(&vid));
                } else if self.expanded.remove(&vid) {
                    for num in files {
                        self.add_file_ref(num, -1);
                    }
                } else {
                    panic!("release for unknown version {vid}");
                }
            }
            RefEvent::Close => {}
        }
    }
}

fn coordinator_loop(rx: Receiver<RefEvent>, on_zero: Box<dyn Fn(u64) + Send>) {
    let mut coordinator = Coordinator {
        file_refs: HashMap::new(),
        virtuals: HashMap::new(),
        deltas: HashMap::new(),
        released: HashMap::new(),
        expanded: HashSet::new(),
        doomed: HashSet::new(),
        next: 0,
        last: 0,
        on_zero,
    };

    loop {
        match rx.recv_timeout(Duration::from_secs(60)) {
            Ok(RefEvent::Close) => break,
            Ok(event) => coordinator.handle(event),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
        coordinator.process();
    }
    tracing::debug!("ref coordinator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn run(events: Vec<RefEvent>) -> (Vec<u64>, HashMap<u64, i64>) {
        let deleted = Arc::new(Mutex::new(Vec::new()));
        let mut coordinator = Coordinator {
            file_refs: HashMap::new(),
            virtuals: HashMap::new(),
            deltas: HashMap::new(),
            released: HashMap::new(),
            expanded: HashSet::new(),
            doomed: HashSet::new(),
            next: 0,
            last: 0,
            on_zero: {
                let deleted = Arc::clone(&deleted);
                Box::new(move |num| deleted.lock().unwrap().push(num))
            },
        };
        for event in events {
            coordinator.handle(event);
            coordinator.process();
        }
        let deleted = deleted.lock().unwrap().clone();
        (deleted, coordinator.file_refs)
    }

    fn published(vid: u64, files: &[u64]) -> RefEvent {
        RefEvent::Ref {
            vid,
            files: files.to_vec(),
            created: Instant::now(),
        }
    }

    #[test]
    fn test_virtual_chain_deletes_compacted_files() {
        // v0 = {}, v1 = {1} (flush), v2 = {2} (compaction rewrote 1 -> 2).
        let (deleted, refs) = run(vec![
            published(0, &[]),
            published(1, &[1]),
            RefEvent::Delta {
                vid: 0,
                added: vec![1],
                deleted: vec![],
            },
            RefEvent::Release { vid: 0, files: vec![] },
            published(2, &[2]),
            RefEvent::Delta {
                vid: 1,
                added: vec![2],
                deleted: vec![1],
            },
            RefEvent::Release { vid: 1, files: vec![1] },
        ]);
        // File 1 was compacted away and no version references it.
        assert_eq!(deleted, vec![1]);
        // File 2 is held on behalf of the live current version.
        assert_eq!(refs.get(&2), Some(&1));
    }

    #[test]
    fn test_backlog_forces_expansion() {
        let mut events = vec![published(0, &[100])];
        // Publish far more versions than the virtual cap; each supersedes
        // the previous with no file changes.
        for vid in 1..=(MAX_VIRTUAL_VERSIONS + 10) {
            events.push(published(vid, &[100]));
            events.push(RefEvent::Delta {
                vid: vid - 1,
                added: vec![],
                deleted: vec![],
            });
        }
        let (deleted, refs) = run(events);
        assert!(deleted.is_empty());
        // The oldest versions were expanded into real counts.
        assert!(refs.get(&100).copied().unwrap_or(0) >= 1);
    }

    #[test]
    fn test_expanded_release_drops_counts() {
        let mut events = vec![published(0, &[7])];
        for vid in 1..=(MAX_VIRTUAL_VERSIONS + 10) {
            events.push(published(vid, &[7]));
            events.push(RefEvent::Delta {
                vid: vid - 1,
                added: vec![],
                deleted: vec![],
            });
        }
        // Release every version except the newest, in order. Expanded ones
        // subtract their file lists, virtual ones apply their (empty)
        // deltas; file 7 must survive because the newest version holds it.
        for vid in 0..=(MAX_VIRTUAL_VERSIONS + 9) {
            events.push(RefEvent::Release {
                vid,
                files: vec![7],
            });
        }
        let (deleted, _refs) = run(events);
        assert!(deleted.is_empty(), "file 7 deleted while still referenced");
    }
}
