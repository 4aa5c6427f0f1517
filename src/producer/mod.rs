//! Change producers: the two places change events come from.
//!
//! - [`CrudProducer`] is called by the HTTP layer once a mutation it performed
//!   has completed.
//! - [`watch`] turns raw filesystem notifications under the root into events.
//!
//! Both publish onto the same [`EventBus`]. A CRUD write is also seen by the
//! watcher, so the CRUD side records the paths it touches in
//! [`RecentMutations`] and the watcher skips those paths for a short window.

pub mod watch;

use crate::bus::EventBus;
use crate::error::Result;
use crate::event::{ChangeEvent, ChangeKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Paths recently mutated through the CRUD layer.
#[derive(Clone)]
pub struct RecentMutations {
    window: Duration,
    marks: Arc<Mutex<HashMap<String, Mark>>>,
}

#[derive(Debug, Clone, Copy)]
struct Mark {
    at: Instant,
    /// Set for a directory delete, whose recursive removal also fires for every descendant.
    covers_descendants: bool,
}

impl RecentMutations {
    /// A zero `window` disables suppression.
    pub fn new(window: Duration) -> Self {
        RecentMutations {
            window,
            marks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Records that a `kind` mutation of `path` was just made.
    pub fn mark(&self, path: &str, kind: ChangeKind, is_directory: bool) {
        if self.window.is_zero() {
            return;
        }
        let mut marks = self
            .marks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        marks.retain(|_, mark| now.duration_since(mark.at) < self.window);
        let covers_descendants = kind == ChangeKind::Delete && is_directory;
        marks
            .entry(path.to_string())
            .and_modify(|mark| {
                mark.at = now;
                mark.covers_descendants |= covers_descendants;
            })
            .or_insert(Mark {
                at: now,
                covers_descendants,
            });
    }

    /// `true` if `path` itself, or a directory deleted above it, was marked
    /// inside the window.
    pub fn is_recent(&self, path: &str) -> bool {
        if self.window.is_zero() {
            return false;
        }
        let marks = self
            .marks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        let fresh = |candidate: &str, exact: bool| {
            marks.get(candidate).is_some_and(|mark| {
                (exact || mark.covers_descendants) && now.duration_since(mark.at) < self.window
            })
        };

        let path = path.trim_end_matches('/');
        let mut candidate = path;
        loop {
            if fresh(candidate, candidate.len() == path.len()) {
                return true;
            }
            match candidate.rfind('/') {
                Some(0) | None => return false,
                Some(idx) => candidate = &candidate[..idx],
            }
        }
    }
}

/// A mutation the CRUD layer has completed on the origin's tree.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub kind: ChangeKind,
    /// Root-relative path, `/a/b` form.
    pub path: String,
    pub is_directory: bool,
    pub body: Option<Vec<u8>>,
}

/// Publishes change events for mutations made through the CRUD interface.
#[derive(Clone)]
pub struct CrudProducer {
    bus: EventBus,
    recent: RecentMutations,
}

impl CrudProducer {
    pub fn new(bus: EventBus, recent: RecentMutations) -> Self {
        CrudProducer { bus, recent }
    }

    /// Announces that a `kind` mutation of `path` is about to be made, so the
    /// watcher does not report the same change a second time.
    pub fn announce(&self, path: &str, kind: ChangeKind, is_directory: bool) {
        self.recent.mark(path, kind, is_directory);
    }

    /// Turns a completed mutation into a change event and publishes it.
    ///
    /// Returns the number of subscribers the event reached.
    pub fn notify(&self, mutation: Mutation) -> Result<usize> {
        self.recent
            .mark(&mutation.path, mutation.kind, mutation.is_directory);
        let event = ChangeEvent::new(
            mutation.kind,
            mutation.path,
            mutation.is_directory,
            mutation.body,
        )?;
        info!(
            "CRUD {}: {} (dir: {})",
            event.kind(),
            event.path(),
            event.is_directory()
        );
        let delivered = self.bus.publish(event);
        debug!("CRUD event reached {} subscriber(s)", delivered);
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_delete_covers_descendants() {
        let recent = RecentMutations::new(Duration::from_secs(60));
        recent.mark("/archive", ChangeKind::Delete, true);
        assert!(recent.is_recent("/archive"));
        assert!(recent.is_recent("/archive/a.txt"));
        assert!(recent.is_recent("/archive/deep/b.txt"));
        assert!(!recent.is_recent("/archived.txt"));
        assert!(!recent.is_recent("/other"));
    }

    #[test]
    fn directory_create_covers_only_itself() {
        let recent = RecentMutations::new(Duration::from_secs(60));
        recent.mark("/inbox", ChangeKind::Create, true);
        assert!(recent.is_recent("/inbox"));
        assert!(recent.is_recent("/inbox/"));
        assert!(!recent.is_recent("/inbox/report.txt"));

        recent.mark("/inbox/todo.txt", ChangeKind::Update, false);
        assert!(recent.is_recent("/inbox/todo.txt"));
        assert!(!recent.is_recent("/inbox/todo.txt/x"));
    }

    #[test]
    fn zero_window_disables_suppression() {
        let recent = RecentMutations::new(Duration::ZERO);
        recent.mark("/a.txt", ChangeKind::Create, false);
        assert!(!recent.is_recent("/a.txt"));
    }

    #[test]
    fn marks_expire() {
        let recent = RecentMutations::new(Duration::from_millis(20));
        recent.mark("/a.txt", ChangeKind::Create, false);
        std::thread::sleep(Duration::from_millis(40));
        assert!(!recent.is_recent("/a.txt"));
    }

    #[test]
    fn notify_publishes_and_marks() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe(&ChangeKind::ALL).unwrap();
        let recent = RecentMutations::new(Duration::from_secs(60));
        let producer = CrudProducer::new(bus, recent.clone());

        let delivered = producer
            .notify(Mutation {
                kind: ChangeKind::Create,
                path: "/notes/todo.txt".to_string(),
                is_directory: false,
                body: Some(b"buy milk".to_vec()),
            })
            .unwrap();

        assert_eq!(delivered, 1);
        assert!(recent.is_recent("/notes/todo.txt"));
        let event = sub.try_recv().unwrap();
        assert_eq!(event.path(), "/notes/todo.txt");
        assert_eq!(event.body(), Some(&b"buy milk"[..]));
    }

    #[test]
    fn notify_rejects_invalid_mutation() {
        let producer = CrudProducer::new(EventBus::new(4), RecentMutations::new(Duration::ZERO));
        let result = producer.notify(Mutation {
            kind: ChangeKind::Delete,
            path: "/a.txt".to_string(),
            is_directory: false,
            body: Some(vec![1]),
        });
        assert!(result.is_err());
    }
}
