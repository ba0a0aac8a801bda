//! Send-completion handles with user continuations (4.8).
//!
//! An event tells you "this specific buffer is free"; unlike an epoch it
//! says nothing about successor messages. Parent events aggregate
//! children so a broadcast's event completes only once every fanned-out
//! child send has completed.

use std::collections::HashMap;

pub type EventId = u64;

type Action = Box<dyn FnOnce() + Send>;

struct EventRecord {
    resolved: bool,
    parent: Option<EventId>,
    pending_children: usize,
    actions: Vec<Action>,
}

#[derive(Default)]
pub struct EventManager {
    next_id: EventId,
    events: HashMap<EventId, EventRecord>,
}

impl EventManager {
    pub fn new() -> EventManager {
        EventManager {
            next_id: 1,
            events: HashMap::new(),
        }
    }

    fn alloc_id(&mut self) -> EventId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// A fresh event for a single transport-completing send.
    pub fn new_event(&mut self) -> EventId {
        let id = self.alloc_id();
        self.events.insert(
            id,
            EventRecord {
                resolved: false,
                parent: None,
                pending_children: 0,
                actions: Vec::new(),
            },
        );
        id
    }

    /// A parent event that completes once every id in `children` has
    /// completed — used for broadcast-wide acks (3, 4.8).
    pub fn new_parent_event(&mut self, children: &[EventId]) -> EventId {
        let parent_id = self.alloc_id();
        self.events.insert(
            parent_id,
            EventRecord {
                resolved: false,
                parent: None,
                pending_children: children.len(),
                actions: Vec::new(),
            },
        );
        for &child in children {
            if let Some(child_record) = self.events.get_mut(&child) {
                child_record.parent = Some(parent_id);
            }
        }
        if children.is_empty() {
            self.resolve(parent_id);
        } else {
            // Any children that already resolved before the parent
            // existed must retroactively count down.
            let already_done = children
                .iter()
                .filter(|c| self.events.get(c).map(|r| r.resolved).unwrap_or(true))
                .count();
            for _ in 0..already_done {
                self.count_down_parent(parent_id);
            }
        }
        parent_id
    }

    fn count_down_parent(&mut self, parent_id: EventId) {
        let hit_zero = if let Some(parent) = self.events.get_mut(&parent_id) {
            parent.pending_children = parent.pending_children.saturating_sub(1);
            parent.pending_children == 0
        } else {
            false
        };
        if hit_zero {
            self.resolve(parent_id);
        }
    }

    /// Marks `id` complete, running every queued action and cascading
    /// into its parent if this was the last pending child.
    pub fn resolve(&mut self, id: EventId) {
        let (already_resolved, parent, actions) = match self.events.get_mut(&id) {
            Some(record) if !record.resolved => {
                record.resolved = true;
                (false, record.parent, std::mem::take(&mut record.actions))
            }
            Some(_) => (true, None, Vec::new()),
            None => return,
        };
        if already_resolved {
            return;
        }
        for action in actions {
            action();
        }
        if let Some(parent_id) = parent {
            self.count_down_parent(parent_id);
        }
    }

    pub fn is_resolved(&self, id: EventId) -> bool {
        self.events.get(&id).map(|r| r.resolved).unwrap_or(false)
    }

    /// Queues `action` on `id`; if already resolved it runs immediately.
    pub fn add_action(&mut self, id: EventId, action: Action) {
        match self.events.get_mut(&id) {
            Some(record) if !record.resolved => record.actions.push(action),
            _ => action(),
        }
    }

    /// Drains every still in-flight event by force-resolving it
    /// (`theEvent()->finalize()`).
    pub fn finalize(&mut self) {
        let pending: Vec<EventId> = self
            .events
            .iter()
            .filter(|(_, record)| !record.resolved)
            .map(|(id, _)| *id)
            .collect();
        for id in pending {
            self.resolve(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn action_on_resolved_event_runs_immediately() {
        let mut mgr = EventManager::new();
        let id = mgr.new_event();
        mgr.resolve(id);
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        mgr.add_action(id, Box::new(move || { ran2.fetch_add(1, Ordering::SeqCst); }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn parent_resolves_only_after_all_children() {
        let mut mgr = EventManager::new();
        let c1 = mgr.new_event();
        let c2 = mgr.new_event();
        let parent = mgr.new_parent_event(&[c1, c2]);
        assert!(!mgr.is_resolved(parent));
        mgr.resolve(c1);
        assert!(!mgr.is_resolved(parent));
        mgr.resolve(c2);
        assert!(mgr.is_resolved(parent));
    }

    #[test]
    fn finalize_resolves_everything_pending() {
        let mut mgr = EventManager::new();
        let a = mgr.new_event();
        let b = mgr.new_event();
        mgr.finalize();
        assert!(mgr.is_resolved(a));
        assert!(mgr.is_resolved(b));
    }
}
