use std::collections::{HashSet, VecDeque};

use tubes_proto::messages::TubeId;

/// Hands out random tube ids, keeping track of the ids that can't be handed out yet.
///
/// An id can't be reused while a request for it is still outstanding, nor while it's among
/// the last `window` ids that were retired.
#[derive(Debug)]
pub struct IdAllocator {
    outstanding: HashSet<TubeId>,
    retired: VecDeque<TubeId>,
    window: usize,
}

impl IdAllocator {
    pub fn new(window: usize) -> Self {
        Self {
            outstanding: HashSet::new(),
            retired: VecDeque::with_capacity(window.min(1024)),
            window,
        }
    }

    /// Picks a random id for which `is_live` returns false and that isn't reserved.
    pub fn allocate<F: Fn(TubeId) -> bool>(&mut self, is_live: F) -> TubeId {
        loop {
            let id = TubeId(rand::random());
            if !is_live(id) && !self.is_reserved(id) {
                return id;
            }
        }
    }

    /// Whether an id is either awaiting the reply to a request or was retired recently.
    pub fn is_reserved(&self, id: TubeId) -> bool {
        self.outstanding.contains(&id) || self.retired.contains(&id)
    }

    pub fn is_outstanding(&self, id: TubeId) -> bool {
        self.outstanding.contains(&id)
    }

    pub fn was_retired(&self, id: TubeId) -> bool {
        self.retired.contains(&id)
    }

    pub fn begin_request(&mut self, id: TubeId) {
        self.outstanding.insert(id);
    }

    /// Marks the request on `id` as answered. Returns whether there was one.
    pub fn end_request(&mut self, id: TubeId) -> bool {
        self.outstanding.remove(&id)
    }

    /// Records that the tube with this id was removed.
    pub fn retire(&mut self, id: TubeId) {
        if self.window == 0 {
            return;
        }

        if self.retired.len() == self.window {
            self.retired.pop_front();
        }

        self.retired.push_back(id);
    }
}
