//! Standby pool of provisioned resources
//!
//! The pool only tracks membership. Provider calls that fill it happen in the
//! controller, outside the state lock; see `PoolController::replenish`.

use crate::error::Error;
use crate::provider::ResourceId;
use std::collections::VecDeque;

/// Ordered set of standby resources with a target size
#[derive(Debug, Clone)]
pub struct ResourcePool {
    members: VecDeque<ResourceId>,
    target_size: usize,
}

impl ResourcePool {
    pub fn new(target_size: usize) -> Self {
        Self {
            members: VecDeque::with_capacity(target_size),
            target_size,
        }
    }

    pub fn target_size(&self) -> usize {
        self.target_size
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Number of resources missing to reach the target size
    pub fn deficit(&self) -> usize {
        self.target_size.saturating_sub(self.members.len())
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.members.contains(id)
    }

    /// Append a freshly created resource. Duplicates are ignored.
    pub fn push(&mut self, id: ResourceId) {
        if !self.contains(&id) {
            self.members.push_back(id);
        }
    }

    /// Remove a member; returns whether it was present
    pub fn remove(&mut self, id: &ResourceId) -> bool {
        match self.members.iter().position(|m| m == id) {
            Some(index) => {
                self.members.remove(index);
                true
            }
            None => false,
        }
    }

    /// The next resource to activate: the oldest member
    pub fn candidate(&self) -> Result<ResourceId, Error> {
        self.members.front().cloned().ok_or(Error::PoolEmpty)
    }

    /// Snapshot of members in pool order
    pub fn members(&self) -> Vec<ResourceId> {
        self.members.iter().cloned().collect()
    }

    /// Remove and return every member
    pub fn drain(&mut self) -> Vec<ResourceId> {
        self.members.drain(..).collect()
    }
}
