//! Per-(user, agent kind) lanes
//!
//! At most one task per lane runs at a time. Tasks arriving while the lane
//! is held wait in its backlog and are handed the lane in arrival order.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use uuid::Uuid;

pub type LaneKey = (String, String);

#[derive(Debug)]
struct Lane {
    holder: Uuid,
    backlog: VecDeque<Uuid>,
}

#[derive(Debug, Default)]
pub struct Lanes {
    lanes: DashMap<LaneKey, Lane>,
}

impl Lanes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lane for `task_id`. Returns false if it is held, in which
    /// case the task joins the backlog (once).
    pub fn try_acquire(&self, key: LaneKey, task_id: Uuid) -> bool {
        match self.lanes.entry(key) {
            Entry::Vacant(v) => {
                v.insert(Lane {
                    holder: task_id,
                    backlog: VecDeque::new(),
                });
                true
            }
            Entry::Occupied(mut o) => {
                let lane = o.get_mut();
                if lane.holder != task_id && !lane.backlog.contains(&task_id) {
                    lane.backlog.push_back(task_id);
                }
                false
            }
        }
    }

    /// Release the lane. If a task is waiting it becomes the holder and is
    /// returned; the caller must run it.
    pub fn release(&self, key: &LaneKey) -> Option<Uuid> {
        match self.lanes.entry(key.clone()) {
            Entry::Occupied(mut o) => match o.get_mut().backlog.pop_front() {
                Some(next) => {
                    o.get_mut().holder = next;
                    Some(next)
                }
                None => {
                    o.remove();
                    None
                }
            },
            Entry::Vacant(_) => None,
        }
    }

    /// Tasks waiting behind a held lane
    pub fn backlog(&self) -> usize {
        self.lanes.iter().map(|l| l.backlog.len()).sum()
    }
}
