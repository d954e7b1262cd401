//! Worker Registry
//!
//! Process-wide set of workers, populated by heartbeats. Each worker's load
//! is an atomic counter; a slot is reserved with a compare-and-swap so
//! concurrent selections never push a worker above its capacity. Slots taken
//! by attempts the control plane no longer tracks (left over from before the
//! worker was declared dead) are counted separately and block selection until
//! the worker stops reporting them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use conveyor_core::domain::worker::{Worker, WorkerHealth};
use conveyor_core::dto::worker::Heartbeat;

/// Where to reach a worker that holds a reserved slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerTarget {
    pub id: String,
    pub address: String,
}

/// What a heartbeat changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beat {
    /// The worker was not known before
    pub registered: bool,
    /// When the previous heartbeat from this worker was recorded
    pub previous_at: Option<DateTime<Utc>>,
}

struct WorkerSlot {
    load: AtomicU32,
    /// Attempts running on the worker that no job here accounts for
    untracked: AtomicU32,
    capacity: AtomicU32,
    state: Mutex<SlotState>,
}

struct SlotState {
    address: String,
    health: WorkerHealth,
    missed_heartbeats: u32,
    reported_load: u32,
    registered_at: DateTime<Utc>,
    last_heartbeat_at: DateTime<Utc>,
}

impl WorkerSlot {
    fn state(&self) -> std::sync::MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes one slot if the worker is below capacity
    fn try_reserve(&self) -> bool {
        let limit = self.limit();
        self.load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |load| {
                (load < limit).then_some(load + 1)
            })
            .is_ok()
    }

    /// Slots available to reservations
    fn limit(&self) -> u32 {
        let capacity = self.capacity.load(Ordering::Acquire);
        capacity.saturating_sub(self.untracked.load(Ordering::Acquire))
    }
}

pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, Arc<WorkerSlot>>>,
    heartbeat_interval: Duration,
    suspect_after: u32,
    dead_after: u32,
}

impl WorkerRegistry {
    pub fn new(heartbeat_interval: Duration, suspect_after: u32, dead_after: u32) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            heartbeat_interval,
            suspect_after,
            dead_after,
        }
    }

    fn slot(&self, worker_id: &str) -> Option<Arc<WorkerSlot>> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(worker_id)
            .cloned()
    }

    fn slots(&self) -> Vec<(String, Arc<WorkerSlot>)> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect()
    }

    /// Registers or refreshes a worker; it is HEALTHY afterwards
    pub fn heartbeat(&self, hb: &Heartbeat) -> Beat {
        let now = Utc::now();

        if let Some(slot) = self.slot(&hb.worker_id) {
            slot.capacity.store(hb.capacity, Ordering::Release);
            let mut state = slot.state();
            if state.health != WorkerHealth::Healthy {
                tracing::info!("Worker {} is healthy again", hb.worker_id);
            }
            state.address = hb.address.clone();
            state.health = WorkerHealth::Healthy;
            state.missed_heartbeats = 0;
            state.reported_load = hb.current_load;
            let previous_at = std::mem::replace(&mut state.last_heartbeat_at, now);
            return Beat {
                registered: false,
                previous_at: Some(previous_at),
            };
        }

        let slot = Arc::new(WorkerSlot {
            load: AtomicU32::new(0),
            untracked: AtomicU32::new(0),
            capacity: AtomicU32::new(hb.capacity),
            state: Mutex::new(SlotState {
                address: hb.address.clone(),
                health: WorkerHealth::Healthy,
                missed_heartbeats: 0,
                reported_load: hb.current_load,
                registered_at: now,
                last_heartbeat_at: now,
            }),
        });

        let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
        // Another heartbeat for the same worker may have raced us here
        let inserted = !workers.contains_key(&hb.worker_id);
        workers.entry(hb.worker_id.clone()).or_insert(slot);
        if inserted {
            tracing::info!(
                "Worker {} registered at {} with capacity {}",
                hb.worker_id,
                hb.address,
                hb.capacity
            );
        }
        Beat {
            registered: inserted,
            previous_at: None,
        }
    }

    /// Records how many attempts on a worker belong to no active job
    pub fn set_untracked(&self, worker_id: &str, count: u32) {
        if let Some(slot) = self.slot(worker_id) {
            let before = slot.untracked.swap(count, Ordering::AcqRel);
            if before != count {
                tracing::info!("Worker {} holds {} untracked attempt(s)", worker_id, count);
            }
        }
    }

    /// Reserves a slot on the best eligible worker
    ///
    /// Eligible: HEALTHY and below capacity, counting untracked attempts.
    /// Preference: most free capacity, then lowest load, then lowest id.
    pub fn reserve(&self) -> Option<WorkerTarget> {
        let mut candidates: Vec<(u32, u32, String, String, Arc<WorkerSlot>)> = self
            .slots()
            .into_iter()
            .filter_map(|(id, slot)| {
                let (health, address) = {
                    let state = slot.state();
                    (state.health, state.address.clone())
                };
                let load = slot.load.load(Ordering::Acquire);
                let limit = slot.limit();
                (health == WorkerHealth::Healthy && load < limit)
                    .then(|| (limit - load, load, id, address, slot))
            })
            .collect();

        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then_with(|| a.2.cmp(&b.2)));

        candidates
            .into_iter()
            .find(|(_, _, _, _, slot)| slot.try_reserve())
            .map(|(_, _, id, address, _)| WorkerTarget { id, address })
    }

    /// Frees a slot previously taken by [`reserve`](Self::reserve)
    pub fn release(&self, worker_id: &str) {
        let Some(slot) = self.slot(worker_id) else {
            tracing::warn!("Release for unknown worker {}", worker_id);
            return;
        };
        if slot
            .load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |load| load.checked_sub(1))
            .is_err()
        {
            tracing::warn!("Worker {} released a slot it did not hold", worker_id);
        }
    }

    /// Takes a worker out of selection until its next heartbeat
    pub fn mark_suspect(&self, worker_id: &str) {
        if let Some(slot) = self.slot(worker_id) {
            let mut state = slot.state();
            if state.health == WorkerHealth::Healthy {
                tracing::warn!("Worker {} marked suspect", worker_id);
                state.health = WorkerHealth::Suspect;
            }
        }
    }

    /// Counts missed heartbeat intervals as of `now`
    ///
    /// Returns the workers that became DEAD in this sweep.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let interval_ms = self.heartbeat_interval.as_millis().max(1);
        let mut dead = Vec::new();

        for (id, slot) in self.slots() {
            let mut state = slot.state();
            let silent_ms = (now - state.last_heartbeat_at).num_milliseconds().max(0) as u128;
            let missed = u32::try_from(silent_ms / interval_ms).unwrap_or(u32::MAX);
            state.missed_heartbeats = missed;

            match state.health {
                WorkerHealth::Dead => {}
                _ if missed >= self.dead_after => {
                    tracing::warn!("Worker {} missed {} heartbeats, declaring it dead", id, missed);
                    state.health = WorkerHealth::Dead;
                    dead.push(id);
                }
                WorkerHealth::Healthy if missed >= self.suspect_after => {
                    tracing::warn!("Worker {} missed {} heartbeats, marking it suspect", id, missed);
                    state.health = WorkerHealth::Suspect;
                }
                _ => {}
            }
        }

        dead
    }

    /// All known workers, sorted by id
    pub fn list(&self) -> Vec<Worker> {
        let mut workers: Vec<Worker> = self
            .slots()
            .into_iter()
            .map(|(id, slot)| {
                let state = slot.state();
                Worker {
                    id,
                    address: state.address.clone(),
                    capacity: slot.capacity.load(Ordering::Acquire),
                    load: slot.load.load(Ordering::Acquire),
                    reported_load: state.reported_load,
                    health: state.health,
                    missed_heartbeats: state.missed_heartbeats,
                    registered_at: state.registered_at,
                    last_heartbeat_at: state.last_heartbeat_at,
                }
            })
            .collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    /// Address of a worker, for cancel requests
    pub fn target(&self, worker_id: &str) -> Option<WorkerTarget> {
        self.slot(worker_id).map(|slot| WorkerTarget {
            id: worker_id.to_string(),
            address: slot.state().address.clone(),
        })
    }
}
