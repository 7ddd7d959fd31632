//! Buffer admission: byte reservations against a shared I/O buffer budget.
//!
//! Replicators reserve their working-set bytes before touching the network.
//! A reservation is granted immediately, queued behind earlier waiters, or
//! refused outright when it can never fit the per-client quota. Queued
//! grants are delivered through a callback once capacity frees up; a grant
//! that would land on a cancelled client is dropped and its bytes stay in
//! the pool.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

/// Invoked with the granted byte count when a queued reservation succeeds.
pub type GrantCallback = Box<dyn FnOnce(u64) + Send>;

/// Result of a reservation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// Bytes reserved; proceed now.
    Granted,
    /// Reservation queued; the grant callback will fire later.
    Queued,
    /// The request can never be satisfied under the client quota.
    OverQuota,
}

/// Identity of one admission client, paired with its cancellation flag so
/// the pool can drop grants racing a cancel.
#[derive(Debug, Clone)]
pub struct AdmissionClient {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl AdmissionClient {
    /// The pool-assigned client id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Byte-reservation service replicators admit through.
pub trait BufferAdmission: Send + Sync {
    /// Registers a client whose pending grants die with `cancelled`.
    fn new_client(&self, cancelled: Arc<AtomicBool>) -> AdmissionClient;

    /// Requests `bytes`; `on_grant` fires only for the `Queued` outcome.
    fn request_for_io(
        &self,
        client: &AdmissionClient,
        bytes: u64,
        on_grant: GrantCallback,
    ) -> AdmissionOutcome;

    /// Removes any queued request for the client; no grant will follow.
    fn cancel_request(&self, client: &AdmissionClient);

    /// Whether `bytes` more would exceed the client quota.
    fn is_over_quota(&self, client: &AdmissionClient, bytes: u64) -> bool;

    /// Returns previously granted bytes to the pool.
    fn release(&self, client: &AdmissionClient, bytes: u64);

    /// The per-client reservation ceiling.
    fn max_client_quota(&self) -> u64;
}

struct Waiter {
    client_id: u64,
    bytes: u64,
    cancelled: Arc<AtomicBool>,
    on_grant: GrantCallback,
}

#[derive(Default)]
struct PoolState {
    available: u64,
    held: HashMap<u64, u64>,
    waiters: VecDeque<Waiter>,
}

/// Fixed-budget buffer pool with FIFO waiters.
pub struct BufferPool {
    total_bytes: u64,
    max_client_quota: u64,
    next_client: AtomicU64,
    state: Mutex<PoolState>,
}

impl BufferPool {
    /// Creates a pool with a total budget and a per-client quota.
    pub fn new(total_bytes: u64, max_client_quota: u64) -> Self {
        Self {
            total_bytes,
            max_client_quota,
            next_client: AtomicU64::new(1),
            state: Mutex::new(PoolState {
                available: total_bytes,
                ..PoolState::default()
            }),
        }
    }

    /// Bytes not currently reserved.
    pub fn available(&self) -> u64 {
        self.state.lock().unwrap().available
    }

    /// Number of queued reservations.
    pub fn waiter_count(&self) -> usize {
        self.state.lock().unwrap().waiters.len()
    }

    fn drain_grantable(&self, state: &mut PoolState) -> Vec<(u64, GrantCallback)> {
        let mut ready = Vec::new();
        while let Some(front) = state.waiters.front() {
            if front.cancelled.load(Ordering::SeqCst) {
                let dropped = state.waiters.pop_front().unwrap();
                debug!(
                    client = dropped.client_id,
                    bytes = dropped.bytes,
                    "dropping grant for cancelled client"
                );
                continue;
            }
            if state.available < front.bytes {
                break;
            }
            let w = state.waiters.pop_front().unwrap();
            state.available -= w.bytes;
            *state.held.entry(w.client_id).or_insert(0) += w.bytes;
            ready.push((w.bytes, w.on_grant));
        }
        ready
    }
}

impl BufferAdmission for BufferPool {
    fn new_client(&self, cancelled: Arc<AtomicBool>) -> AdmissionClient {
        AdmissionClient {
            id: self.next_client.fetch_add(1, Ordering::Relaxed),
            cancelled,
        }
    }

    fn request_for_io(
        &self,
        client: &AdmissionClient,
        bytes: u64,
        on_grant: GrantCallback,
    ) -> AdmissionOutcome {
        if self.is_over_quota(client, bytes) {
            return AdmissionOutcome::OverQuota;
        }
        let mut state = self.state.lock().unwrap();
        if state.waiters.is_empty() && state.available >= bytes {
            state.available -= bytes;
            *state.held.entry(client.id).or_insert(0) += bytes;
            return AdmissionOutcome::Granted;
        }
        state.waiters.push_back(Waiter {
            client_id: client.id,
            bytes,
            cancelled: client.cancelled.clone(),
            on_grant,
        });
        AdmissionOutcome::Queued
    }

    fn cancel_request(&self, client: &AdmissionClient) {
        let mut state = self.state.lock().unwrap();
        state.waiters.retain(|w| w.client_id != client.id);
    }

    fn is_over_quota(&self, client: &AdmissionClient, bytes: u64) -> bool {
        let held = {
            let state = self.state.lock().unwrap();
            state.held.get(&client.id).copied().unwrap_or(0)
        };
        held + bytes > self.max_client_quota || bytes > self.total_bytes
    }

    fn release(&self, client: &AdmissionClient, bytes: u64) {
        let ready = {
            let mut state = self.state.lock().unwrap();
            let held = state.held.entry(client.id).or_insert(0);
            let freed = bytes.min(*held);
            *held -= freed;
            if *held == 0 {
                state.held.remove(&client.id);
            }
            state.available = (state.available + freed).min(self.total_bytes);
            self.drain_grantable(&mut state)
        };
        // Callbacks run outside the lock; a grantee may immediately request
        // or release more.
        for (granted, on_grant) in ready {
            on_grant(granted);
        }
    }

    fn max_client_quota(&self) -> u64 {
        self.max_client_quota
    }
}
