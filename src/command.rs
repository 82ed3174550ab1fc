//! Retry-until-confirmed command execution.
//!
//! UDP gives no delivery guarantee, so stateful commands (power,
//! brightness, color) are resent on a growing backoff schedule until a
//! status response proves the device reached the requested state, or the
//! schedule is exhausted. At most one sequence is in flight per
//! `(device, command kind)` pair; submitting another command for the same
//! pair supersedes the running sequence.

use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::debug;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use uuid::Uuid;

use crate::device::DeviceState;
use crate::message::{CommandKind, LightColor};

/// Backoff before each re-send. One send per entry; the sequence gives up
/// once the last entry expires unconfirmed.
const BACKOFF_MS: [u64; 11] = [200, 300, 500, 1000, 1500, 2000, 3000, 4000, 5000, 6000, 7000];

/// Gap between sending a command and requesting the status that may
/// confirm it, giving the device time to apply the change.
const POST_SEND_DELAY_MS: u64 = 100;

/// Channel tolerance when matching a reported RGB color against the
/// requested one. Some models quantize the color they store.
const COLOR_TOLERANCE: u8 = 5;

/// Kelvin tolerance when matching a reported color temperature.
const KELVIN_TOLERANCE: u16 = 100;

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Outbound side the executor sends through. Implemented by the
/// controller over its transport; mocked in tests.
pub(crate) trait CommandSink: Send + Sync {
    /// Send a command payload to the device's command port.
    fn send_command(&self, ip: IpAddr, payload: Vec<u8>) -> BoxFuture;
    /// Request a fresh status from the device.
    fn request_status(&self, ip: IpAddr) -> BoxFuture;
}

/// Predicate over a reported device state that decides whether a command
/// took effect.
pub(crate) type StatePredicate = Box<dyn Fn(&DeviceState) -> bool + Send + Sync>;

pub(crate) fn power_predicate(on: bool) -> StatePredicate {
    Box::new(move |state| state.on == on)
}

pub(crate) fn brightness_predicate(target_pct: u8) -> StatePredicate {
    let target = target_pct.min(100);
    Box::new(move |state| state.brightness == target)
}

pub(crate) fn color_predicate(color: LightColor) -> StatePredicate {
    match color.clamped() {
        LightColor::Rgb(r, g, b) => Box::new(move |state| {
            let (sr, sg, sb) = state.rgb_color;
            sr.abs_diff(r) <= COLOR_TOLERANCE
                && sg.abs_diff(g) <= COLOR_TOLERANCE
                && sb.abs_diff(b) <= COLOR_TOLERANCE
        }),
        LightColor::Kelvin(kelvin) => {
            Box::new(move |state| state.temperature_color.abs_diff(kelvin) <= KELVIN_TOLERANCE)
        }
    }
}

type PendingKey = (String, CommandKind);

struct PendingEntry {
    id: Uuid,
    handle: JoinHandle<()>,
}

struct Verification {
    id: Uuid,
    fingerprint: String,
    predicate: StatePredicate,
    notify: Notify,
}

/// Runs and tracks confirmation sequences.
///
/// At most one verification registration is active per device; a newer
/// sequence for the same device takes over the slot, and the displaced
/// sequence degrades to a bare retry loop that runs out its schedule.
pub(crate) struct CommandExecutor {
    pending: Mutex<HashMap<PendingKey, PendingEntry>>,
    verifications: Mutex<HashMap<String, Arc<Verification>>>,
}

// Lock poisoning only happens after a panic elsewhere; the maps stay
// usable, so recover the guard instead of propagating the panic.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CommandExecutor {
    pub(crate) fn new() -> Self {
        CommandExecutor {
            pending: Mutex::new(HashMap::new()),
            verifications: Mutex::new(HashMap::new()),
        }
    }

    /// Start a confirmation sequence, superseding any in-flight sequence
    /// for the same `(device, kind)` pair and taking over the device's
    /// verification slot.
    ///
    /// The superseded task is aborted and awaited before the new one is
    /// registered, so its teardown can never remove the replacement's
    /// bookkeeping.
    pub(crate) async fn submit(
        self: &Arc<Self>,
        sink: Arc<dyn CommandSink>,
        fingerprint: &str,
        ip: IpAddr,
        kind: CommandKind,
        payload: Vec<u8>,
        predicate: StatePredicate,
    ) {
        let key = (fingerprint.to_string(), kind);
        let previous = lock(&self.pending).remove(&key);
        if let Some(entry) = previous {
            debug!("Superseding in-flight {kind} command for {fingerprint}");
            entry.handle.abort();
            let _ = entry.handle.await;
        }

        let id = Uuid::new_v4();
        let verification = Arc::new(Verification {
            id,
            fingerprint: fingerprint.to_string(),
            predicate,
            notify: Notify::new(),
        });
        lock(&self.verifications).insert(fingerprint.to_string(), Arc::clone(&verification));

        let guard = SequenceGuard {
            executor: Arc::clone(self),
            key: key.clone(),
            id,
        };
        // Hold the pending lock across the spawn so the new task cannot
        // observe the map without its own entry in it.
        let mut pending = lock(&self.pending);
        let handle = tokio::spawn(run_sequence(sink, ip, kind, payload, verification, guard));
        pending.insert(key, PendingEntry { id, handle });
    }

    /// Feed a decoded status into the verification waiting on this
    /// device, if any. Non-matching states are ignored; a later status
    /// may match.
    pub(crate) fn on_status(&self, fingerprint: &str, state: &DeviceState) {
        if let Some(verification) = lock(&self.verifications).get(fingerprint)
            && (verification.predicate)(state)
        {
            verification.notify.notify_one();
        }
    }

    /// Abort every in-flight sequence and wait for their teardown.
    pub(crate) async fn shutdown(&self) {
        let entries: Vec<PendingEntry> = lock(&self.pending).drain().map(|(_, e)| e).collect();
        for entry in entries {
            entry.handle.abort();
            let _ = entry.handle.await;
        }
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    #[cfg(test)]
    fn verification_count(&self) -> usize {
        lock(&self.verifications).len()
    }
}

/// Removes a sequence's bookkeeping when its task ends, whether it
/// finished or was aborted. The id check keeps an aborted task from
/// deleting the entry of the sequence that superseded it.
struct SequenceGuard {
    executor: Arc<CommandExecutor>,
    key: PendingKey,
    id: Uuid,
}

impl Drop for SequenceGuard {
    fn drop(&mut self) {
        let mut pending = lock(&self.executor.pending);
        if pending.get(&self.key).is_some_and(|entry| entry.id == self.id) {
            pending.remove(&self.key);
        }
        drop(pending);
        let mut verifications = lock(&self.executor.verifications);
        if verifications
            .get(&self.key.0)
            .is_some_and(|verification| verification.id == self.id)
        {
            verifications.remove(&self.key.0);
        }
    }
}

async fn run_sequence(
    sink: Arc<dyn CommandSink>,
    ip: IpAddr,
    kind: CommandKind,
    payload: Vec<u8>,
    verification: Arc<Verification>,
    guard: SequenceGuard,
) {
    let _guard = guard;
    for (attempt, backoff_ms) in BACKOFF_MS.iter().enumerate() {
        sink.send_command(ip, payload.clone()).await;
        sleep(Duration::from_millis(POST_SEND_DELAY_MS)).await;
        sink.request_status(ip).await;

        // A confirming status that arrived before this point left a permit
        // behind, so `notified` resolves immediately.
        tokio::select! {
            _ = verification.notify.notified() => {
                debug!(
                    "{kind} command to {} confirmed after {} send(s)",
                    verification.fingerprint,
                    attempt + 1
                );
                return;
            }
            _ = sleep(Duration::from_millis(*backoff_ms)) => {}
        }
    }
    // Best-effort protocol: exhaustion is not surfaced to the caller.
    debug!(
        "{kind} command to {} not confirmed after {} sends; giving up",
        verification.fingerprint,
        BACKOFF_MS.len()
    );
}
