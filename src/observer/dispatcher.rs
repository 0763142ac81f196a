//! Observer worker and dispatch lifecycle.
//!
//! This module owns the request registry and runs the serialized
//! evaluation loop. Registration and unregistration calls are marshaled
//! onto a dedicated worker thread over bounded channels and acknowledged
//! without waiting for any evaluation pass; snapshot ingestion is
//! non-blocking so a slow evaluation can never stall the poller. Callback
//! delivery happens on a separate dispatch thread so a slow or hung
//! consumer cannot stall the worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use log::{debug, warn};

use crate::access::{resolve_access, AccessLevel, IdentityAuthority};
use crate::error::{ExecutionError, NetWatchError, NetWatchResult, ValidationError};
use crate::identity::{ActiveIdentities, Uid};
use crate::snapshot::TrafficSnapshot;
use crate::template::UsageTemplate;

use super::death::DeathWatch;
use super::evaluator::ThresholdEvaluator;
use super::handle::{UsageEvent, UsageRequestHandle};
use super::registry::{
    RemoveOutcome, RequestId, RequestRegistry, DEFAULT_MAX_REQUESTS_PER_UID,
    DEFAULT_MIN_THRESHOLD_BYTES,
};

/// Tuning knobs for the observer's queues and quotas.
#[derive(Debug, Clone)]
pub struct ObserverConfig {
    /// Max concurrent registrations per UID.
    pub max_requests_per_uid: usize,
    /// Floor applied to thresholds from non-system callers.
    pub min_threshold_bytes: u64,
    /// Max queued control messages (register/unregister/death).
    pub control_queue_capacity: usize,
    /// Max queued snapshot pairs before the poller's ticks are shed.
    pub snapshot_queue_capacity: usize,
    /// Max queued dispatches between worker and dispatch thread.
    pub dispatch_queue_capacity: usize,
    /// Per-registration event stream capacity.
    pub stream_capacity: usize,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            max_requests_per_uid: DEFAULT_MAX_REQUESTS_PER_UID,
            min_threshold_bytes: DEFAULT_MIN_THRESHOLD_BYTES,
            control_queue_capacity: 1024,
            snapshot_queue_capacity: 64,
            dispatch_queue_capacity: 4096,
            stream_capacity: 1024,
        }
    }
}

#[derive(Debug)]
pub(crate) enum ControlMsg {
    Register {
        template: UsageTemplate,
        threshold_bytes: u64,
        caller_uid: Uid,
        caller_pid: u32,
        caller_package: String,
        requested_access: AccessLevel,
        stream_tx: Sender<UsageEvent>,
        reply: Sender<NetWatchResult<RequestId>>,
    },
    Unregister {
        id: RequestId,
        caller_uid: Uid,
        reply: Option<Sender<()>>,
    },
    CallerDied {
        id: RequestId,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct SnapshotMsg {
    pub prev_iface: TrafficSnapshot,
    pub cur_iface: TrafficSnapshot,
    pub prev_uid: TrafficSnapshot,
    pub cur_uid: TrafficSnapshot,
    pub active_identities: ActiveIdentities,
    pub observed_at: DateTime<Utc>,
}

struct DispatchMsg {
    tx: Sender<UsageEvent>,
    event: UsageEvent,
}

/// Usage-threshold observer engine.
///
/// Owns a dedicated worker thread (registry + evaluation) and a dispatch
/// thread (event delivery). Registration calls block only until the worker
/// acknowledges them, never until an evaluation pass completes.
pub struct UsageObserver {
    cfg: ObserverConfig,
    authority: Arc<dyn IdentityAuthority>,
    death_watch: Arc<dyn DeathWatch>,
    control_tx: Sender<ControlMsg>,
    snapshot_tx: Sender<SnapshotMsg>,
    dropped_snapshots: AtomicU64,
    dropped_events: Arc<AtomicU64>,
    released_clean: Arc<AtomicU64>,
    released_via_death: Arc<AtomicU64>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl UsageObserver {
    /// Starts the worker and dispatch threads.
    pub fn new(
        cfg: ObserverConfig,
        authority: Arc<dyn IdentityAuthority>,
        death_watch: Arc<dyn DeathWatch>,
    ) -> Self {
        let control_capacity = cfg.control_queue_capacity.max(1);
        let snapshot_capacity = cfg.snapshot_queue_capacity.max(1);
        let dispatch_capacity = cfg.dispatch_queue_capacity.max(1);

        let (control_tx, control_rx) = bounded::<ControlMsg>(control_capacity);
        let (snapshot_tx, snapshot_rx) = bounded::<SnapshotMsg>(snapshot_capacity);
        let (dispatch_tx, dispatch_rx) = bounded::<DispatchMsg>(dispatch_capacity);

        let dropped_events = Arc::new(AtomicU64::new(0));
        let released_clean = Arc::new(AtomicU64::new(0));
        let released_via_death = Arc::new(AtomicU64::new(0));

        let registry = RequestRegistry::new(cfg.max_requests_per_uid, cfg.min_threshold_bytes);
        let evaluator = ThresholdEvaluator::new(Arc::clone(&authority));

        let worker_ctx = WorkerContext {
            registry,
            evaluator,
            authority: Arc::clone(&authority),
            death_watch: Arc::clone(&death_watch),
            dispatch_tx,
            dropped_events: Arc::clone(&dropped_events),
            released_clean: Arc::clone(&released_clean),
            released_via_death: Arc::clone(&released_via_death),
        };

        let worker = thread::Builder::new()
            .name("netwatch-observer".to_string())
            .spawn(move || worker_loop(worker_ctx, control_rx, snapshot_rx))
            .expect("failed to spawn netwatch observer worker");

        let dispatch_dropped = Arc::clone(&dropped_events);
        let dispatch = thread::Builder::new()
            .name("netwatch-dispatch".to_string())
            .spawn(move || dispatch_loop(dispatch_rx, dispatch_dropped))
            .expect("failed to spawn netwatch dispatch worker");

        Self {
            cfg,
            authority,
            death_watch,
            control_tx,
            snapshot_tx,
            dropped_snapshots: AtomicU64::new(0),
            dropped_events,
            released_clean,
            released_via_death,
            workers: Mutex::new(vec![worker, dispatch]),
        }
    }

    /// Registers a usage-threshold request and returns its handle.
    ///
    /// Fails with `QuotaExceeded` when the UID is at its cap; a failed
    /// call consumes no id and arms no death watch. On success a death
    /// watch is armed so the registration is cleaned up if the caller
    /// dies.
    pub fn register(
        &self,
        template: UsageTemplate,
        threshold_bytes: u64,
        caller_uid: Uid,
        caller_pid: u32,
        caller_package: impl Into<String>,
        requested_access: AccessLevel,
    ) -> NetWatchResult<UsageRequestHandle> {
        let caller_package = caller_package.into();
        if caller_package.trim().is_empty() {
            return Err(ValidationError::EmptyPackage.into());
        }
        if threshold_bytes == 0 {
            return Err(ValidationError::ZeroThreshold.into());
        }

        let (stream_tx, stream_rx) = bounded::<UsageEvent>(self.cfg.stream_capacity.max(1));
        let (reply_tx, reply_rx) = bounded::<NetWatchResult<RequestId>>(1);

        self.control_tx
            .send(ControlMsg::Register {
                template,
                threshold_bytes,
                caller_uid,
                caller_pid,
                caller_package,
                requested_access,
                stream_tx,
                reply: reply_tx,
            })
            .map_err(|_| disconnected("observer_control"))?;

        // Wait for the worker's ack only; evaluation passes are not involved.
        let id = reply_rx.recv().map_err(|_| disconnected("observer_control"))??;

        let control_tx = self.control_tx.clone();
        self.death_watch.arm(
            id,
            Box::new(move || {
                // The watch fires once; a full queue must wait, not drop,
                // or the dead caller's quota slot leaks forever. The
                // worker always drains this queue, and it stays alive as
                // long as any armed callback holds a sender.
                if control_tx.send(ControlMsg::CallerDied { id }).is_err() {
                    debug!("worker gone before death of {id} was delivered");
                }
            }),
        );

        Ok(UsageRequestHandle::new(
            id,
            caller_uid,
            stream_rx,
            self.control_tx.clone(),
        ))
    }

    /// Unregisters a request on behalf of `caller_uid`.
    ///
    /// Always succeeds from the caller's perspective: unknown ids and
    /// requests owned by other UIDs are silent no-ops (the system identity
    /// may unregister on behalf of any UID). Returns once the worker has
    /// acknowledged the removal.
    pub fn unregister(&self, id: RequestId, caller_uid: Uid) {
        let (reply_tx, reply_rx) = bounded::<()>(1);
        if self
            .control_tx
            .send(ControlMsg::Unregister {
                id,
                caller_uid,
                reply: Some(reply_tx),
            })
            .is_err()
        {
            return;
        }
        let _ = reply_rx.recv();
    }

    /// Entry point invoked by the polling collaborator once per cycle.
    ///
    /// Non-blocking: if the worker is behind, the tick is shed and counted
    /// rather than stalling the poller.
    #[allow(clippy::too_many_arguments)]
    pub fn on_snapshots_available(
        &self,
        prev_iface: TrafficSnapshot,
        cur_iface: TrafficSnapshot,
        prev_uid: TrafficSnapshot,
        cur_uid: TrafficSnapshot,
        active_identities: ActiveIdentities,
        observed_at: DateTime<Utc>,
    ) {
        let msg = SnapshotMsg {
            prev_iface,
            cur_iface,
            prev_uid,
            cur_uid,
            active_identities,
            observed_at,
        };
        match self.snapshot_tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped_snapshots.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// The identity authority this observer resolves callers against.
    #[must_use]
    pub fn authority(&self) -> &Arc<dyn IdentityAuthority> {
        &self.authority
    }

    /// Snapshot ticks shed because the worker was behind.
    #[must_use]
    pub fn dropped_snapshots(&self) -> u64 {
        self.dropped_snapshots.load(Ordering::Relaxed)
    }

    /// Threshold events shed because a consumer or the dispatch queue was
    /// full.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Requests released by explicit unregister.
    #[must_use]
    pub fn released_clean(&self) -> u64 {
        self.released_clean.load(Ordering::Relaxed)
    }

    /// Requests released because the registering process died.
    #[must_use]
    pub fn released_via_death(&self) -> u64 {
        self.released_via_death.load(Ordering::Relaxed)
    }
}

impl Drop for UsageObserver {
    fn drop(&mut self) {
        // Close our channel ends first so the workers can terminate.
        let (dummy_control_tx, _) = bounded::<ControlMsg>(1);
        drop(std::mem::replace(&mut self.control_tx, dummy_control_tx));

        let (dummy_snapshot_tx, _) = bounded::<SnapshotMsg>(1);
        drop(std::mem::replace(&mut self.snapshot_tx, dummy_snapshot_tx));

        if let Ok(mut workers) = self.workers.lock() {
            // Do not join here.
            //
            // Callers may keep `UsageRequestHandle`s (and armed death-watch
            // callbacks) alive beyond the observer lifetime, and both hold
            // clones of `control_tx`. Joining would deadlock while any such
            // sender exists. Detaching is safe: the worker exits once the
            // last sender is dropped, and the dispatch thread follows when
            // the worker's queue closes.
            workers.clear();
        }
    }
}

fn disconnected(path: &str) -> NetWatchError {
    NetWatchError::Execution(ExecutionError::Disconnected {
        path: path.to_string(),
    })
}

struct WorkerContext {
    registry: RequestRegistry,
    evaluator: ThresholdEvaluator,
    authority: Arc<dyn IdentityAuthority>,
    death_watch: Arc<dyn DeathWatch>,
    dispatch_tx: Sender<DispatchMsg>,
    dropped_events: Arc<AtomicU64>,
    released_clean: Arc<AtomicU64>,
    released_via_death: Arc<AtomicU64>,
}

fn worker_loop(
    mut ctx: WorkerContext,
    mut control_rx: Receiver<ControlMsg>,
    mut snapshot_rx: Receiver<SnapshotMsg>,
) {
    let mut streams: HashMap<RequestId, Sender<UsageEvent>> = HashMap::new();

    let mut control_closed = false;
    let mut snapshot_closed = false;

    while !(control_closed && snapshot_closed) {
        select! {
            recv(control_rx) -> msg => {
                match msg {
                    Ok(msg) => handle_control(&mut ctx, &mut streams, msg),
                    Err(_) => control_closed = true,
                }
            }
            recv(snapshot_rx) -> msg => {
                match msg {
                    Ok(msg) => run_pass(&mut ctx, &streams, &msg),
                    Err(_) => snapshot_closed = true,
                }
            }
        }

        // A disconnected channel fires on every select; park it so the
        // loop blocks on the one still open.
        if control_closed {
            control_rx = crossbeam_channel::never();
        }
        if snapshot_closed {
            snapshot_rx = crossbeam_channel::never();
        }
    }
}

fn handle_control(
    ctx: &mut WorkerContext,
    streams: &mut HashMap<RequestId, Sender<UsageEvent>>,
    msg: ControlMsg,
) {
    match msg {
        ControlMsg::Register {
            template,
            threshold_bytes,
            caller_uid,
            caller_pid,
            caller_package,
            requested_access,
            stream_tx,
            reply,
        } => {
            let caller_is_system = ctx.authority.is_system(caller_uid);
            let access_level =
                resolve_access(requested_access, caller_uid, ctx.authority.as_ref());

            let result = ctx.registry.insert(
                template,
                threshold_bytes,
                caller_uid,
                caller_pid,
                caller_package,
                access_level,
                caller_is_system,
            );

            match result {
                Ok(id) => {
                    debug!("registered {id} for uid {caller_uid} at {access_level:?}");
                    streams.insert(id, stream_tx);
                    let _ = reply.send(Ok(id));
                }
                Err(err) => {
                    debug!("registration rejected for uid {caller_uid}: {err}");
                    let _ = reply.send(Err(err.into()));
                }
            }
        }
        ControlMsg::Unregister { id, caller_uid, reply } => {
            let caller_is_system = ctx.authority.is_system(caller_uid);
            match ctx.registry.remove(id, caller_uid, caller_is_system) {
                RemoveOutcome::Removed(_) => {
                    debug!("unregistered {id} by uid {caller_uid}");
                    ctx.death_watch.disarm(id);
                    ctx.released_clean.fetch_add(1, Ordering::Relaxed);
                    release_stream(ctx, streams, id);
                }
                // Unknown ids and foreign owners are silent no-ops: the
                // API stays idempotent under races with death-triggered
                // release, and existence is not leaked to unprivileged
                // callers.
                RemoveOutcome::NotFound | RemoveOutcome::NotOwner => {
                    debug!("unregister no-op for {id} by uid {caller_uid}");
                }
            }
            if let Some(reply) = reply {
                let _ = reply.send(());
            }
        }
        ControlMsg::CallerDied { id } => {
            // May race an explicit unregister; whichever arrived first won.
            if ctx.registry.remove_for_death(id).is_some() {
                debug!("released {id} after caller death");
                ctx.death_watch.disarm(id);
                ctx.released_via_death.fetch_add(1, Ordering::Relaxed);
                release_stream(ctx, streams, id);
            }
        }
    }
}

fn release_stream(
    ctx: &WorkerContext,
    streams: &mut HashMap<RequestId, Sender<UsageEvent>>,
    id: RequestId,
) {
    let Some(tx) = streams.remove(&id) else {
        return;
    };
    // Release notifications are not shed at the dispatch queue: the queue
    // drains fast (the dispatch thread never blocks) and removal from the
    // registry already happened, so at-most-once holds either way.
    let msg = DispatchMsg {
        tx,
        event: UsageEvent::released(id),
    };
    if ctx.dispatch_tx.send(msg).is_err() {
        warn!("dispatch queue closed while releasing {id}");
    }
}

fn run_pass(
    ctx: &mut WorkerContext,
    streams: &HashMap<RequestId, Sender<UsageEvent>>,
    msg: &SnapshotMsg,
) {
    let iface_delta = msg.cur_iface.delta_since(&msg.prev_iface);
    let uid_delta = msg.cur_uid.delta_since(&msg.prev_uid);

    let mut crossings = 0usize;
    for request in ctx.registry.requests_mut() {
        let crossed = ctx.evaluator.evaluate_request(
            request,
            &iface_delta,
            &uid_delta,
            &msg.active_identities,
        );
        if !crossed {
            continue;
        }
        crossings += 1;

        let Some(tx) = streams.get(&request.id) else {
            continue;
        };
        let dispatch = DispatchMsg {
            tx: tx.clone(),
            event: UsageEvent::threshold_reached(request.id, request.threshold_bytes),
        };
        // Never block the worker on dispatch: shed threshold events under
        // backpressure and account for them.
        match ctx.dispatch_tx.try_send(dispatch) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                ctx.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    debug!(
        "pass at {}: {} requests evaluated, {crossings} crossings",
        msg.observed_at,
        ctx.registry.len()
    );
}

fn dispatch_loop(dispatch_rx: Receiver<DispatchMsg>, dropped_events: Arc<AtomicU64>) {
    while let Ok(DispatchMsg { tx, event }) = dispatch_rx.recv() {
        if event.is_released() {
            // Released is exactly-once all the way to the stream: block
            // until the consumer drains a slot. The registration is
            // already gone from the registry, so nothing upstream waits
            // on this. A dropped receiver just ends delivery.
            if tx.send(event).is_err() {
                debug!("release receiver already gone");
            }
            continue;
        }
        // Threshold events never block on a slow consumer: drop if its
        // stream is full.
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                dropped_events.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
