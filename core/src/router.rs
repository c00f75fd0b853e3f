//! Mesh router: the orchestrator
//!
//! Inbound: bytes → decode → dedup check → signature → expiry → record →
//! (decrypt) → deliver to subscribers → forward with `hop + 1`.
//!
//! Outbound: application call → admission → shape (lean frame) → encrypt
//! for a thread → sign → consume token → dedup-mark → enqueue.
//!
//! Each component sits behind its own lock, held only for the synchronous
//! step that needs it; no lock is ever held across a transport await.

use crate::clock::{Clock, SystemClock};
use crate::config::MeshConfig;
use crate::crypto::{sign_envelope, verify_envelope, CryptoError, Session, SessionStore};
use crate::identity::{IdentityKeys, PreKeyBundle};
use crate::message::{
    decode_envelope, decode_payload, encode_envelope, encode_payload, validate_envelope, AckPayload,
    ChatPayload, DecodeError, EarlyWarningPayload, Envelope, EvidenceNoticePayload, HelpPayload,
    Location, MessageType, Payload, PingPayload, PositionPayload, ResourcePayload, SafePayload,
    MAX_TTL,
};
use crate::qos::AdmissionController;
use crate::scheduler::{
    AdaptiveScheduler, DeviceMonitor, DeviceState, DutyCycle, ManualDeviceMonitor, PowerMode,
    SchedulerStatus,
};
use crate::store::{
    DedupEngine, DedupStats, FailureOutcome, PriorityQueue, QueueError, QueueStats, StateStore,
    StorageBackend,
};
use crate::transport::{MeshTransport, TransportError};
use crate::MeshError;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ============================================================================
// PUBLIC TYPES
// ============================================================================

/// A message handed to application subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveredMessage {
    /// Envelope as received (still sealed if it was encrypted)
    pub envelope: Envelope,
    /// Plaintext body
    pub payload: Payload,
    /// Transport-level peer that handed us the frame
    pub from_peer: String,
    pub thread_id: Option<String>,
}

pub type IncomingCallback = Arc<dyn Fn(DeliveredMessage) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropReason {
    Undecodable,
    UnknownType,
    Duplicate,
    InvalidSignature,
    Expired,
    DecryptFailed,
    HandshakeFailed,
}

/// What happened to one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    Delivered { id: String, forwarded: bool },
    /// Encrypted for a thread we are not part of, or a handshake for
    /// someone else: passed along only
    Relayed { id: String, forwarded: bool },
    SessionOpened { id: String, thread_id: String },
    Dropped(DropReason),
}

/// Result of one queue flush attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Sent { id: String, peers: usize },
    Retrying { id: String, attempts: u32, next_retry_at: u64 },
    Dropped { id: String, attempts: u32 },
}

/// What one scheduler tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub mode: PowerMode,
    pub mode_changed: bool,
    pub beacons: usize,
    pub flushed: Option<FlushOutcome>,
    pub expired: usize,
    pub swept: usize,
    pub next_interval: Duration,
}

/// Overrides for an outbound envelope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendOptions {
    pub loc: Option<Location>,
    /// Encrypt for this thread; fails with `SessionNotFound` if unknown
    pub thread_id: Option<String>,
    pub ttl: Option<u8>,
    pub priority: Option<u8>,
}

impl SendOptions {
    pub fn at(loc: Location) -> Self {
        Self {
            loc: Some(loc),
            ..Self::default()
        }
    }

    pub fn in_thread(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: Some(thread_id.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    pub received: u64,
    pub delivered: u64,
    pub duplicates: u64,
    pub invalid_signatures: u64,
    pub expired: u64,
    pub decrypt_failures: u64,
    pub undecodable: u64,
    pub unknown_types: u64,
    pub relayed_only: u64,
    pub sessions_opened: u64,
    pub forwarded: u64,
    pub originated: u64,
    pub sent: u64,
    pub send_failures: u64,
    pub dropped_after_retries: u64,
}

// ============================================================================
// BUILDER
// ============================================================================

pub struct RouterBuilder {
    identity: IdentityKeys,
    config: MeshConfig,
    clock: Arc<dyn Clock>,
    monitor: Arc<dyn DeviceMonitor>,
    storage: Option<Arc<dyn StorageBackend>>,
}

impl RouterBuilder {
    pub fn config(mut self, config: MeshConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn device_monitor(mut self, monitor: Arc<dyn DeviceMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn storage(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(backend);
        self
    }

    /// Validate the config and restore any persisted queue, dedup and
    /// session state. Corrupt records come back empty.
    pub fn build(self) -> Result<MeshRouter, MeshError> {
        self.config.validate()?;
        let now = self.clock.now_ms();
        let state = self.storage.map(StateStore::new);

        let mut queue = PriorityQueue::new(self.config.queue.clone());
        let mut dedup = DedupEngine::new(self.config.dedup.clone());
        let sessions = SessionStore::new(self.config.crypto.max_skip, state.clone());

        if let Some(state) = &state {
            if let Some(snapshot) = state.load_queue() {
                queue.restore(snapshot);
            }
            let (records, bloom) = state.load_dedup();
            let bloom = if self.config.dedup.persist_bloom { bloom } else { None };
            dedup.restore(records, bloom);
            sessions.load();
            info!(
                queued = queue.len(),
                seen = dedup.len(),
                sessions = sessions.len(),
                "router state restored"
            );
        }

        let mut admission = AdmissionController::new(self.config.admission.clone(), now);
        let mut scheduler = AdaptiveScheduler::new(self.config.scheduler.clone());
        let device = DeviceState::read(self.monitor.as_ref());
        admission.update_device_state(device);
        scheduler.refresh(device, 0);

        let (shutdown, _) = watch::channel(false);

        Ok(MeshRouter {
            inner: Arc::new(RouterInner {
                config: self.config,
                identity: self.identity,
                clock: self.clock,
                monitor: self.monitor,
                state,
                transports: RwLock::new(Vec::new()),
                dedup: Mutex::new(dedup),
                queue: Mutex::new(queue),
                admission: Mutex::new(admission),
                scheduler: Mutex::new(scheduler),
                sessions,
                subscribers: RwLock::new(Vec::new()),
                next_subscriber: AtomicU64::new(1),
                stats: Mutex::new(RouterStats::default()),
                applied_duty_cycle: Mutex::new(DutyCycle::Normal),
                ticks: AtomicU64::new(0),
                wake: Notify::new(),
                shutdown,
                task: Mutex::new(None),
            }),
        })
    }
}

// ============================================================================
// ROUTER
// ============================================================================

struct RouterInner {
    config: MeshConfig,
    identity: IdentityKeys,
    clock: Arc<dyn Clock>,
    monitor: Arc<dyn DeviceMonitor>,
    state: Option<StateStore>,
    transports: RwLock<Vec<Arc<dyn MeshTransport>>>,
    dedup: Mutex<DedupEngine>,
    queue: Mutex<PriorityQueue>,
    admission: Mutex<AdmissionController>,
    scheduler: Mutex<AdaptiveScheduler>,
    sessions: SessionStore,
    subscribers: RwLock<Vec<(u64, IncomingCallback)>>,
    next_subscriber: AtomicU64,
    stats: Mutex<RouterStats>,
    applied_duty_cycle: Mutex<DutyCycle>,
    ticks: AtomicU64,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct MeshRouter {
    inner: Arc<RouterInner>,
}

impl MeshRouter {
    /// Defaults: system clock, a device monitor reporting 100% battery, no
    /// persistence.
    pub fn builder(identity: IdentityKeys) -> RouterBuilder {
        RouterBuilder {
            identity,
            config: MeshConfig::default(),
            clock: Arc::new(SystemClock),
            monitor: Arc::new(ManualDeviceMonitor::default()),
            storage: None,
        }
    }

    pub fn identity(&self) -> &IdentityKeys {
        &self.inner.identity
    }

    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    fn now(&self) -> u64 {
        self.inner.clock.now_ms()
    }

    fn transports(&self) -> Vec<Arc<dyn MeshTransport>> {
        self.inner.transports.read().clone()
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.inner.config.router.transport_timeout_ms)
    }

    /// Attach a transport and route its inbound frames into this router.
    pub fn add_transport(&self, transport: Arc<dyn MeshTransport>) {
        let weak: Weak<RouterInner> = Arc::downgrade(&self.inner);
        transport.set_on_bytes_received(Box::new(move |peer_id, bytes| {
            if let Some(inner) = weak.upgrade() {
                MeshRouter { inner }.handle_inbound(&peer_id, &bytes);
            }
        }));
        info!(transport = transport.name(), "transport attached");
        self.inner.transports.write().push(transport);
    }

    pub fn peer_count(&self) -> usize {
        self.transports().iter().map(|t| t.peer_count()).sum()
    }

    // ------------------------------------------------------------------------
    // LIFECYCLE
    // ------------------------------------------------------------------------

    /// Start scanning/advertising and spawn the scheduler loop. Needs a
    /// tokio runtime.
    pub async fn start(&self) -> Result<(), MeshError> {
        let mut task = self.inner.task.lock();
        if task.is_some() {
            return Err(MeshError::AlreadyRunning);
        }
        self.inner.shutdown.send_replace(false);
        let shutdown = self.inner.shutdown.subscribe();
        let router = self.clone();
        *task = Some(tokio::spawn(async move { router.run(shutdown).await }));
        info!(identity = %self.inner.identity.identity_id(), "mesh router started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.task.lock().is_some()
    }

    /// Stop the loop, stop the radios, persist state. Nothing is discarded.
    pub async fn stop(&self) -> Result<(), MeshError> {
        let handle = self.inner.task.lock().take().ok_or(MeshError::NotRunning)?;
        self.inner.shutdown.send_replace(true);
        if let Err(e) = handle.await {
            warn!("scheduler loop ended abnormally: {}", e);
        }

        for transport in self.transports() {
            let name = transport.name().to_string();
            if let Err(e) = self.bounded(transport.stop_scan()).await {
                debug!(transport = %name, "stop_scan failed: {}", e);
            }
            if let Err(e) = self.bounded(transport.stop_advertise()).await {
                debug!(transport = %name, "stop_advertise failed: {}", e);
            }
        }

        self.persist()?;
        info!("mesh router stopped");
        Ok(())
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let report = self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(report.next_interval) => {}
                _ = self.inner.wake.notified() => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, TransportError>
    where
        F: std::future::Future<Output = Result<T, TransportError>>,
    {
        let limit = self.inner.config.router.transport_timeout_ms;
        tokio::time::timeout(self.timeout(), fut)
            .await
            .unwrap_or(Err(TransportError::Timeout(limit)))
    }

    // ------------------------------------------------------------------------
    // SCHEDULER TICK
    // ------------------------------------------------------------------------

    /// One scheduler tick: refresh device state, beacon, flush one ready
    /// entry, purge, persist.
    pub async fn tick(&self) -> TickReport {
        let now = self.now();
        let device = DeviceState::read(self.inner.monitor.as_ref());
        let peers = self.peer_count();

        let mode_changed = self.inner.scheduler.lock().refresh(device, peers).is_some();
        self.inner.admission.lock().update_device_state(device);

        self.inner.scheduler.lock().expire_burst(now);
        self.sync_duty_cycle(now).await;

        let beacons = if self.inner.config.router.beacon_enabled {
            self.beacon().await
        } else {
            0
        };

        let flushed = self.flush_once().await;

        let expired = self.inner.queue.lock().purge_expired(now);
        let swept = self.inner.dedup.lock().sweep(now);
        if expired > 0 {
            self.inner.stats.lock().expired += expired as u64;
        }

        let tick = self.inner.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        let every = u64::from(self.inner.config.router.persist_every_ticks);
        if every > 0 && tick % every == 0 {
            if let Err(e) = self.persist() {
                warn!("periodic persist failed: {}", e);
            }
        }

        let scheduler = self.inner.scheduler.lock();
        TickReport {
            mode: scheduler.mode(),
            mode_changed,
            beacons,
            flushed,
            expired,
            swept,
            next_interval: scheduler.next_interval(self.now()),
        }
    }

    async fn beacon(&self) -> usize {
        let mut ok = 0;
        for transport in self.transports() {
            let scan = self.bounded(transport.scan()).await;
            let advertise = self.bounded(transport.advertise()).await;
            match (scan, advertise) {
                (Ok(()), Ok(())) => ok += 1,
                (Err(e), _) | (_, Err(e)) => {
                    debug!(transport = transport.name(), "beacon cycle failed: {}", e)
                }
            }
        }
        ok
    }

    // Push the scheduler's duty cycle to the transports when it changed.
    async fn sync_duty_cycle(&self, now: u64) {
        let wanted = self.inner.scheduler.lock().duty_cycle(now);
        {
            let mut applied = self.inner.applied_duty_cycle.lock();
            if *applied == wanted {
                return;
            }
            *applied = wanted;
        }
        for transport in self.transports() {
            if let Err(e) = self.bounded(transport.set_duty_cycle(wanted)).await {
                debug!(transport = transport.name(), "duty cycle change failed: {}", e);
            }
        }
    }

    /// Send the most urgent ready entry over every transport. Holds the
    /// queue while no peer is in range.
    pub async fn flush_once(&self) -> Option<FlushOutcome> {
        let transports = self.transports();
        if transports.iter().all(|t| t.peer_count() == 0) {
            return None;
        }

        let now = self.now();
        let entry = self.inner.queue.lock().dequeue_next(now)?;
        let id = entry.id().to_string();

        let peers = match encode_envelope(&entry.envelope) {
            Ok(bytes) => {
                let sends = transports.iter().map(|t| self.bounded(t.broadcast(&bytes)));
                let mut reached = 0;
                for (transport, result) in transports.iter().zip(join_all(sends).await) {
                    match result {
                        Ok(n) => reached += n,
                        Err(e) => debug!(transport = transport.name(), id = %id, "broadcast failed: {}", e),
                    }
                }
                reached
            }
            Err(e) => {
                warn!(id = %id, "queued envelope no longer encodes: {}", e);
                0
            }
        };

        let now = self.now();
        let mut queue = self.inner.queue.lock();
        if peers > 0 {
            let delivered = queue.mark_delivered(&id);
            drop(queue);
            if let Err(e) = delivered {
                warn!(id = %id, "lost track of in-flight entry: {}", e);
            }
            self.inner.stats.lock().sent += 1;
            debug!(id = %id, peers, "envelope sent");
            return Some(FlushOutcome::Sent { id, peers });
        }

        let outcome = queue.mark_failed(&id, now);
        drop(queue);
        let mut stats = self.inner.stats.lock();
        stats.send_failures += 1;
        match outcome {
            Ok(FailureOutcome::Retrying {
                attempts,
                next_retry_at,
            }) => Some(FlushOutcome::Retrying {
                id,
                attempts,
                next_retry_at,
            }),
            Ok(FailureOutcome::Dropped { attempts }) => {
                stats.dropped_after_retries += 1;
                warn!(id = %id, attempts, "envelope dropped after repeated send failures");
                Some(FlushOutcome::Dropped { id, attempts })
            }
            Err(e) => {
                warn!(id = %id, "lost track of in-flight entry: {}", e);
                None
            }
        }
    }

    /// Save queue, dedup and sessions to the storage backend, if any.
    pub fn persist(&self) -> Result<(), MeshError> {
        let Some(state) = &self.inner.state else {
            return Ok(());
        };
        state.save_queue(&self.inner.queue.lock())?;
        state.save_dedup(&self.inner.dedup.lock(), self.inner.config.dedup.persist_bloom)?;
        self.inner.sessions.persist_all();
        state.flush()?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // OUTBOUND
    // ------------------------------------------------------------------------

    /// Admit, sign (and seal), and queue an application message. Returns
    /// the envelope id.
    pub fn send(&self, payload: Payload, options: SendOptions) -> Result<String, MeshError> {
        let message_type = payload.message_type();
        let now = self.now();

        // Held until the token is taken so concurrent sends cannot share one.
        let mut admission = self.inner.admission.lock();
        admission.check(message_type, now)?;

        let mut envelope = Envelope::new(self.inner.identity.public_key(), payload, now);
        if let Some(loc) = options.loc {
            envelope.loc = Some(loc);
        }
        if let Some(ttl) = options.ttl {
            if ttl > MAX_TTL {
                return Err(MeshError::InvalidInput(format!("ttl {} above {}", ttl, MAX_TTL)));
            }
            envelope.ttl = ttl;
        }
        if let Some(priority) = options.priority {
            envelope.priority = priority;
        }

        if self.inner.scheduler.lock().shape_outbound(&mut envelope) {
            debug!(id = %envelope.id, "outbound envelope reshaped for power mode");
        }
        validate_envelope(&envelope)?;

        if let Some(thread_id) = &options.thread_id {
            let payload = envelope
                .payload
                .take()
                .ok_or_else(|| MeshError::InvalidInput("nothing to encrypt".into()))?;
            let plaintext = encode_payload(&payload)?;
            let sealed = self.inner.sessions.encrypt(thread_id, &plaintext)?;
            envelope.enc = Some(sealed);
        }

        sign_envelope(&self.inner.identity, &mut envelope)?;
        encode_envelope(&envelope)?;

        if !admission.consume(message_type, now) {
            return Err(MeshError::RateLimited {
                message_type,
                retry_after: admission.time_until_next_token(message_type, now),
            });
        }
        drop(admission);
        self.inner.dedup.lock().mark_seen(&envelope.id, 0, now);

        let id = envelope.id.clone();
        let priority = envelope.priority;
        let fast_path = message_type.is_fast_path();
        self.inner
            .queue
            .lock()
            .enqueue(envelope, priority, fast_path, now)?;

        self.inner.stats.lock().originated += 1;
        if fast_path {
            self.open_burst(now);
        }
        debug!(id = %id, %message_type, priority, "outbound envelope queued");
        Ok(id)
    }

    fn open_burst(&self, now: u64) {
        self.inner.scheduler.lock().trigger_burst(now);
        self.inner.wake.notify_one();
    }

    pub fn send_help(&self, help: HelpPayload, loc: Option<Location>) -> Result<String, MeshError> {
        self.send(
            Payload::Help(help),
            SendOptions {
                loc,
                ..SendOptions::default()
            },
        )
    }

    pub fn send_safe(&self, note: Option<String>, loc: Option<Location>) -> Result<String, MeshError> {
        self.send(
            Payload::Safe(SafePayload { note }),
            SendOptions {
                loc,
                ..SendOptions::default()
            },
        )
    }

    pub fn send_resource(
        &self,
        resource_type: impl Into<String>,
        qty: u32,
        note: Option<String>,
        loc: Option<Location>,
    ) -> Result<String, MeshError> {
        self.send(
            Payload::Resource(ResourcePayload {
                resource_type: resource_type.into(),
                qty,
                note,
            }),
            SendOptions {
                loc,
                ..SendOptions::default()
            },
        )
    }

    pub fn send_ping(&self) -> Result<String, MeshError> {
        let battery = self.inner.scheduler.lock().device_state().battery_percent;
        self.send(
            Payload::Ping(PingPayload {
                battery_percent: Some(battery),
            }),
            SendOptions::default(),
        )
    }

    pub fn send_ack(&self, ack_id: impl Into<String>) -> Result<String, MeshError> {
        self.send(
            Payload::Ack(AckPayload {
                ack_id: ack_id.into(),
            }),
            SendOptions::default(),
        )
    }

    pub fn send_position(
        &self,
        loc: Location,
        heading_deg: Option<u16>,
        tags: Vec<String>,
    ) -> Result<String, MeshError> {
        self.send(
            Payload::Position(PositionPayload { heading_deg, tags }),
            SendOptions::at(loc),
        )
    }

    /// Fast-path class: jumps the queue and opens a burst window.
    pub fn send_early_warning(&self, warning: EarlyWarningPayload) -> Result<String, MeshError> {
        self.send(Payload::EarlyWarning(warning), SendOptions::default())
    }

    /// Announce a new ledger record (hash and chain head from the evidence
    /// ledger).
    pub fn send_evidence_notice(
        &self,
        record_hash: [u8; 32],
        chain_head: [u8; 32],
        sequence: u64,
    ) -> Result<String, MeshError> {
        self.send(
            Payload::EvidenceNotice(EvidenceNoticePayload {
                record_hash: record_hash.to_vec(),
                chain_head: chain_head.to_vec(),
                sequence,
            }),
            SendOptions::default(),
        )
    }

    /// End-to-end encrypted text on an established thread.
    pub fn send_chat(&self, thread_id: &str, text: impl Into<String>) -> Result<String, MeshError> {
        self.send(
            Payload::Chat(ChatPayload { text: text.into() }),
            SendOptions::in_thread(thread_id),
        )
    }

    // ------------------------------------------------------------------------
    // SESSIONS
    // ------------------------------------------------------------------------

    pub fn publish_prekey_bundle(&self) -> PreKeyBundle {
        self.inner.identity.prekey_bundle()
    }

    /// Open a thread with the owner of `bundle` and queue the SESSION_INIT
    /// that lets them derive the same session. Returns the thread id.
    pub fn start_session(&self, bundle: &PreKeyBundle) -> Result<String, MeshError> {
        let now = self.now();
        let (session, init) = Session::initiate(
            &self.inner.identity,
            bundle,
            self.inner.config.crypto.max_skip,
            now,
        )?;
        let thread_id = init.thread_id.clone();

        self.inner.sessions.insert(session);
        if let Err(e) = self.send(Payload::SessionInit(init), SendOptions::default()) {
            self.inner.sessions.remove(&thread_id);
            return Err(e);
        }
        info!(thread = %thread_id, peer = %bundle.identity_hex(), "session initiated");
        Ok(thread_id)
    }

    pub fn end_session(&self, thread_id: &str) -> bool {
        let removed = self.inner.sessions.remove(thread_id);
        if removed {
            info!(thread = thread_id, "session ended");
        }
        removed
    }

    pub fn session_threads(&self) -> Vec<String> {
        self.inner.sessions.thread_ids()
    }

    pub fn thread_for_peer(&self, peer_identity: &[u8; 32]) -> Option<String> {
        self.inner.sessions.thread_for_peer(peer_identity)
    }

    // ------------------------------------------------------------------------
    // INBOUND
    // ------------------------------------------------------------------------

    fn drop_frame(&self, reason: DropReason) -> InboundOutcome {
        let mut stats = self.inner.stats.lock();
        match reason {
            DropReason::Undecodable => stats.undecodable += 1,
            DropReason::UnknownType => stats.unknown_types += 1,
            DropReason::Duplicate => stats.duplicates += 1,
            DropReason::InvalidSignature => stats.invalid_signatures += 1,
            DropReason::Expired => stats.expired += 1,
            DropReason::DecryptFailed | DropReason::HandshakeFailed => stats.decrypt_failures += 1,
        }
        InboundOutcome::Dropped(reason)
    }

    fn is_stale(&self, envelope: &Envelope, now: u64) -> bool {
        // hop == ttl is the last hop: still delivered, never forwarded.
        if envelope.hop > envelope.ttl {
            return true;
        }
        let skew = self.inner.config.router.clock_skew_allowance_ms;
        if envelope.ts > now.saturating_add(skew) {
            return true;
        }
        now.saturating_sub(envelope.ts) > envelope.message_type.max_age_ms().saturating_add(skew)
    }

    /// Run one frame through the inbound pipeline. Never fails: every bad
    /// frame is dropped on its own.
    pub fn handle_inbound(&self, peer_id: &str, bytes: &[u8]) -> InboundOutcome {
        self.inner.stats.lock().received += 1;
        let now = self.now();

        let envelope = match decode_envelope(bytes) {
            Ok(env) => env,
            Err(DecodeError::UnknownType(tag)) => {
                debug!(peer = peer_id, tag, "dropping unknown message type");
                return self.drop_frame(DropReason::UnknownType);
            }
            Err(e) => {
                debug!(peer = peer_id, "dropping undecodable frame: {}", e);
                return self.drop_frame(DropReason::Undecodable);
            }
        };

        if self.inner.dedup.lock().seen(&envelope.id) {
            return self.drop_frame(DropReason::Duplicate);
        }

        if let Err(e) = verify_envelope(&envelope) {
            warn!(id = %envelope.id, sender = %envelope.sender_short(), "dropping envelope: {}", e);
            return self.drop_frame(DropReason::InvalidSignature);
        }

        if self.is_stale(&envelope, now) {
            debug!(id = %envelope.id, hop = envelope.hop, ttl = envelope.ttl, "dropping expired envelope");
            return self.drop_frame(DropReason::Expired);
        }

        self.inner
            .dedup
            .lock()
            .mark_seen(&envelope.id, envelope.hop, now);

        let our_key = self.inner.identity.public_key();
        let (payload, thread_id) = match (&envelope.payload, &envelope.enc) {
            (Some(Payload::SessionInit(init)), _) if init.recipient == our_key => {
                return self.accept_session_init(peer_id, &envelope, init.clone(), now);
            }
            (Some(Payload::SessionInit(_)), _) => return self.relay(&envelope, now),
            (Some(payload), _) => (payload.clone(), None),
            (None, Some(sealed)) => match self.inner.sessions.decrypt(sealed) {
                Ok(plaintext) => match decode_payload(&plaintext) {
                    Ok(p) if p.message_type() == envelope.message_type => {
                        (p, Some(sealed.thread_id.clone()))
                    }
                    Ok(p) => {
                        warn!(id = %envelope.id, inner = %p.message_type(), "sealed payload type mismatch");
                        return self.drop_frame(DropReason::DecryptFailed);
                    }
                    Err(e) => {
                        warn!(id = %envelope.id, "sealed payload undecodable: {}", e);
                        return self.drop_frame(DropReason::DecryptFailed);
                    }
                },
                Err(CryptoError::SessionNotFound(_)) => return self.relay(&envelope, now),
                Err(e) => {
                    warn!(id = %envelope.id, thread = %sealed.thread_id, "decrypt failed: {}", e);
                    return self.drop_frame(DropReason::DecryptFailed);
                }
            },
            (None, None) => return self.drop_frame(DropReason::Undecodable),
        };

        let id = envelope.id.clone();
        self.deliver(DeliveredMessage {
            envelope: envelope.clone(),
            payload,
            from_peer: peer_id.to_string(),
            thread_id,
        });
        let forwarded = self.forward(&envelope, now);
        InboundOutcome::Delivered { id, forwarded }
    }

    fn accept_session_init(
        &self,
        peer_id: &str,
        envelope: &Envelope,
        init: crate::message::SessionInitPayload,
        now: u64,
    ) -> InboundOutcome {
        if self.inner.sessions.contains(&init.thread_id) {
            return self.drop_frame(DropReason::Duplicate);
        }
        let session = match Session::respond(
            &self.inner.identity,
            &envelope.sender,
            &init,
            self.inner.config.crypto.max_skip,
            now,
        ) {
            Ok(session) => session,
            Err(e) => {
                warn!(id = %envelope.id, "handshake rejected: {}", e);
                return self.drop_frame(DropReason::HandshakeFailed);
            }
        };

        let thread_id = init.thread_id.clone();
        self.inner.sessions.insert(session);
        self.inner.stats.lock().sessions_opened += 1;
        info!(thread = %thread_id, peer = %envelope.sender_short(), "session accepted");

        self.deliver(DeliveredMessage {
            envelope: envelope.clone(),
            payload: Payload::SessionInit(init),
            from_peer: peer_id.to_string(),
            thread_id: Some(thread_id.clone()),
        });
        InboundOutcome::SessionOpened {
            id: envelope.id.clone(),
            thread_id,
        }
    }

    fn relay(&self, envelope: &Envelope, now: u64) -> InboundOutcome {
        self.inner.stats.lock().relayed_only += 1;
        let forwarded = self.forward(envelope, now);
        InboundOutcome::Relayed {
            id: envelope.id.clone(),
            forwarded,
        }
    }

    fn forward(&self, envelope: &Envelope, now: u64) -> bool {
        let next = envelope.forwarded();
        if next.is_hop_exhausted() {
            return false;
        }
        let fast_path = next.message_type.is_fast_path();
        let priority = next.priority;
        match self.inner.queue.lock().enqueue(next, priority, fast_path, now) {
            Ok(()) => {}
            Err(QueueError::AlreadyQueued(_)) => return false,
            Err(e) => {
                debug!(id = %envelope.id, "not forwarding: {}", e);
                return false;
            }
        }
        self.inner.stats.lock().forwarded += 1;
        if fast_path {
            self.open_burst(now);
        }
        true
    }

    fn deliver(&self, message: DeliveredMessage) {
        let subscribers: Vec<IncomingCallback> = self
            .inner
            .subscribers
            .read()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in subscribers {
            callback(message.clone());
        }
        self.inner.stats.lock().delivered += 1;
    }

    // ------------------------------------------------------------------------
    // APPLICATION API
    // ------------------------------------------------------------------------

    /// Register a callback for delivered messages. Returns a handle for
    /// [`MeshRouter::unsubscribe`].
    pub fn subscribe_incoming<F>(&self, callback: F) -> u64
    where
        F: Fn(DeliveredMessage) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribers.write().push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, subscription: u64) -> bool {
        let mut subscribers = self.inner.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(id, _)| *id != subscription);
        subscribers.len() != before
    }

    pub fn get_queue_stats(&self) -> QueueStats {
        self.inner.queue.lock().stats(self.now())
    }

    pub fn get_scheduler_status(&self) -> SchedulerStatus {
        self.inner.scheduler.lock().status(self.now())
    }

    pub fn get_dedup_stats(&self) -> DedupStats {
        self.inner.dedup.lock().stats()
    }

    pub fn stats(&self) -> RouterStats {
        self.inner.stats.lock().clone()
    }

    /// Time until a send of this type would pass the rate limiter.
    pub fn time_until_next_token(&self, message_type: MessageType) -> Duration {
        self.inner
            .admission
            .lock()
            .time_until_next_token(message_type, self.now())
    }

    /// Queued envelopes in send order, for status displays.
    pub fn queued_envelopes(&self) -> Vec<Envelope> {
        self.inner
            .queue
            .lock()
            .iter_ordered()
            .map(|e| e.envelope.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::message::HelpPayload;

    const T0: u64 = 1_700_000_000_000;

    fn router(battery: u8) -> (MeshRouter, ManualClock, Arc<ManualDeviceMonitor>) {
        let clock = ManualClock::new(T0);
        let monitor = Arc::new(ManualDeviceMonitor::new(battery));
        let router = MeshRouter::builder(IdentityKeys::generate())
            .clock(Arc::new(clock.clone()))
            .device_monitor(monitor.clone())
            .build()
            .unwrap();
        (router, clock, monitor)
    }

    fn help() -> HelpPayload {
        HelpPayload {
            under_rubble: false,
            injured: true,
            people_count: 1,
            note: Some("ankle broken".into()),
        }
    }

    #[test]
    fn test_send_marks_own_message_seen() {
        let (r, _, _) = router(90);
        let id = r.send_help(help(), None).unwrap();
        let queued = r.queued_envelopes();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, id);
        assert!(queued[0].sig.is_some());

        let echo = encode_envelope(&queued[0].forwarded()).unwrap();
        assert_eq!(
            r.handle_inbound("peer", &echo),
            InboundOutcome::Dropped(DropReason::Duplicate)
        );
    }

    #[test]
    fn test_chat_without_session_is_rejected() {
        let (r, _, _) = router(90);
        assert_eq!(
            r.send_chat("no-such-thread", "hello"),
            Err(MeshError::SessionNotFound("no-such-thread".into()))
        );
        assert!(r.queued_envelopes().is_empty());
    }

    #[test]
    fn test_mesh_inactive_at_low_battery_except_help() {
        let (r, _, _) = router(9);
        assert!(matches!(
            r.send_safe(None, None),
            Err(MeshError::MeshInactive { .. })
        ));
        assert!(r.send_help(help(), None).is_ok());
    }

    #[test]
    fn test_garbage_is_dropped_not_fatal() {
        let (r, _, _) = router(90);
        assert_eq!(
            r.handle_inbound("peer", b"\x01\x01garbage"),
            InboundOutcome::Dropped(DropReason::Undecodable)
        );
        assert_eq!(
            r.handle_inbound("peer", b"\x01\xEEanything"),
            InboundOutcome::Dropped(DropReason::UnknownType)
        );
        let stats = r.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.undecodable, 1);
        assert_eq!(stats.unknown_types, 1);
    }

    #[test]
    fn test_forged_signature_dropped() {
        let (r, _, _) = router(90);
        let other = IdentityKeys::generate();
        let mut env = Envelope::new(other.public_key(), Payload::Help(help()), T0);
        sign_envelope(&other, &mut env).unwrap();
        env.priority = 0;
        let bytes = encode_envelope(&env).unwrap();
        assert_eq!(
            r.handle_inbound("peer", &bytes),
            InboundOutcome::Dropped(DropReason::InvalidSignature)
        );
        // A forged copy must not poison dedup for the genuine one
        env.priority = MessageType::Help.default_priority();
        let genuine = encode_envelope(&env).unwrap();
        assert!(matches!(
            r.handle_inbound("peer", &genuine),
            InboundOutcome::Delivered { .. }
        ));
    }

    #[test]
    fn test_old_envelope_expires() {
        let (r, clock, _) = router(90);
        let other = IdentityKeys::generate();
        let mut env = Envelope::new(other.public_key(), Payload::Help(help()), T0);
        sign_envelope(&other, &mut env).unwrap();
        clock.advance(Duration::from_secs(7 * 3600));
        assert_eq!(
            r.handle_inbound("peer", &encode_envelope(&env).unwrap()),
            InboundOutcome::Dropped(DropReason::Expired)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_call_past_deadline_times_out() {
        let (r, _, _) = router(90);
        let limit = r.config().router.transport_timeout_ms;
        let result: Result<usize, TransportError> = r.bounded(std::future::pending()).await;
        assert_eq!(result, Err(TransportError::Timeout(limit)));

        let quick = r.bounded(async { Ok::<_, TransportError>(3) }).await;
        assert_eq!(quick, Ok(3));
    }

    #[tokio::test]
    async fn test_flush_holds_queue_without_peers() {
        let (r, _, _) = router(90);
        r.send_help(help(), None).unwrap();
        assert_eq!(r.flush_once().await, None);
        assert_eq!(r.get_queue_stats().total, 1);
    }
}
