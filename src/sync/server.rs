//! SyncServer: one room per document, shared by every connection to it.
//!
//! - DashMap of rooms keyed by document id
//! - the prior state is fetched once per room lifetime
//! - edits mark the room dirty; a ticker flushes rooms that have been quiet
//!   for the debounce, or dirty for longer than the max debounce
//! - the last peer leaving triggers an immediate flush, after which the
//!   room is dropped once clean
//!
//! Flushes of one document are serialized by an async lock held for the
//! whole store hook, and the state snapshot is taken after acquiring it, so
//! metadata commits land in logical order. Failed flushes leave the room
//! dirty and are retried after a backoff.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, OnceCell};
use tracing::{debug, error, info, warn};

use super::document::CanvasDocument;
use super::hooks::{DocumentHooks, FlushOutcome};
use super::protocol::ServerMessage;
use super::{DocumentId, PeerId, SyncError, SyncResult};
use crate::auth::CollabContext;
use crate::config::FlushConfig;

/// Configuration for the SyncServer
#[derive(Debug, Clone)]
pub struct SyncServerConfig {
    pub flush: FlushConfig,
    /// Maximum concurrent connections per document
    pub max_peers_per_document: usize,
}

impl Default for SyncServerConfig {
    fn default() -> Self {
        Self {
            flush: FlushConfig::default(),
            max_peers_per_document: 50,
        }
    }
}

impl SyncServerConfig {
    pub fn with_debounce(mut self, debounce: Duration, max_debounce: Duration) -> Self {
        self.flush.debounce = debounce;
        self.flush.max_debounce = max_debounce;
        self
    }
}

/// Flush bookkeeping for one room
#[derive(Debug, Default)]
struct FlushState {
    /// Bumped on every applied change
    version: u64,
    /// Version captured by the last successful flush
    flushed_version: u64,
    first_unflushed: Option<Instant>,
    last_change: Option<Instant>,
    retry_at: Option<Instant>,
    /// A flush task is queued or running
    scheduled: bool,
}

impl FlushState {
    fn is_dirty(&self) -> bool {
        self.version > self.flushed_version
    }

    fn mark_changed(&mut self, now: Instant) {
        self.version += 1;
        self.first_unflushed.get_or_insert(now);
        self.last_change = Some(now);
    }

    fn is_due(&self, now: Instant, config: &FlushConfig) -> bool {
        if !self.is_dirty() || self.scheduled {
            return false;
        }
        if self.retry_at.map_or(false, |at| now < at) {
            return false;
        }
        let quiet = self
            .last_change
            .map_or(true, |t| now.duration_since(t) >= config.debounce);
        let overdue = self
            .first_unflushed
            .map_or(false, |t| now.duration_since(t) >= config.max_debounce);
        quiet || overdue
    }

    fn flushed(&mut self, version: u64, snapshot_at: Instant) {
        self.flushed_version = self.flushed_version.max(version);
        self.retry_at = None;
        self.first_unflushed = if self.is_dirty() { Some(snapshot_at) } else { None };
    }

    fn failed(&mut self, retry_at: Instant) {
        self.retry_at = Some(retry_at);
    }
}

/// A live document with its connected peers
struct DocumentRoom {
    document_id: DocumentId,
    /// Replaced wholesale after each successful flush
    context: RwLock<Arc<CollabContext>>,
    /// Loaded through the fetch hook exactly once
    document: OnceCell<Mutex<CanvasDocument>>,
    peers: DashMap<PeerId, mpsc::UnboundedSender<ServerMessage>>,
    flush_state: Mutex<FlushState>,
    /// Serializes flushes of this document
    flush_lock: tokio::sync::Mutex<()>,
    /// Server-side edits in flight; a pinned room is never evicted
    pending_edits: AtomicUsize,
}

impl DocumentRoom {
    fn new(context: CollabContext) -> Self {
        Self {
            document_id: context.document_id().to_string(),
            context: RwLock::new(Arc::new(context)),
            document: OnceCell::new(),
            peers: DashMap::new(),
            flush_state: Mutex::new(FlushState::default()),
            flush_lock: tokio::sync::Mutex::new(()),
            pending_edits: AtomicUsize::new(0),
        }
    }

    fn context(&self) -> Arc<CollabContext> {
        self.context.read().clone()
    }

    fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn is_dirty(&self) -> bool {
        self.flush_state.lock().is_dirty()
    }

    fn is_idle(&self) -> bool {
        let state = self.flush_state.lock();
        self.peers.is_empty()
            && !state.is_dirty()
            && !state.scheduled
            && self.pending_edits.load(Ordering::SeqCst) == 0
    }

    async fn load(&self, hooks: &dyn DocumentHooks) -> &Mutex<CanvasDocument> {
        self.document
            .get_or_init(|| async move {
                let context = self.context();
                let document = match hooks.fetch(&context).await {
                    Some(state) => match CanvasDocument::load(&state) {
                        Ok(document) => {
                            info!("Loaded {} ({} bytes)", self.document_id, state.len());
                            document
                        }
                        Err(e) => {
                            error!("Stored state for {} is unreadable, starting empty: {}", self.document_id, e);
                            CanvasDocument::new()
                        }
                    },
                    None => {
                        info!("Starting {} from an empty document", self.document_id);
                        CanvasDocument::new()
                    }
                };
                Mutex::new(document)
            })
            .await
    }

    /// Send to every peer except `exclude`
    fn broadcast(&self, exclude: Option<&str>, msg: &ServerMessage) {
        for peer in self.peers.iter() {
            if Some(peer.key().as_str()) != exclude {
                let _ = peer.value().send(msg.clone());
            }
        }
    }

    /// Apply `edit` under the document lock and mark dirty if heads moved
    fn edit<F, R>(&self, document: &Mutex<CanvasDocument>, edit: F) -> SyncResult<(R, bool)>
    where
        F: FnOnce(&mut CanvasDocument) -> SyncResult<R>,
    {
        let mut doc = document.lock();
        let before = doc.heads();
        let result = edit(&mut doc)?;
        let changed = doc.heads() != before;
        if changed {
            self.flush_state.lock().mark_changed(Instant::now());
        }
        Ok((result, changed))
    }
}

/// Holds a room registered for the duration of a server-side edit
struct EditPin(Arc<DocumentRoom>);

impl EditPin {
    fn new(room: Arc<DocumentRoom>) -> Self {
        room.pending_edits.fetch_add(1, Ordering::SeqCst);
        Self(room)
    }
}

impl Drop for EditPin {
    fn drop(&mut self) {
        self.0.pending_edits.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything a new connection needs to start syncing
#[derive(Debug, Clone)]
pub struct Session {
    pub peer_id: PeerId,
    pub document_id: DocumentId,
    /// Full saved state at join time
    pub state: Vec<u8>,
}

/// The main synchronization server
pub struct SyncServer {
    config: SyncServerConfig,
    rooms: DashMap<DocumentId, Arc<DocumentRoom>>,
    hooks: Arc<dyn DocumentHooks>,
    started_at: Instant,
    shutdown_tx: broadcast::Sender<()>,
}

impl SyncServer {
    pub fn new(hooks: Arc<dyn DocumentHooks>, config: SyncServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            rooms: DashMap::new(),
            hooks,
            started_at: Instant::now(),
            shutdown_tx,
        }
    }

    pub fn with_hooks(hooks: Arc<dyn DocumentHooks>) -> Self {
        Self::new(hooks, SyncServerConfig::default())
    }

    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate graceful shutdown; the flush task flushes everything first
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    fn room_for(&self, context: &CollabContext) -> Arc<DocumentRoom> {
        self.rooms
            .entry(context.document_id().to_string())
            .or_insert_with(|| Arc::new(DocumentRoom::new(context.clone())))
            .clone()
    }

    fn room(&self, document_id: &str) -> SyncResult<Arc<DocumentRoom>> {
        self.rooms
            .get(document_id)
            .map(|r| r.clone())
            .ok_or_else(|| SyncError::DocumentNotActive(document_id.to_string()))
    }

    /// True while `room` is still the registered room for its document
    fn is_current(&self, room: &Arc<DocumentRoom>) -> bool {
        self.rooms
            .get(&room.document_id)
            .map_or(false, |r| Arc::ptr_eq(r.value(), room))
    }

    /// Attach an authenticated connection to its document
    pub async fn connect(
        &self,
        context: CollabContext,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> SyncResult<Session> {
        let peer_id = uuid::Uuid::new_v4().to_string();

        loop {
            let room = self.room_for(&context);
            if room.peers.len() >= self.config.max_peers_per_document {
                return Err(SyncError::DocumentFull(room.document_id.clone()));
            }
            room.peers.insert(peer_id.clone(), tx.clone());

            // An idle room may have been evicted between lookup and join
            if !self.is_current(&room) {
                room.peers.remove(&peer_id);
                continue;
            }

            let document = room.load(self.hooks.as_ref()).await;
            let state = document.lock().save();

            info!("Peer {} joined {} ({} peers)", peer_id, room.document_id, room.peers.len());
            return Ok(Session {
                peer_id,
                document_id: room.document_id.clone(),
                state,
            });
        }
    }

    /// Detach a connection. The last one out schedules an immediate flush.
    pub fn disconnect(self: &Arc<Self>, document_id: &str, peer_id: &str) {
        let Ok(room) = self.room(document_id) else {
            return;
        };
        room.peers.remove(peer_id);
        info!("Peer {} left {}", peer_id, document_id);

        if room.is_empty() {
            if room.is_dirty() {
                self.schedule_flush(room);
            } else {
                self.evict_if_idle(&room);
            }
        }
    }

    /// Merge a client update and relay it to the other peers
    pub fn apply_update(&self, document_id: &str, peer_id: &str, update: Vec<u8>) -> SyncResult<bool> {
        let room = self.room(document_id)?;
        let document = room
            .document
            .get()
            .ok_or_else(|| SyncError::DocumentNotActive(document_id.to_string()))?;

        let ((), changed) = room.edit(document, |doc| {
            doc.apply_update(&update)?;
            Ok(())
        })?;

        if changed {
            debug!("Applied {} byte update from {} to {}", update.len(), peer_id, document_id);
            room.broadcast(
                Some(peer_id),
                &ServerMessage::Update {
                    update,
                    from_peer: Some(peer_id.to_string()),
                },
            );
        }
        Ok(changed)
    }

    /// Relay an awareness payload; never persisted
    pub fn relay_awareness(&self, document_id: &str, peer_id: &str, payload: Vec<u8>) -> SyncResult<()> {
        let room = self.room(document_id)?;
        room.broadcast(
            Some(peer_id),
            &ServerMessage::Awareness {
                peer_id: peer_id.to_string(),
                payload,
            },
        );
        Ok(())
    }

    /// Full current state of an active document
    pub fn full_state(&self, document_id: &str) -> SyncResult<Vec<u8>> {
        let room = self.room(document_id)?;
        let document = room
            .document
            .get()
            .ok_or_else(|| SyncError::DocumentNotActive(document_id.to_string()))?;
        let state = document.lock().save();
        Ok(state)
    }

    /// Server-side edit: rewrite the markdown content of a document.
    ///
    /// Joins (or opens) the room with `context`, broadcasts the resulting
    /// changes to connected peers and schedules a flush.
    pub async fn replace_content(self: &Arc<Self>, context: CollabContext, markdown: &str) -> SyncResult<bool> {
        // Pin before loading; an idle room may be evicted between lookup and pin
        let pin = loop {
            let pin = EditPin::new(self.room_for(&context));
            if self.is_current(&pin.0) {
                break pin;
            }
        };
        let room = pin.0.clone();
        let document = room.load(self.hooks.as_ref()).await;

        let (update, changed) = room.edit(document, |doc| {
            let changed = doc.replace_content(markdown)?;
            Ok(if changed { Some(doc.save_incremental()) } else { None })
        })?;

        if let Some(update) = update {
            info!("Server edit on {} ({} bytes)", room.document_id, markdown.len());
            room.broadcast(None, &ServerMessage::Update { update, from_peer: None });
        }

        if room.is_empty() && room.is_dirty() {
            self.schedule_flush(room.clone());
        }
        drop(pin);
        if room.is_empty() {
            self.evict_if_idle(&room);
        }
        Ok(changed)
    }

    /// Flush one document now and wait for the result.
    /// `Ok(None)` when there was nothing to flush.
    pub async fn flush_document(&self, document_id: &str) -> SyncResult<Option<FlushOutcome>> {
        let room = self.room(document_id)?;
        Ok(self.flush_room(&room).await?)
    }

    async fn flush_room(&self, room: &Arc<DocumentRoom>) -> Result<Option<FlushOutcome>, super::FlushError> {
        let _guard = room.flush_lock.lock().await;

        let Some(document) = room.document.get() else {
            return Ok(None);
        };
        let snapshot_at = Instant::now();
        let (state, version) = {
            let mut doc = document.lock();
            let flush_state = room.flush_state.lock();
            if !flush_state.is_dirty() {
                return Ok(None);
            }
            (doc.save(), flush_state.version)
        };

        let context = room.context();
        match self.hooks.store(&context, &state).await {
            Ok(outcome) => {
                *room.context.write() = Arc::new(context.with_document(outcome.document.clone()));
                room.flush_state.lock().flushed(version, snapshot_at);
                debug!("Flushed {} at version {}", room.document_id, version);
                Ok(Some(outcome))
            }
            Err(e) => {
                let retry_at = Instant::now() + self.config.flush.debounce;
                room.flush_state.lock().failed(retry_at);
                warn!("Flush of {} not acknowledged, retrying in {:?}", room.document_id, self.config.flush.debounce);
                Err(e)
            }
        }
    }

    /// Run a flush on its own task so it outlives the connection
    fn schedule_flush(self: &Arc<Self>, room: Arc<DocumentRoom>) {
        {
            let mut state = room.flush_state.lock();
            if state.scheduled {
                return;
            }
            state.scheduled = true;
        }

        let server = self.clone();
        tokio::spawn(async move {
            let _ = server.flush_room(&room).await;
            room.flush_state.lock().scheduled = false;
            server.evict_if_idle(&room);
        });
    }

    fn evict_if_idle(&self, room: &Arc<DocumentRoom>) {
        let removed = self
            .rooms
            .remove_if(&room.document_id, |_, r| Arc::ptr_eq(r, room) && r.is_idle());
        if removed.is_some() {
            info!("Closed room {}", room.document_id);
        }
    }

    /// Schedule flushes for every due room and drop idle ones
    pub fn flush_due(self: &Arc<Self>) -> usize {
        let now = Instant::now();
        let rooms: Vec<Arc<DocumentRoom>> = self.rooms.iter().map(|r| r.value().clone()).collect();

        let mut scheduled = 0;
        for room in rooms {
            if room.flush_state.lock().is_due(now, &self.config.flush) {
                self.schedule_flush(room);
                scheduled += 1;
            } else if room.is_idle() {
                self.evict_if_idle(&room);
            }
        }
        scheduled
    }

    /// Flush every dirty room and wait for all of them
    pub async fn flush_all(&self) -> usize {
        let rooms: Vec<Arc<DocumentRoom>> = self.rooms.iter().map(|r| r.value().clone()).collect();

        let mut flushed = 0;
        for room in rooms {
            match self.flush_room(&room).await {
                Ok(Some(_)) => flushed += 1,
                Ok(None) => {}
                Err(e) => error!("Final flush of {} failed: {}", room.document_id, e),
            }
        }
        flushed
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            active_documents: self.rooms.len(),
            connected_peers: self.rooms.iter().map(|r| r.peers.len()).sum(),
            dirty_documents: self.rooms.iter().filter(|r| r.is_dirty()).count(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Start the flush scheduler
    pub fn start_background_tasks(self: Arc<Self>) -> BackgroundTaskHandles {
        let server = self.clone();
        let tick = server.config.flush.tick;
        // Subscribe before spawning so an early shutdown is not missed
        let mut shutdown = server.shutdown_receiver();

        let flush_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let scheduled = server.flush_due();
                        if scheduled > 0 {
                            debug!("Scheduled {} flushes", scheduled);
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Flush task shutting down");
                        let flushed = server.flush_all().await;
                        info!("Final flush wrote {} documents", flushed);
                        break;
                    }
                }
            }
        });

        BackgroundTaskHandles {
            flush_task: flush_handle,
        }
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub active_documents: usize,
    pub connected_peers: usize,
    pub dirty_documents: usize,
    pub uptime_seconds: u64,
}

/// Handles for background tasks
pub struct BackgroundTaskHandles {
    pub flush_task: tokio::task::JoinHandle<()>,
}

impl BackgroundTaskHandles {
    /// Wait for all tasks to complete
    pub async fn wait(self) {
        let _ = self.flush_task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DocumentPatch, DocumentRecord, UserRecord};
    use crate::sync::hooks::{BestEffort, FlushError};
    use crate::sync::protocol::ServerMessage;
    use async_trait::async_trait;
    /// In-memory hooks that remember every flushed state
    #[derive(Default)]
    struct MemoryHooks {
        stored: Mutex<Option<Vec<u8>>>,
        fetches: AtomicUsize,
        stores: Mutex<Vec<(Option<String>, Vec<u8>)>>,
        failures_left: AtomicUsize,
        fetch_delay: Option<Duration>,
        store_delay: Option<Duration>,
    }

    #[async_trait]
    impl DocumentHooks for MemoryHooks {
        async fn fetch(&self, _context: &CollabContext) -> Option<Vec<u8>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.fetch_delay {
                tokio::time::sleep(delay).await;
            }
            self.stored.lock().clone()
        }

        async fn store(&self, context: &CollabContext, state: &[u8]) -> Result<FlushOutcome, FlushError> {
            if let Some(delay) = self.store_delay {
                tokio::time::sleep(delay).await;
            }
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(FlushError::Commit(crate::storage::StorageError::Backend(
                    "injected".into(),
                )));
            }
            self.stores
                .lock()
                .push((context.document.state_storage_key.clone(), state.to_vec()));
            *self.stored.lock() = Some(state.to_vec());

            let mut document = context.document.clone();
            document.apply(&DocumentPatch {
                state_storage_key: Some(format!("state/{}", document.document_id)),
                storage_size: Some(state.len() as u64),
                ..Default::default()
            });
            Ok(FlushOutcome {
                document,
                usage: BestEffort::Failed("not tracked".into()),
            })
        }
    }

    fn context(document_id: &str) -> CollabContext {
        CollabContext::new(
            UserRecord::new("u-1", "Ada"),
            DocumentRecord::new(document_id, "u-1"),
        )
    }

    fn server(hooks: Arc<MemoryHooks>) -> Arc<SyncServer> {
        let config = SyncServerConfig::default()
            .with_debounce(Duration::from_millis(20), Duration::from_millis(100));
        Arc::new(SyncServer::new(hooks, config))
    }

    fn update_with(content: &str) -> Vec<u8> {
        let mut doc = CanvasDocument::new();
        doc.replace_content(content).unwrap();
        doc.save()
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_fetch_runs_once_per_room() {
        let hooks = Arc::new(MemoryHooks::default());
        let server = server(hooks.clone());

        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let (a, b) = tokio::join!(
            server.connect(context("d-1"), tx1),
            server.connect(context("d-1"), tx2)
        );

        assert_ne!(a.unwrap().peer_id, b.unwrap().peer_id);
        assert_eq!(hooks.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(server.stats().active_documents, 1);
        assert_eq!(server.stats().connected_peers, 2);
    }

    #[tokio::test]
    async fn test_update_is_relayed_to_other_peers() {
        let hooks = Arc::new(MemoryHooks::default());
        let server = server(hooks);

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let alice = server.connect(context("d-1"), tx1).await.unwrap();
        server.connect(context("d-1"), tx2).await.unwrap();

        let changed = server
            .apply_update("d-1", &alice.peer_id, update_with("hi"))
            .unwrap();

        assert!(changed);
        match rx2.try_recv().unwrap() {
            ServerMessage::Update { from_peer, .. } => assert_eq!(from_peer, Some(alice.peer_id.clone())),
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reapplying_same_update_is_not_a_change() {
        let hooks = Arc::new(MemoryHooks::default());
        let server = server(hooks);
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = server.connect(context("d-1"), tx).await.unwrap();

        let update = update_with("hello");
        assert!(server.apply_update("d-1", &session.peer_id, update.clone()).unwrap());
        assert!(!server.apply_update("d-1", &session.peer_id, update).unwrap());
    }

    #[tokio::test]
    async fn test_last_peer_leaving_flushes_and_closes() {
        let hooks = Arc::new(MemoryHooks::default());
        let server = server(hooks.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = server.connect(context("d-1"), tx).await.unwrap();

        server
            .apply_update("d-1", &session.peer_id, update_with("hello world"))
            .unwrap();
        server.disconnect("d-1", &session.peer_id);

        wait_for(|| server.stats().active_documents == 0).await;
        let stored = hooks.stored.lock().clone().unwrap();
        assert_eq!(CanvasDocument::load(&stored).unwrap().content().unwrap(), "hello world");
    }

    #[tokio::test]
    async fn test_reconnect_resumes_stored_state() {
        let hooks = Arc::new(MemoryHooks::default());
        let server = server(hooks.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = server.connect(context("d-1"), tx).await.unwrap();
        server
            .apply_update("d-1", &session.peer_id, update_with("persist me"))
            .unwrap();
        server.disconnect("d-1", &session.peer_id);
        wait_for(|| server.stats().active_documents == 0).await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let session = server.connect(context("d-1"), tx).await.unwrap();

        let resumed = CanvasDocument::load(&session.state).unwrap();
        assert_eq!(resumed.content().unwrap(), "persist me");
        assert_eq!(hooks.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_context_is_replaced_after_flush() {
        let hooks = Arc::new(MemoryHooks::default());
        let server = server(hooks.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = server.connect(context("d-1"), tx).await.unwrap();

        server.apply_update("d-1", &session.peer_id, update_with("one")).unwrap();
        server.flush_document("d-1").await.unwrap().unwrap();
        server.apply_update("d-1", &session.peer_id, update_with("two")).unwrap();
        server.flush_document("d-1").await.unwrap().unwrap();

        let stores = hooks.stores.lock();
        assert_eq!(stores.len(), 2);
        assert_eq!(stores[0].0, None);
        assert_eq!(stores[1].0.as_deref(), Some("state/d-1"));
    }

    #[tokio::test]
    async fn test_clean_document_is_not_flushed() {
        let hooks = Arc::new(MemoryHooks::default());
        let server = server(hooks.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        server.connect(context("d-1"), tx).await.unwrap();

        assert!(server.flush_document("d-1").await.unwrap().is_none());
        assert!(hooks.stores.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_flush_is_retried() {
        let hooks = Arc::new(MemoryHooks::default());
        hooks.failures_left.store(1, Ordering::SeqCst);
        let server = server(hooks.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = server.connect(context("d-1"), tx).await.unwrap();
        server.apply_update("d-1", &session.peer_id, update_with("retry")).unwrap();

        let first = server.flush_document("d-1").await;
        assert!(matches!(first, Err(SyncError::Flush(_))));
        assert_eq!(server.stats().dirty_documents, 1);

        let handles = server.clone().start_background_tasks();
        wait_for(|| server.stats().dirty_documents == 0).await;
        assert_eq!(hooks.stores.lock().len(), 1);

        server.shutdown();
        handles.wait().await;
    }

    #[tokio::test]
    async fn test_flushes_of_one_document_are_serialized() {
        let hooks = Arc::new(MemoryHooks {
            store_delay: Some(Duration::from_millis(30)),
            ..Default::default()
        });
        let server = server(hooks.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = server.connect(context("d-1"), tx).await.unwrap();

        server.apply_update("d-1", &session.peer_id, update_with("first")).unwrap();
        let early = server.flush_document("d-1");
        let late = async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            server.apply_update("d-1", &session.peer_id, update_with("second")).unwrap();
            server.flush_document("d-1").await
        };
        let (early, late) = tokio::join!(early, late);
        early.unwrap();
        late.unwrap();

        // The last committed state is the latest one
        let last = hooks.stores.lock().last().unwrap().1.clone();
        let mut committed = CanvasDocument::load(&last).unwrap();
        let mut current = CanvasDocument::load(&server.full_state("d-1").unwrap()).unwrap();
        assert_eq!(committed.heads(), current.heads());
        assert_eq!(hooks.stores.lock().len(), 2);
        assert_eq!(server.stats().dirty_documents, 0);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_dirty_rooms() {
        let hooks = Arc::new(MemoryHooks::default());
        let config = SyncServerConfig::default()
            .with_debounce(Duration::from_secs(60), Duration::from_secs(120));
        let server = Arc::new(SyncServer::new(hooks.clone(), config));
        let handles = server.clone().start_background_tasks();

        let (tx, _rx) = mpsc::unbounded_channel();
        let session = server.connect(context("d-1"), tx).await.unwrap();
        server.apply_update("d-1", &session.peer_id, update_with("bye")).unwrap();

        server.shutdown();
        handles.wait().await;

        assert_eq!(hooks.stores.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_server_edit_broadcasts_and_flushes() {
        let hooks = Arc::new(MemoryHooks::default());
        let server = server(hooks.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = server.connect(context("d-1"), tx).await.unwrap();

        let changed = server.replace_content(context("d-1"), "from the api").await.unwrap();
        assert!(changed);

        match rx.try_recv().unwrap() {
            ServerMessage::Update { update, from_peer } => {
                assert!(from_peer.is_none());
                let mut replica = CanvasDocument::load(&session.state).unwrap();
                replica.apply_update(&update).unwrap();
                assert_eq!(replica.content().unwrap(), "from the api");
            }
            other => panic!("unexpected {:?}", other),
        }

        let unchanged = server.replace_content(context("d-1"), "from the api").await.unwrap();
        assert!(!unchanged);
    }

    #[tokio::test]
    async fn test_server_edit_without_peers_persists() {
        let hooks = Arc::new(MemoryHooks::default());
        let server = server(hooks.clone());

        server.replace_content(context("d-1"), "offline edit").await.unwrap();

        wait_for(|| server.stats().active_documents == 0).await;
        let stored = hooks.stored.lock().clone().unwrap();
        assert_eq!(CanvasDocument::load(&stored).unwrap().content().unwrap(), "offline edit");
    }

    #[tokio::test]
    async fn test_server_edit_survives_scheduler_tick_during_load() {
        let hooks = Arc::new(MemoryHooks {
            fetch_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        *hooks.stored.lock() = Some(update_with("before"));
        let server = server(hooks.clone());

        let editor = server.clone();
        let edit = tokio::spawn(async move {
            editor.replace_content(context("d-1"), "server edit").await
        });

        // The room is mid-load, clean and without peers
        tokio::time::sleep(Duration::from_millis(10)).await;
        server.flush_due();
        assert_eq!(server.stats().active_documents, 1);

        assert!(edit.await.unwrap().unwrap());

        let (tx, _rx) = mpsc::unbounded_channel();
        let session = server.connect(context("d-1"), tx).await.unwrap();
        let joined = CanvasDocument::load(&session.state).unwrap();
        assert_eq!(joined.content().unwrap(), "server edit");
    }

    #[tokio::test]
    async fn test_connection_during_server_edit_flush_joins_same_room() {
        let hooks = Arc::new(MemoryHooks {
            store_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let server = server(hooks.clone());

        server.replace_content(context("d-1"), "pending").await.unwrap();

        // The flush is still in progress
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = server.connect(context("d-1"), tx).await.unwrap();
        let joined = CanvasDocument::load(&session.state).unwrap();
        assert_eq!(joined.content().unwrap(), "pending");

        wait_for(|| hooks.stores.lock().len() == 1).await;
        wait_for(|| server.stats().dirty_documents == 0).await;
        assert_eq!(server.stats().active_documents, 1);
        assert_eq!(hooks.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_right_after_start_still_flushes() {
        let hooks = Arc::new(MemoryHooks::default());
        let config = SyncServerConfig::default()
            .with_debounce(Duration::from_secs(60), Duration::from_secs(120));
        let server = Arc::new(SyncServer::new(hooks.clone(), config));

        let (tx, _rx) = mpsc::unbounded_channel();
        let session = server.connect(context("d-1"), tx).await.unwrap();
        server.apply_update("d-1", &session.peer_id, update_with("early")).unwrap();

        let handles = server.clone().start_background_tasks();
        server.shutdown();
        tokio::time::timeout(Duration::from_secs(5), handles.wait())
            .await
            .expect("flush task did not stop");

        assert_eq!(hooks.stores.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_peer_limit() {
        let hooks = Arc::new(MemoryHooks::default());
        let config = SyncServerConfig {
            max_peers_per_document: 1,
            ..Default::default()
        };
        let server = Arc::new(SyncServer::new(hooks, config));

        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        server.connect(context("d-1"), tx1).await.unwrap();
        let second = server.connect(context("d-1"), tx2).await;

        assert!(matches!(second, Err(SyncError::DocumentFull(_))));
    }

    #[test]
    fn test_flush_state_due_rules() {
        let config = FlushConfig {
            debounce: Duration::from_millis(100),
            max_debounce: Duration::from_millis(500),
            tick: Duration::from_millis(10),
        };
        let start = Instant::now();
        let mut state = FlushState::default();
        assert!(!state.is_due(start, &config));

        state.mark_changed(start);
        assert!(!state.is_due(start + Duration::from_millis(50), &config));
        assert!(state.is_due(start + Duration::from_millis(100), &config));

        // Continuous edits still flush once the max debounce passes
        state.mark_changed(start + Duration::from_millis(490));
        assert!(!state.is_due(start + Duration::from_millis(495), &config));
        assert!(state.is_due(start + Duration::from_millis(500), &config));

        state.failed(start + Duration::from_millis(700));
        assert!(!state.is_due(start + Duration::from_millis(600), &config));
        assert!(state.is_due(start + Duration::from_millis(700), &config));

        state.flushed(state.version, start + Duration::from_millis(700));
        assert!(!state.is_dirty());
        assert!(!state.is_due(start + Duration::from_secs(10), &config));
    }
}
