//! Chain synchronization state machine.
//!
//! `Idle → Syncing → {Complete, Failed}`; a fork notification moves any
//! state to `Forked`, which is observational only. Whether a sync is
//! running is tracked apart from the status, so a fork notification never
//! lets a second sync start. A sync queries every peer's chain status,
//! picks the highest chain, then downloads the missing range chunk by
//! chunk, falling back to the next peer when a chunk fails. Blocks a peer
//! served before failing stay applied and count towards progress. Every downloaded block is checked for linkage and hash
//! integrity and then imported through [`ChainAccess::import_block`], the
//! same path local production uses.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use atlas_core::error::SyncError;
use atlas_core::traits::ChainAccess;
use atlas_core::types::Block;
use atlas_core::validation::validate_successor;
use libp2p::PeerId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::pending::PendingRequests;
use crate::protocol::{
    BlockRequest, BlockResponse, ChainStatus, ChainStatusRequest, ChainStatusResponse,
    ForkResolution, MessageType, SyncMessage,
};
use crate::transport::{handler_fn, Transport};

/// Error text returned for a block request nothing can be served for.
pub const NO_BLOCKS_IN_RANGE: &str = "no blocks found in requested range";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Complete,
    Failed,
    Forked,
}

/// Sync lifecycle callbacks. Every method defaults to a no-op.
pub trait SyncObserver: Send + Sync {
    fn on_sync_start(&self) {}

    fn on_sync_progress(&self, _synced: u64, _total: u64) {}

    fn on_sync_complete(&self) {}

    fn on_sync_failed(&self, _error: &SyncError) {}

    fn on_fork_detected(&self, _fork: &ForkResolution) {}
}

#[derive(Debug)]
struct Progress {
    status: SyncStatus,
    started_at: Option<Instant>,
    ended_at: Option<Instant>,
    synced: u64,
    total: u64,
}

/// Drives catch-up against peers over a [`Transport`].
pub struct ChainSyncManager {
    chain: Arc<dyn ChainAccess>,
    transport: Arc<dyn Transport>,
    config: SyncConfig,
    pending: PendingRequests,
    progress: RwLock<Progress>,
    observers: RwLock<Vec<Arc<dyn SyncObserver>>>,
    last_request_nanos: AtomicI64,
    /// Set for the whole of a `start_sync` call.
    running: AtomicBool,
}

/// Clears the running flag when a sync ends, is cancelled or is dropped.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ChainSyncManager {
    pub fn new(chain: Arc<dyn ChainAccess>, transport: Arc<dyn Transport>, config: SyncConfig) -> Self {
        Self {
            chain,
            transport,
            config,
            pending: PendingRequests::new(),
            progress: RwLock::new(Progress {
                status: SyncStatus::Idle,
                started_at: None,
                ended_at: None,
                synced: 0,
                total: 0,
            }),
            observers: RwLock::new(Vec::new()),
            last_request_nanos: AtomicI64::new(0),
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn add_observer(&self, observer: Arc<dyn SyncObserver>) {
        self.observers.write().push(observer);
    }

    /// Register inbound handlers for every sync message type.
    ///
    /// Handlers hold a weak reference, so dropping the manager detaches it.
    pub fn attach(self: &Arc<Self>) {
        let kinds = [
            MessageType::ChainStatusRequest,
            MessageType::ChainStatusResponse,
            MessageType::BlockRequest,
            MessageType::BlockResponse,
            MessageType::ForkResolution,
        ];
        for kind in kinds {
            let weak: Weak<Self> = Arc::downgrade(self);
            self.transport.register_handler(
                kind,
                handler_fn(move |peer, message| {
                    let weak = weak.clone();
                    async move {
                        if let Some(manager) = weak.upgrade() {
                            manager.handle_message(peer, message).await;
                        }
                    }
                }),
            );
        }
    }

    // ------------------------------------------------------------------
    // Status queries
    // ------------------------------------------------------------------

    pub fn status(&self) -> SyncStatus {
        self.progress.read().status
    }

    /// Whether a sync is running, whatever status it currently reports.
    pub fn is_syncing(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// `(synced, total)` blocks of the current or last sync.
    pub fn sync_progress(&self) -> (u64, u64) {
        let p = self.progress.read();
        (p.synced, p.total)
    }

    /// Zero when idle; elapsed time while syncing; total time once ended.
    pub fn sync_duration(&self) -> Duration {
        let p = self.progress.read();
        match (p.started_at, p.ended_at) {
            (None, _) => Duration::ZERO,
            (Some(start), None) => start.elapsed(),
            (Some(start), Some(end)) => end.saturating_duration_since(start),
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// This node's chain status, as served to peers.
    pub fn local_status(&self) -> ChainStatus {
        let height = self.chain.height();
        ChainStatus {
            height,
            latest_hash: self.chain.latest_block().hash,
            genesis_hash: self.chain.genesis_hash(),
            total_blocks: height + 1,
            is_syncing: self.is_syncing(),
            peer_id: self.transport.local_peer_id().to_string(),
        }
    }

    // ------------------------------------------------------------------
    // Sync driver
    // ------------------------------------------------------------------

    /// Run one sync to completion.
    ///
    /// # Errors
    ///
    /// [`SyncError::AlreadySyncing`] if a sync is running. Any other error
    /// leaves the manager in [`SyncStatus::Failed`].
    pub async fn start_sync(&self, cancel: &CancellationToken) -> Result<(), SyncError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SyncError::AlreadySyncing);
        }
        let _running = RunningGuard(&self.running);
        {
            let mut p = self.progress.write();
            p.status = SyncStatus::Syncing;
            p.started_at = Some(Instant::now());
            p.ended_at = None;
            p.synced = 0;
            p.total = 0;
        }
        info!(height = self.chain.height(), "starting chain sync");
        self.notify(|o| o.on_sync_start());

        match self.run_sync(cancel).await {
            Ok(()) => {
                self.finish(SyncStatus::Complete);
                self.notify(|o| o.on_sync_complete());
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "chain sync failed");
                self.finish(SyncStatus::Failed);
                self.notify(|o| o.on_sync_failed(&e));
                Err(e)
            }
        }
    }

    async fn run_sync(&self, cancel: &CancellationToken) -> Result<(), SyncError> {
        let peers = self.transport.peers();
        if peers.is_empty() {
            return Err(SyncError::NoPeers);
        }

        let mut statuses: Vec<(PeerId, ChainStatus)> = Vec::with_capacity(peers.len());
        for peer in peers {
            match self.request_chain_status(peer, cancel).await {
                Ok(status) => statuses.push((peer, status)),
                Err(e @ SyncError::Cancelled(_)) => return Err(e),
                Err(e) => warn!(%peer, error = %e, "chain status request failed"),
            }
        }

        // First peer wins ties.
        let mut best: Option<&(PeerId, ChainStatus)> = None;
        for entry in &statuses {
            if best.is_none_or(|b| entry.1.height > b.1.height) {
                best = Some(entry);
            }
        }
        let Some((best_peer, target)) = best.cloned() else {
            return Err(SyncError::NoPeers);
        };

        let local = self.chain.height();
        info!(peer = %best_peer, target = target.height, local, "highest chain selected");
        if local >= target.height {
            info!(local, network = target.height, "already up to date");
            return Ok(());
        }

        // The best peer first, then the rest in status order.
        let mut order = vec![best_peer];
        order.extend(statuses.iter().map(|(p, _)| *p).filter(|p| *p != best_peer));
        self.download(local + 1, target.height, &order, cancel).await
    }

    async fn download(
        &self,
        from: u64,
        to: u64,
        peers: &[PeerId],
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        self.progress.write().total = to - from + 1;
        info!(from, to, "downloading blocks");

        let chunk = self.config.chunk_size.max(1);
        let mut peer_idx = 0;
        // Failed attempts since the chain last advanced.
        let mut attempts = 0;
        while self.chain.height() < to {
            let start = self.chain.height() + 1;
            let end = (start + chunk - 1).min(to);
            if attempts >= peers.len() {
                return Err(SyncError::AllPeersFailed { from: start, to: end });
            }

            let peer = peers[peer_idx % peers.len()];
            let (applied, result) = self.download_chunk(peer, start, end, cancel).await;
            if applied > 0 {
                self.record_progress(applied);
                attempts = 0;
            }
            match result {
                Ok(()) if applied > 0 => continue,
                Ok(()) => warn!(%peer, start, end, "peer served no new blocks"),
                Err(e @ SyncError::Cancelled(_)) => return Err(e),
                Err(e) => warn!(%peer, start, end, applied, error = %e, "chunk download failed"),
            }
            attempts += 1;
            peer_idx += 1;
        }
        Ok(())
    }

    fn record_progress(&self, applied: u64) {
        let (synced, total) = {
            let mut p = self.progress.write();
            p.synced += applied;
            (p.synced, p.total)
        };
        info!(synced, total, "sync progress");
        self.notify(|o| o.on_sync_progress(synced, total));
    }

    /// Fetch and import one chunk. Returns how many blocks were applied,
    /// along with the error that stopped the chunk early, if any.
    ///
    /// Blocks applied before a failing block stay applied.
    async fn download_chunk(
        &self,
        peer: PeerId,
        from: u64,
        to: u64,
        cancel: &CancellationToken,
    ) -> (u64, Result<(), SyncError>) {
        let (request_id, blocks) = match self.fetch_blocks(peer, from, to, cancel).await {
            Ok(fetched) => fetched,
            Err(e) => return (0, Err(e)),
        };

        let mut applied = 0;
        for block in blocks {
            if cancel.is_cancelled() {
                return (applied, Err(SyncError::Cancelled(request_id)));
            }
            let index = block.index;
            let tip = self.chain.latest_block();
            let imported = validate_successor(&block, &tip)
                .map_err(|source| SyncError::Validation { index, source })
                .and_then(|()| {
                    self.chain
                        .import_block(block)
                        .map_err(|e| SyncError::Import(e.to_string()))
                });
            if let Err(e) = imported {
                return (applied, Err(e));
            }
            debug!(index, "synced block imported");
            applied += 1;
        }
        (applied, Ok(()))
    }

    async fn fetch_blocks(
        &self,
        peer: PeerId,
        from: u64,
        to: u64,
        cancel: &CancellationToken,
    ) -> Result<(String, Vec<Block>), SyncError> {
        let request_id = format!("blocks_{from}_{to}_{}", self.next_nanos());
        let message = SyncMessage::BlockRequest(BlockRequest {
            from_index: from,
            to_index: to,
            request_id: request_id.clone(),
        });
        debug!(%peer, from, to, request = %request_id, "requesting blocks");
        let reply = self
            .request(peer, request_id.clone(), message, self.config.block_request_timeout(), cancel)
            .await?;
        let response = match reply {
            SyncMessage::BlockResponse(r) => r,
            _ => return Err(SyncError::UnexpectedResponse(request_id)),
        };
        if let Some(error) = response.error {
            return Err(SyncError::Peer(error));
        }
        Ok((request_id, response.blocks))
    }

    async fn request_chain_status(
        &self,
        peer: PeerId,
        cancel: &CancellationToken,
    ) -> Result<ChainStatus, SyncError> {
        let request_id = format!("status_{}", self.next_nanos());
        let message = SyncMessage::ChainStatusRequest(ChainStatusRequest {
            request_id: request_id.clone(),
        });
        match self
            .request(peer, request_id.clone(), message, self.config.status_timeout(), cancel)
            .await?
        {
            SyncMessage::ChainStatusResponse(r) => {
                debug!(%peer, height = r.status.height, "chain status received");
                Ok(r.status)
            }
            _ => Err(SyncError::UnexpectedResponse(request_id)),
        }
    }

    /// Send `message` and wait for the correlated reply, a timeout or
    /// cancellation.
    async fn request(
        &self,
        peer: PeerId,
        request_id: String,
        message: SyncMessage,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<SyncMessage, SyncError> {
        let rx = self
            .pending
            .register(request_id.clone(), message.message_type(), peer, timeout);
        if let Err(e) = self.transport.send(peer, message).await {
            self.pending.resolve(&request_id, Err(e.clone().into()));
            return Err(e.into());
        }

        tokio::select! {
            reply = rx => reply.unwrap_or_else(|_| Err(SyncError::Cancelled(request_id))),
            _ = tokio::time::sleep(timeout) => {
                self.pending.resolve(&request_id, Err(SyncError::Timeout(request_id.clone())));
                Err(SyncError::Timeout(request_id))
            }
            _ = cancel.cancelled() => {
                self.pending.resolve(&request_id, Err(SyncError::Cancelled(request_id.clone())));
                Err(SyncError::Cancelled(request_id))
            }
        }
    }

    // ------------------------------------------------------------------
    // Periodic work
    // ------------------------------------------------------------------

    /// Purge expired pending requests. Returns how many were purged.
    pub fn sweep_expired(&self) -> usize {
        let purged = self.pending.purge_expired(Instant::now());
        if purged > 0 {
            debug!(purged, "expired sync requests purged");
        }
        purged
    }

    /// Start a sync unless one is running. Returns whether one ran.
    pub async fn poll(&self, cancel: &CancellationToken) -> bool {
        if self.is_syncing() {
            return false;
        }
        if self.transport.peers().is_empty() {
            return false;
        }
        // Failures are logged and reported to observers by start_sync.
        let _ = self.start_sync(cancel).await;
        true
    }

    /// Send a fork notification to every peer.
    pub async fn announce_fork(&self, fork: ForkResolution) {
        for peer in self.transport.peers() {
            if let Err(e) = self
                .transport
                .send(peer, SyncMessage::ForkResolution(fork.clone()))
                .await
            {
                warn!(%peer, error = %e, "failed to send fork notification");
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Dispatch one inbound message.
    pub async fn handle_message(&self, peer: PeerId, message: SyncMessage) {
        match message {
            SyncMessage::ChainStatusRequest(req) => {
                let response = SyncMessage::ChainStatusResponse(ChainStatusResponse {
                    status: self.local_status(),
                    request_id: req.request_id,
                });
                self.reply(peer, response).await;
            }
            SyncMessage::BlockRequest(req) => {
                let response = SyncMessage::BlockResponse(self.serve_blocks(&req));
                self.reply(peer, response).await;
            }
            reply @ (SyncMessage::ChainStatusResponse(_) | SyncMessage::BlockResponse(_)) => {
                let id = reply.request_id().unwrap_or_default().to_string();
                if !self.pending.resolve(&id, Ok(reply)) {
                    debug!(%peer, request = %id, "no pending request for response");
                }
            }
            SyncMessage::ForkResolution(fork) => {
                info!(
                    %peer,
                    fork_height = fork.fork_height,
                    reason = %fork.reason,
                    "fork detected"
                );
                self.set_status(SyncStatus::Forked);
                self.notify(|o| o.on_fork_detected(&fork));
            }
        }
    }

    /// Build the response to a block request, capped at
    /// `max_blocks_per_response` blocks.
    pub fn serve_blocks(&self, req: &BlockRequest) -> BlockResponse {
        let cap = self.config.max_blocks_per_response.max(1);
        let to = req
            .to_index
            .min(req.from_index.saturating_add(cap - 1));
        let blocks: Vec<_> = if req.from_index > to {
            Vec::new()
        } else {
            (req.from_index..=to)
                .map_while(|i| self.chain.block_by_index(i))
                .collect()
        };
        let error = blocks.is_empty().then(|| NO_BLOCKS_IN_RANGE.to_string());
        debug!(from = req.from_index, to = req.to_index, served = blocks.len(), "serving blocks");
        BlockResponse {
            blocks,
            request_id: req.request_id.clone(),
            error,
        }
    }

    async fn reply(&self, peer: PeerId, message: SyncMessage) {
        if let Err(e) = self.transport.send(peer, message).await {
            warn!(%peer, error = %e, "failed to send sync response");
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn set_status(&self, status: SyncStatus) {
        let previous = std::mem::replace(&mut self.progress.write().status, status);
        if previous != status {
            info!(from = ?previous, to = ?status, "sync status changed");
        }
    }

    fn finish(&self, status: SyncStatus) {
        self.progress.write().ended_at = Some(Instant::now());
        self.set_status(status);
    }

    fn notify(&self, f: impl Fn(&dyn SyncObserver)) {
        let observers = self.observers.read().clone();
        for o in &observers {
            f(o.as_ref());
        }
    }

    /// Wall-clock nanoseconds, bumped so that no two request IDs collide.
    fn next_nanos(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let mut last = self.last_request_nanos.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match self.last_request_nanos.compare_exchange(
                last,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use atlas_core::chain_state::{ChainStore, MemoryChainStore};
    use atlas_core::constants::GENESIS_TIMESTAMP;
    use atlas_core::error::AtlasError;
    use atlas_core::genesis::genesis_block;
    use atlas_core::error::BlockError;
    use atlas_core::types::Hash256;
    use parking_lot::Mutex;

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// A chain that imports anything linking to its tip, except the block
    /// at `reject`.
    struct TestChain {
        store: RwLock<MemoryChainStore>,
        reject: Option<u64>,
    }

    impl TestChain {
        fn from_store(store: MemoryChainStore) -> Arc<Self> {
            Arc::new(Self {
                store: RwLock::new(store),
                reject: None,
            })
        }

        fn with_height(height: u64) -> Arc<Self> {
            let mut store = MemoryChainStore::new();
            for _ in 0..height {
                let next = make_child(store.tip());
                store.append(next).unwrap();
            }
            Self::from_store(store)
        }

        fn rejecting(index: u64) -> Arc<Self> {
            Arc::new(Self {
                store: RwLock::new(MemoryChainStore::new()),
                reject: Some(index),
            })
        }
    }

    impl ChainAccess for TestChain {
        fn height(&self) -> u64 {
            self.store.read().height()
        }

        fn latest_block(&self) -> Block {
            self.store.read().tip().clone()
        }

        fn block_by_index(&self, index: u64) -> Option<Block> {
            self.store.read().get_by_index(index).cloned()
        }

        fn block_by_hash(&self, hash: &Hash256) -> Option<Block> {
            self.store.read().get_by_hash(hash).cloned()
        }

        fn genesis_hash(&self) -> Hash256 {
            self.store.read().get_by_index(0).map(|b| b.hash).unwrap_or_default()
        }

        fn import_block(&self, block: Block) -> Result<(), AtlasError> {
            if self.reject == Some(block.index) {
                return Err(BlockError::InvalidSignature.into());
            }
            self.store.write().append(block).map_err(AtlasError::from)
        }
    }

    fn make_child(parent: &Block) -> Block {
        Block {
            index: parent.index + 1,
            timestamp: parent.timestamp + 30,
            transactions: vec![],
            prev_hash: parent.hash,
            validator: "0x1111111111111111111111111111111111111111".into(),
            validator_key: vec![],
            signature: vec![1],
            hash: Hash256::ZERO,
        }
        .seal()
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            chunk_size: 4,
            status_timeout_secs: 1,
            block_request_timeout_secs: 1,
            ..SyncConfig::default()
        }
    }

    fn node(net: &MemoryNetwork, chain: Arc<TestChain>) -> Arc<ChainSyncManager> {
        let mgr = Arc::new(ChainSyncManager::new(chain, net.join(), fast_config()));
        mgr.attach();
        mgr
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl SyncObserver for Recorder {
        fn on_sync_start(&self) {
            self.events.lock().push("start".into());
        }

        fn on_sync_progress(&self, synced: u64, total: u64) {
            self.events.lock().push(format!("progress {synced}/{total}"));
        }

        fn on_sync_complete(&self) {
            self.events.lock().push("complete".into());
        }

        fn on_sync_failed(&self, _error: &SyncError) {
            self.events.lock().push("failed".into());
        }

        fn on_fork_detected(&self, fork: &ForkResolution) {
            self.events.lock().push(format!("fork {}", fork.fork_height));
        }
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn no_peers_fails_immediately() {
        let net = MemoryNetwork::new();
        let local = node(&net, TestChain::with_height(0));
        let err = local.start_sync(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err, SyncError::NoPeers);
        assert_eq!(local.status(), SyncStatus::Failed);
    }

    #[tokio::test]
    async fn catches_up_to_highest_peer() {
        let net = MemoryNetwork::new();
        let chain = TestChain::with_height(5);
        let local = node(&net, chain.clone());
        let _a = node(&net, TestChain::with_height(10));
        let _b = node(&net, TestChain::with_height(15));
        let recorder = Arc::new(Recorder::default());
        local.add_observer(recorder.clone());

        local.start_sync(&CancellationToken::new()).await.unwrap();

        assert_eq!(chain.height(), 15);
        assert_eq!(local.status(), SyncStatus::Complete);
        assert_eq!(local.sync_progress(), (10, 10));
        assert_eq!(local.pending_requests(), 0);
        let events = recorder.events.lock().clone();
        assert_eq!(events.first().map(String::as_str), Some("start"));
        assert_eq!(events.last().map(String::as_str), Some("complete"));
        // chunk size 4: 6..=9, 10..=13, 14..=15
        assert_eq!(events.iter().filter(|e| e.starts_with("progress")).count(), 3);
    }

    #[tokio::test]
    async fn up_to_date_completes_without_download() {
        let net = MemoryNetwork::new();
        let local = node(&net, TestChain::with_height(8));
        let _peer = node(&net, TestChain::with_height(3));
        local.start_sync(&CancellationToken::new()).await.unwrap();
        assert_eq!(local.status(), SyncStatus::Complete);
        assert_eq!(local.sync_progress(), (0, 0));
    }

    #[tokio::test]
    async fn silent_peer_times_out_and_sync_fails() {
        let net = MemoryNetwork::new();
        let local = node(&net, TestChain::with_height(0));
        let peer = node(&net, TestChain::with_height(4));
        net.set_muted(&peer.transport.local_peer_id(), true);
        let err = local.start_sync(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err, SyncError::NoPeers);
        assert_eq!(local.status(), SyncStatus::Failed);
        assert_eq!(local.pending_requests(), 0);
    }

    #[tokio::test]
    async fn forged_chain_is_rejected() {
        let net = MemoryNetwork::new();
        let chain = TestChain::with_height(0);
        let local = node(&net, chain.clone());
        // Peer with a different genesis: its block 1 does not link to our tip.
        let mut other = MemoryChainStore::with_genesis(
            Block {
                timestamp: GENESIS_TIMESTAMP + 1,
                ..genesis_block()
            }
            .seal(),
        );
        for _ in 0..3 {
            let next = make_child(other.tip());
            other.append(next).unwrap();
        }
        let _peer = node(&net, TestChain::from_store(other));

        let err = local.start_sync(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err, SyncError::AllPeersFailed { from: 1, to: 3 });
        assert_eq!(chain.height(), 0);
    }

    #[tokio::test]
    async fn partial_chunk_keeps_applied_blocks() {
        let net = MemoryNetwork::new();
        let chain = TestChain::rejecting(3);
        let local = node(&net, chain.clone());
        let _peer = node(&net, TestChain::with_height(6));
        let recorder = Arc::new(Recorder::default());
        local.add_observer(recorder.clone());

        let err = local.start_sync(&CancellationToken::new()).await.unwrap_err();

        assert_eq!(err, SyncError::AllPeersFailed { from: 3, to: 6 });
        assert_eq!(chain.height(), 2);
        assert_eq!(local.sync_progress(), (2, 6));
        assert_eq!(
            recorder.events.lock().clone(),
            vec!["start", "progress 2/6", "failed"]
        );
    }

    #[tokio::test]
    async fn concurrent_start_is_rejected() {
        let net = MemoryNetwork::new();
        let local = node(&net, TestChain::with_height(0));
        local.running.store(true, Ordering::Release);
        assert_eq!(
            local.start_sync(&CancellationToken::new()).await,
            Err(SyncError::AlreadySyncing)
        );
        assert!(!local.poll(&CancellationToken::new()).await);
        assert!(local.local_status().is_syncing);
    }

    #[tokio::test]
    async fn fork_notice_mid_sync_does_not_admit_second_sync() {
        let net = MemoryNetwork::new();
        let local = node(&net, TestChain::with_height(0));
        let peer = node(&net, TestChain::with_height(4));
        net.set_muted(&peer.transport.local_peer_id(), true);

        let cancel = CancellationToken::new();
        let running = {
            let local = local.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { local.start_sync(&cancel).await })
        };
        while local.status() != SyncStatus::Syncing {
            tokio::task::yield_now().await;
        }

        local
            .handle_message(
                PeerId::random(),
                SyncMessage::ForkResolution(ForkResolution {
                    fork_height: 2,
                    canonical_chain_hashes: vec![],
                    forked_chain_hashes: vec![],
                    reason: "heavier chain".into(),
                }),
            )
            .await;
        assert_eq!(local.status(), SyncStatus::Forked);
        assert!(local.is_syncing());
        assert_eq!(
            local.start_sync(&CancellationToken::new()).await,
            Err(SyncError::AlreadySyncing)
        );
        assert!(!local.poll(&CancellationToken::new()).await);

        cancel.cancel();
        assert!(matches!(running.await.unwrap(), Err(SyncError::Cancelled(_))));
        assert!(!local.is_syncing());
    }

    #[tokio::test]
    async fn cancelled_sync_fails() {
        let net = MemoryNetwork::new();
        let local = node(&net, TestChain::with_height(0));
        let peer = node(&net, TestChain::with_height(4));
        net.set_muted(&peer.transport.local_peer_id(), true);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = local.start_sync(&cancel).await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled(ref id) if id.starts_with("status_")));
        assert_eq!(local.status(), SyncStatus::Failed);
    }

    // ------------------------------------------------------------------
    // Serving and inbound
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn serve_blocks_caps_and_reports_empty_range() {
        let net = MemoryNetwork::new();
        let mgr = Arc::new(ChainSyncManager::new(
            TestChain::with_height(10),
            net.join(),
            SyncConfig {
                max_blocks_per_response: 3,
                ..SyncConfig::default()
            },
        ));
        let served = mgr.serve_blocks(&BlockRequest {
            from_index: 2,
            to_index: 9,
            request_id: "r".into(),
        });
        assert_eq!(
            served.blocks.iter().map(|b| b.index).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
        assert!(served.error.is_none());

        let empty = mgr.serve_blocks(&BlockRequest {
            from_index: 50,
            to_index: 60,
            request_id: "r".into(),
        });
        assert!(empty.blocks.is_empty());
        assert_eq!(empty.error.as_deref(), Some(NO_BLOCKS_IN_RANGE));
    }

    #[tokio::test]
    async fn fork_notification_sets_forked() {
        let net = MemoryNetwork::new();
        let local = node(&net, TestChain::with_height(0));
        let recorder = Arc::new(Recorder::default());
        local.add_observer(recorder.clone());
        local
            .handle_message(
                PeerId::random(),
                SyncMessage::ForkResolution(ForkResolution {
                    fork_height: 7,
                    canonical_chain_hashes: vec![Hash256([1; 32])],
                    forked_chain_hashes: vec![Hash256([2; 32])],
                    reason: "heavier chain".into(),
                }),
            )
            .await;
        assert_eq!(local.status(), SyncStatus::Forked);
        assert_eq!(recorder.events.lock().clone(), vec!["fork 7".to_string()]);
    }

    #[tokio::test]
    async fn duration_is_zero_when_idle() {
        let net = MemoryNetwork::new();
        let local = node(&net, TestChain::with_height(0));
        assert_eq!(local.sync_duration(), Duration::ZERO);
        assert_eq!(local.sync_progress(), (0, 0));
    }

    #[test]
    fn request_nanos_are_unique() {
        let net = MemoryNetwork::new();
        let mgr = ChainSyncManager::new(TestChain::with_height(0), net.join(), SyncConfig::default());
        let a = mgr.next_nanos();
        let b = mgr.next_nanos();
        assert!(b > a);
    }

    #[test]
    fn local_status_reflects_chain() {
        let net = MemoryNetwork::new();
        let chain = TestChain::with_height(3);
        let mgr = ChainSyncManager::new(chain.clone(), net.join(), SyncConfig::default());
        let status = mgr.local_status();
        assert_eq!(status.height, 3);
        assert_eq!(status.total_blocks, 4);
        assert_eq!(status.latest_hash, chain.latest_block().hash);
        assert!(!status.is_syncing);
    }
}
