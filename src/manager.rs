use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::config::ManagerConfig;
use crate::error::{client_restoration_failure, invalid_state, TransferError, TransferResult};
use crate::model::{
    BlobTransfer, BlockTransfer, Direction, NewTransfer, TransferId, TransferRecord, TransferState,
};
use crate::protocol::{download, upload, Decomposition};
use crate::queue::WorkQueue;
use crate::reachability::ReachabilityMonitor;
use crate::state::{derive_parent_state, transition, TransferEvent};
use crate::store::PersistentStore;
use crate::transport::ReqwestTransport;

/// Notified of transfer lifecycle events (spec §4.6). Every method has a default no-op
/// implementation so callers only override what they need.
pub trait TransferDelegate: Send + Sync {
    fn on_state_changed(&self, _transfer_id: &str, _state: TransferState) {}
    fn on_progress(&self, _transfer_id: &str, _completed_blocks: u32, _total_blocks: u32) {}
    fn on_error(&self, _transfer_id: &str, _error: &TransferError) {}

    /// Asked to re-obtain a live HTTP client for a transfer whose `client_restoration_id` the
    /// manager doesn't currently hold a transport for — typically a transfer hydrated from the
    /// store after a restart (spec §6: `client(forRestorationId) -> HTTPClient?`). The default
    /// implementation never restores one, so a delegate-less manager always treats every
    /// hydrated transfer's client as unrestorable.
    fn client_for_restoration(&self, _restoration_id: &str) -> Option<Arc<ReqwestTransport>> {
        None
    }
}

struct ActiveTransfer {
    blob: BlobTransfer,
    blocks: HashMap<TransferId, BlockTransfer>,
    queue: Option<Arc<WorkQueue>>,
}

struct ManagerState {
    transfers: HashMap<TransferId, ActiveTransfer>,
    network_paused: HashSet<TransferId>,
}

/// Facade over the persistent store, transport, and work queues for every tracked blob
/// transfer (spec §4: add/pause/resume/cancel/remove plus their `*_all` counterparts).
///
/// Mirrors the teacher's `FirebaseStorageImpl`: an explicitly constructed struct wrapping
/// shared mutable state behind a mutex, with no global singleton.
pub struct TransferManager {
    config: ManagerConfig,
    store: Arc<dyn PersistentStore>,
    transport: Arc<ReqwestTransport>,
    reachability: Arc<dyn ReachabilityMonitor>,
    delegate: Mutex<Option<Arc<dyn TransferDelegate>>>,
    state: Arc<Mutex<ManagerState>>,
    /// Transports known to be live for a given `client_restoration_id` (spec §4.5: "if the
    /// originating HTTP client is not currently live, the manager asks the delegate for one").
    /// Populated eagerly for every transfer added in this process; transfers hydrated from the
    /// store at construction are absent until restored on demand.
    live_clients: Mutex<HashMap<TransferId, Arc<ReqwestTransport>>>,
}

impl TransferManager {
    /// Builds a manager and hydrates it from `store`. Any root transfer found `InProgress` is
    /// demoted to `Paused`: no work queue survives a restart, so resuming it is an explicit act
    /// the caller takes via [`TransferManager::resume`] or [`TransferManager::resume_all`].
    pub async fn new(
        store: Arc<dyn PersistentStore>,
        transport: Arc<ReqwestTransport>,
        reachability: Arc<dyn ReachabilityMonitor>,
        config: ManagerConfig,
    ) -> TransferResult<Arc<Self>> {
        let mut transfers = HashMap::new();

        for record in store.fetch_roots().await? {
            let Some(mut blob) = record.as_blob().cloned() else {
                continue;
            };
            if blob.state == TransferState::InProgress {
                blob.state = TransferState::Paused;
                blob.touch();
                store.update(TransferRecord::Blob(blob.clone())).await?;
            }

            let mut blocks = HashMap::new();
            for child in store.fetch_children(&blob.id).await? {
                if let Some(block) = child.as_block() {
                    blocks.insert(block.id.clone(), block.clone());
                }
            }

            transfers.insert(
                blob.id.clone(),
                ActiveTransfer {
                    blob,
                    blocks,
                    queue: None,
                },
            );
        }

        let manager = Arc::new(Self {
            config,
            store,
            transport,
            reachability,
            delegate: Mutex::new(None),
            state: Arc::new(Mutex::new(ManagerState {
                transfers,
                network_paused: HashSet::new(),
            })),
            live_clients: Mutex::new(HashMap::new()),
        });

        manager.watch_reachability();
        Ok(manager)
    }

    pub async fn set_delegate(&self, delegate: Arc<dyn TransferDelegate>) {
        *self.delegate.lock().await = Some(delegate);
    }

    fn watch_reachability(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        self.reachability.subscribe(Arc::new(move |reachable| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                if reachable {
                    manager.on_network_restored().await;
                } else {
                    manager.on_network_lost().await;
                }
            });
        }));
    }

    async fn on_network_lost(&self) {
        warn!("network unreachable, pausing in-progress transfers");
        let ids: Vec<TransferId> = {
            let state = self.state.lock().await;
            state
                .transfers
                .values()
                .filter(|t| t.blob.state == TransferState::InProgress)
                .map(|t| t.blob.id.clone())
                .collect()
        };
        for id in ids {
            if self.pause_internal(&id).await.is_ok() {
                self.state.lock().await.network_paused.insert(id);
            }
        }
    }

    async fn on_network_restored(&self) {
        info!("network reachable again, resuming auto-paused transfers");
        let ids: Vec<TransferId> = {
            let mut state = self.state.lock().await;
            state.network_paused.drain().collect()
        };
        for id in ids {
            if let Err(err) = self.resume(&id).await {
                warn!("failed to auto-resume transfer {id}: {err}");
            }
        }
    }

    /// Registers a new blob transfer, persists it, decomposes it into block transfers, and
    /// begins running it immediately (spec §4.6).
    pub async fn add(self: &Arc<Self>, new: NewTransfer) -> TransferResult<TransferId> {
        let blob = BlobTransfer::new(
            new.direction,
            new.source,
            new.destination,
            new.client_restoration_id,
            new.properties,
        );
        let id = blob.id.clone();

        self.store.insert(TransferRecord::Blob(blob.clone())).await?;
        self.live_clients
            .lock()
            .await
            .insert(blob.client_restoration_id.clone(), Arc::clone(&self.transport));
        self.state.lock().await.transfers.insert(
            id.clone(),
            ActiveTransfer {
                blob,
                blocks: HashMap::new(),
                queue: None,
            },
        );

        self.start(&id).await?;
        Ok(id)
    }

    /// Resolves the live HTTP client for `restoration_id`, asking the delegate to restore one
    /// if this process hasn't seen it live yet (spec §4.5/§6). Caches a restored client so
    /// subsequent calls for the same restoration id don't re-ask the delegate.
    async fn transport_for(&self, restoration_id: &str) -> TransferResult<Arc<ReqwestTransport>> {
        if let Some(transport) = self.live_clients.lock().await.get(restoration_id) {
            return Ok(Arc::clone(transport));
        }

        let delegate = self.delegate.lock().await.clone();
        let restored = delegate.and_then(|d| d.client_for_restoration(restoration_id));
        match restored {
            Some(transport) => {
                self.live_clients
                    .lock()
                    .await
                    .insert(restoration_id.to_string(), Arc::clone(&transport));
                Ok(transport)
            }
            None => Err(client_restoration_failure(restoration_id)),
        }
    }

    /// Decomposes and schedules `id`. A failure here (decomposition, client restoration,
    /// persistence) doesn't abort the caller's command — spec §7 treats `DecompositionFailure`
    /// and `ClientRestorationFailure` as transfer-level outcomes: the transfer moves to
    /// `Failed` with its error recorded and the delegate notified, and the command itself still
    /// reports success.
    async fn start(self: &Arc<Self>, id: &str) -> TransferResult<()> {
        match self.try_start(id).await {
            Ok(()) => Ok(()),
            Err(err) => self.force_fail(id, &err).await,
        }
    }

    async fn try_start(self: &Arc<Self>, id: &str) -> TransferResult<()> {
        let decomposition = self.decompose(id).await?;
        self.persist_blocks(id, &decomposition.blocks).await?;
        self.set_state(id, TransferEvent::Start).await?;
        self.schedule(id, decomposition).await
    }

    /// Forces a transfer straight to `Failed`, bypassing the event transition table: this path
    /// is reached when decomposition or client restoration fails before the transfer has ever
    /// reached `InProgress`, so no `(state, event)` pair in §4.4's table applies yet (the table
    /// only names `UnitFailed` from `InProgress`). Idempotent: a transfer already terminal is
    /// left alone.
    async fn force_fail(&self, id: &str, error: &TransferError) -> TransferResult<()> {
        if let Err(store_err) = self.record_error(id, error).await {
            warn!("failed to persist error for transfer {id}: {store_err}");
        }
        self.notify_error(id, error).await;

        let updated = {
            let mut state = self.state.lock().await;
            let Some(transfer) = state.transfers.get_mut(id) else {
                return Ok(());
            };
            if transfer.blob.state.is_terminal() {
                return Ok(());
            }
            transfer.queue.take();
            transfer.blob.state = TransferState::Failed;
            transfer.blob.touch();
            transfer.blob.clone()
        };
        self.store.update(TransferRecord::Blob(updated.clone())).await?;
        debug!("transfer {id} -> Failed ({error})");
        if let Some(delegate) = self.delegate.lock().await.clone() {
            delegate.on_state_changed(id, updated.state);
        }
        Ok(())
    }

    async fn decompose(&self, id: &str) -> TransferResult<Decomposition> {
        let (direction, blob) = {
            let state = self.state.lock().await;
            let transfer = state
                .transfers
                .get(id)
                .ok_or_else(|| invalid_state(format!("unknown transfer '{id}'")))?;
            (transfer.blob.direction, transfer.blob.clone())
        };

        let transport = self.transport_for(&blob.client_restoration_id).await?;

        match direction {
            Direction::Upload => upload::decompose(&blob, self.config.chunk_size, transport).await,
            Direction::Download => {
                download::decompose(&blob, self.config.chunk_size, transport).await
            }
        }
    }

    /// Persists newly discovered blocks and marks the owning blob's decomposition as done
    /// (spec §3: `initialCallComplete`, true "once the initial probe (download) or create
    /// (upload) has succeeded"; spec §4.5 keys resume's re-probe decision on this flag).
    async fn persist_blocks(&self, id: &str, blocks: &[BlockTransfer]) -> TransferResult<()> {
        for block in blocks {
            self.store.insert(TransferRecord::Block(block.clone())).await?;
        }
        let updated_blob = {
            let mut state = self.state.lock().await;
            let Some(transfer) = state.transfers.get_mut(id) else {
                return Ok(());
            };
            transfer.blob.total_blocks = blocks.len() as u32;
            transfer.blob.initial_call_complete = true;
            transfer.blob.touch();
            for block in blocks {
                transfer.blocks.insert(block.id.clone(), block.clone());
            }
            transfer.blob.clone()
        };
        self.store.update(TransferRecord::Blob(updated_blob)).await
    }

    async fn schedule(self: &Arc<Self>, id: &str, decomposition: Decomposition) -> TransferResult<()> {
        let manager = Arc::clone(self);
        let transfer_id = id.to_string();
        let queue = Arc::new(WorkQueue::new(
            self.config.max_concurrent,
            Arc::new(move |unit_id, result| {
                let manager = Arc::clone(&manager);
                let unit_id = unit_id.to_string();
                let transfer_id = transfer_id.clone();
                tokio::spawn(async move {
                    manager.on_unit_complete(&transfer_id, &unit_id, result).await;
                });
            }),
        ));

        // Blocks already `Complete` (a resumed transfer's finished children) were filtered out
        // of `decomposition.units` entirely — seed the queue's completed set directly so the
        // finalize unit's dependency on them is satisfied instead of waiting forever on units
        // that will never run (spec §4.2/§4.5 resume semantics; spec §8 crash-safety scenario 5).
        let already_complete: Vec<TransferId> = {
            let state = self.state.lock().await;
            state
                .transfers
                .get(id)
                .map(|t| {
                    t.blocks
                        .values()
                        .filter(|b| b.state == TransferState::Complete)
                        .map(|b| b.id.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        for block_id in already_complete {
            queue.mark_completed(block_id).await;
        }

        for unit in decomposition.units {
            queue.add(unit).await;
        }
        {
            let mut state = self.state.lock().await;
            if let Some(transfer) = state.transfers.get_mut(id) {
                transfer.queue = Some(Arc::clone(&queue));
            }
        }
        queue.drain_ready().await;
        Ok(())
    }

    async fn on_unit_complete(&self, transfer_id: &str, unit_id: &str, result: TransferResult<()>) {
        let is_finalize = unit_id.ends_with("-finalize");

        if !is_finalize {
            let new_block_state = if result.is_ok() {
                TransferState::Complete
            } else {
                TransferState::Failed
            };
            if let Err(err) = self.apply_block_result(transfer_id, unit_id, new_block_state).await {
                warn!("failed to persist block {unit_id}: {err}");
            }
        }

        if let Err(ref err) = result {
            if let Err(store_err) = self.record_error(transfer_id, err).await {
                warn!("failed to persist error for transfer {transfer_id}: {store_err}");
            }
            self.notify_error(transfer_id, err).await;
        }

        if is_finalize {
            let outcome = if result.is_ok() {
                TransferEvent::AllUnitsSucceeded
            } else {
                TransferEvent::UnitFailed
            };
            if let Err(err) = self.set_state(transfer_id, outcome).await {
                warn!("failed to finalize transfer {transfer_id}: {err}");
            }
            return;
        }

        if result.is_err() {
            if let Err(err) = self.set_state(transfer_id, TransferEvent::UnitFailed).await {
                warn!("failed to mark transfer {transfer_id} failed: {err}");
            }
            return;
        }

        self.notify_progress(transfer_id).await;

        if let Some(queue) = self.queue_for(transfer_id).await {
            queue.drain_ready().await;
        }
    }

    async fn apply_block_result(
        &self,
        transfer_id: &str,
        block_id: &str,
        new_state: TransferState,
    ) -> TransferResult<()> {
        let updated = {
            let mut state = self.state.lock().await;
            let transfer = state
                .transfers
                .get_mut(transfer_id)
                .ok_or_else(|| invalid_state(format!("unknown transfer '{transfer_id}'")))?;
            let block = transfer
                .blocks
                .get_mut(block_id)
                .ok_or_else(|| invalid_state(format!("unknown block '{block_id}'")))?;
            block.state = new_state;
            block.touch();
            block.clone()
        };
        self.store.update(TransferRecord::Block(updated)).await
    }

    async fn queue_for(&self, id: &str) -> Option<Arc<WorkQueue>> {
        self.state
            .lock()
            .await
            .transfers
            .get(id)
            .and_then(|t| t.queue.clone())
    }

    async fn notify_progress(&self, id: &str) {
        let (completed, total) = {
            let state = self.state.lock().await;
            let Some(transfer) = state.transfers.get(id) else {
                return;
            };
            let completed = transfer
                .blocks
                .values()
                .filter(|b| b.state == TransferState::Complete)
                .count() as u32;
            (completed, transfer.blob.total_blocks)
        };
        if let Some(delegate) = self.delegate.lock().await.clone() {
            delegate.on_progress(id, completed, total);
        }
    }

    async fn notify_error(&self, id: &str, error: &TransferError) {
        if let Some(delegate) = self.delegate.lock().await.clone() {
            delegate.on_error(id, error);
        }
    }

    /// Records the last-observed error on the blob record (spec §3: `error: last error
    /// observed, if any`; spec §7: "error recorded on the record and reported via delegate").
    async fn record_error(&self, id: &str, error: &TransferError) -> TransferResult<()> {
        let updated = {
            let mut state = self.state.lock().await;
            let Some(transfer) = state.transfers.get_mut(id) else {
                return Ok(());
            };
            transfer.blob.error = Some(error.to_string());
            transfer.blob.touch();
            transfer.blob.clone()
        };
        self.store.update(TransferRecord::Blob(updated)).await
    }

    /// Applies `event` to the blob's state and, for block-driven events, re-derives it from
    /// the children first. Always persists and notifies the delegate on an actual transition.
    async fn set_state(&self, id: &str, event: TransferEvent) -> TransferResult<()> {
        let derived = if matches!(
            event,
            TransferEvent::UnitFailed | TransferEvent::AllUnitsSucceeded
        ) {
            let state = self.state.lock().await;
            state
                .transfers
                .get(id)
                .and_then(|t| derive_parent_state(&t.blocks.values().map(|b| b.state).collect::<Vec<_>>()))
        } else {
            None
        };

        let updated = {
            let mut state = self.state.lock().await;
            let transfer = state
                .transfers
                .get_mut(id)
                .ok_or_else(|| invalid_state(format!("unknown transfer '{id}'")))?;

            // spec §7: InvalidState (e.g. pausing an already-paused or terminal transfer) is
            // silently ignored rather than surfaced — commands are idempotent, not errors.
            let Some(next) = derived.or_else(|| transition(transfer.blob.state, event)) else {
                debug!(
                    "ignoring event {event:?} for transfer {id} in state {:?}",
                    transfer.blob.state
                );
                return Ok(());
            };

            if next == transfer.blob.state {
                return Ok(());
            }

            transfer.blob.state = next;
            transfer.blob.touch();
            if next.is_terminal() && next != TransferState::Complete {
                transfer.queue.take();
            }
            transfer.blob.clone()
        };

        self.store.update(TransferRecord::Blob(updated.clone())).await?;
        debug!("transfer {id} -> {:?}", updated.state);
        if let Some(delegate) = self.delegate.lock().await.clone() {
            delegate.on_state_changed(id, updated.state);
        }
        Ok(())
    }

    async fn pause_internal(&self, id: &str) -> TransferResult<()> {
        if let Some(queue) = self.queue_for(id).await {
            queue.clear().await;
        }
        self.set_state(id, TransferEvent::Pause).await
    }

    pub async fn pause(&self, id: &str) -> TransferResult<()> {
        self.pause_internal(id).await
    }

    pub async fn pause_all(&self) -> TransferResult<()> {
        let ids = self.all_ids().await;
        for id in ids {
            self.pause_internal(&id).await?;
        }
        Ok(())
    }

    /// Resumes a paused or failed transfer. Per spec, if the transfer is already in a
    /// terminal or running state this call still notifies the delegate of the current state
    /// rather than silently doing nothing, so a caller polling `resume` never misses a signal.
    pub async fn resume(self: &Arc<Self>, id: &str) -> TransferResult<()> {
        // spec §4.4/§4.6: `resume` is a no-op while the network is unreachable — only
        // `paused && reachable` transitions back to `pending`.
        if !self.reachability.is_reachable() {
            return Ok(());
        }

        let (current, restoration_id) = {
            let state = self.state.lock().await;
            let transfer = state
                .transfers
                .get(id)
                .ok_or_else(|| invalid_state(format!("unknown transfer '{id}'")))?;
            (transfer.blob.state, transfer.blob.client_restoration_id.clone())
        };

        if !current.is_resumable() {
            if let Some(delegate) = self.delegate.lock().await.clone() {
                delegate.on_state_changed(id, current);
            }
            return Ok(());
        }

        // spec §4.5: if the originating HTTP client isn't live, ask the delegate for one via
        // `client_restoration_id` before doing anything else; failure fails the whole transfer.
        if let Err(err) = self.transport_for(&restoration_id).await {
            return self.force_fail(id, &err).await;
        }

        let remaining = self.pending_block_count(id).await;
        if remaining > 0 {
            match self.remaining_decomposition(id).await {
                Ok(decomposition) => {
                    self.set_state(id, TransferEvent::Resume).await?;
                    self.schedule(id, decomposition).await?;
                }
                Err(err) => return self.force_fail(id, &err).await,
            }
        } else {
            self.set_state(id, TransferEvent::Resume).await?;
        }
        Ok(())
    }

    pub async fn resume_all(self: &Arc<Self>) -> TransferResult<()> {
        // spec §4.6: "no-op if `!isReachable`" applies to `resumeAll` as much as `resume`.
        if !self.reachability.is_reachable() {
            return Ok(());
        }
        let ids = self.all_ids().await;
        for id in ids {
            self.resume(&id).await?;
        }
        Ok(())
    }

    async fn pending_block_count(&self, id: &str) -> usize {
        let state = self.state.lock().await;
        state
            .transfers
            .get(id)
            .map(|t| {
                t.blocks
                    .values()
                    .filter(|b| b.state != TransferState::Complete)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Re-decomposes a blob, keeping `Complete` blocks unscheduled and only producing work
    /// units for the blocks that still need to run (spec §4.2: resuming never redoes
    /// already-finished blocks).
    ///
    /// If `initialCallComplete` is already true, the block layout is rebuilt straight from the
    /// persisted `BlockTransfer` records instead of re-running the probe/stat (spec §4.5: "if
    /// `initialCallComplete == false` for a download, only the initial probe is queued" — the
    /// converse being that once it's true, resume never repeats it).
    async fn remaining_decomposition(&self, id: &str) -> TransferResult<Decomposition> {
        let (direction, blob, initial_call_complete, known_blocks) = {
            let state = self.state.lock().await;
            let transfer = state
                .transfers
                .get(id)
                .ok_or_else(|| invalid_state(format!("unknown transfer '{id}'")))?;
            (
                transfer.blob.direction,
                transfer.blob.clone(),
                transfer.blob.initial_call_complete,
                transfer.blocks.values().cloned().collect::<Vec<_>>(),
            )
        };

        let full = if initial_call_complete && !known_blocks.is_empty() {
            let transport = self.transport_for(&blob.client_restoration_id).await?;
            match direction {
                Direction::Upload => upload::units_from_blocks(&blob, &known_blocks, transport),
                Direction::Download => {
                    download::units_from_blocks(&blob, &known_blocks, transport).await?
                }
            }
        } else {
            let full = self.decompose(id).await?;
            self.persist_blocks(id, &full.blocks).await?;
            full
        };

        let completed: HashSet<TransferId> = known_blocks
            .iter()
            .filter(|b| b.state == TransferState::Complete)
            .map(|b| b.id.clone())
            .collect();

        let units = full
            .units
            .into_iter()
            .filter(|unit| !completed.contains(unit.id()))
            .collect();

        Ok(Decomposition {
            units,
            blocks: full.blocks,
        })
    }

    pub async fn cancel(&self, id: &str) -> TransferResult<()> {
        if let Some(queue) = self.queue_for(id).await {
            queue.clear().await;
        }
        self.set_state(id, TransferEvent::Cancel).await?;
        self.mark_children_canceled(id).await
    }

    /// Propagates `Canceled` down to every non-terminal child (spec §3: "a parent is terminal
    /// iff every child is in a terminal state consistent with the parent's outcome"). A no-op if
    /// the blob didn't actually transition (e.g. a second `cancel` call).
    async fn mark_children_canceled(&self, id: &str) -> TransferResult<()> {
        let blocks: Vec<BlockTransfer> = {
            let mut state = self.state.lock().await;
            let Some(transfer) = state.transfers.get_mut(id) else {
                return Ok(());
            };
            if transfer.blob.state != TransferState::Canceled {
                return Ok(());
            }
            transfer
                .blocks
                .values_mut()
                .filter(|block| !block.state.is_terminal())
                .map(|block| {
                    block.state = TransferState::Canceled;
                    block.touch();
                    block.clone()
                })
                .collect()
        };
        for block in blocks {
            self.store.update(TransferRecord::Block(block)).await?;
        }
        Ok(())
    }

    pub async fn cancel_all(&self) -> TransferResult<()> {
        let ids = self.all_ids().await;
        for id in ids {
            self.cancel(&id).await?;
        }
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> TransferResult<()> {
        if let Some(queue) = self.queue_for(id).await {
            queue.clear().await;
        }
        self.store.delete(id).await?;
        self.state.lock().await.transfers.remove(id);
        Ok(())
    }

    pub async fn remove_all(&self) -> TransferResult<()> {
        let ids = self.all_ids().await;
        for id in ids {
            self.remove(&id).await?;
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<BlobTransfer> {
        self.state.lock().await.transfers.get(id).map(|t| t.blob.clone())
    }

    pub async fn all_ids(&self) -> Vec<TransferId> {
        self.state.lock().await.transfers.keys().cloned().collect()
    }
}
