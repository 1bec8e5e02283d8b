//! Single-owner event loop over the ledger.
//!
//! Chain notifications arrive as [`EngineCommand`]s on a bounded queue and
//! are handled one at a time. While a sync runs, further sync requests are
//! coalesced and every other command waits in a backlog until the sync is
//! done, so real-time corrections never race catch-up writes.

use crate::coordinator::{DelegateIdentity, SyncCoordinator, SyncOutcome, SyncState};
use crate::errors::SyncError;
use crate::oracle::ChainOracle;
use crate::read_pool::ReadPool;
use crate::watch::TxWatchPool;
use forgeshare_storage::{LedgerReader, LedgerStore};
use forgeshare_treasury::{
    is_eligible, AllocationCalculator, AntiBotCorrector, CorrectionOutcome, PlanBook, PlanWatch,
    Reduction,
};
use forgeshare_types::{Amount, ChainBlock, EngineSettings, MissedBlock};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

const COMMAND_QUEUE_DEPTH: usize = 1024;

#[derive(Debug)]
pub enum EngineCommand {
    BlockApplied {
        height: u64,
        generator_public_key: String,
    },
    BlockReverted {
        height: u64,
        timestamp: u64,
        generator_public_key: String,
    },
    /// A core transfer was applied.
    TransferApplied {
        id: String,
        sender: String,
        amount: Amount,
        fee: Amount,
        block_height: u64,
    },
    /// A wallet changed its votes. `voted_for_delegate` tells whether the
    /// previous votes included the monitored delegate.
    VoteChanged {
        sender: String,
        block_height: u64,
        voted_for_delegate: bool,
        new_percent: f64,
    },
    TransactionReverted {
        id: String,
    },
    SlotMissed {
        height: u64,
        timestamp: u64,
    },
    WatchTxids(Vec<String>),
    RequestSync,
    /// Answered once every earlier command has been handled.
    Barrier(oneshot::Sender<()>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    InitialSyncCompleted { height: u64 },
    /// The payment collaborator should run a payment now.
    InstantPayRequested,
    PresentPlanChanged { height: u64, timestamp: i64 },
    AllocationsCorrected {
        height: u64,
        address: String,
        valid_votes: Amount,
    },
    Settled { txid: String, rows: usize },
    /// A watched payment id the chain does not know. Needs an operator.
    UnknownPaymentTx { txid: String },
}

#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub async fn send(&self, command: EngineCommand) -> Result<(), SyncError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::EngineStopped)
    }

    pub async fn watch(&self, txids: Vec<String>) -> Result<(), SyncError> {
        self.send(EngineCommand::WatchTxids(txids)).await
    }

    /// Wait until the engine has handled everything sent before this call.
    pub async fn barrier(&self) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::Barrier(tx)).await?;
        rx.await.map_err(|_| SyncError::EngineStopped)
    }
}

pub struct Engine {
    coordinator: SyncCoordinator,
    store: Arc<dyn LedgerStore>,
    oracle: Arc<dyn ChainOracle>,
    pool: Arc<ReadPool>,
    plans: Arc<PlanBook>,
    plan_watch: PlanWatch,
    corrector: AntiBotCorrector,
    watch: TxWatchPool,
    settings: EngineSettings,
    whitelist: HashSet<String>,
    instant_pay_pending: bool,
    commands: mpsc::Receiver<EngineCommand>,
    backlog: VecDeque<EngineCommand>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl Engine {
    /// Resolve the delegate on chain and wire up the engine.
    pub async fn new<S>(
        store: Arc<S>,
        oracle: Arc<dyn ChainOracle>,
        plans: Arc<PlanBook>,
        settings: EngineSettings,
    ) -> Result<(Self, EngineHandle, mpsc::UnboundedReceiver<EngineEvent>), SyncError>
    where
        S: LedgerStore + 'static,
    {
        let wallet = oracle
            .wallet_by_username(&settings.delegate)
            .await?
            .ok_or_else(|| SyncError::DelegateNotFound(settings.delegate.clone()))?;
        let delegate = DelegateIdentity {
            username: settings.delegate.clone(),
            address: wallet.address,
            public_key: wallet.public_key,
        };
        info!(
            target: "sync",
            delegate = %delegate.username,
            address = %delegate.address,
            "Monitoring delegate"
        );

        let reader: Arc<dyn LedgerReader> = store.clone();
        let store: Arc<dyn LedgerStore> = store;
        let pool = Arc::new(ReadPool::new(
            reader,
            settings.read_workers,
            settings.read_retries,
        )?);
        let fees = settings.fee_policy();
        let coordinator = SyncCoordinator::new(
            oracle.clone(),
            store.clone(),
            pool.clone(),
            plans.clone(),
            AllocationCalculator::new(fees),
            delegate.clone(),
            settings.sync_page_size,
        );

        let mut whitelist: HashSet<String> = settings.whitelist.iter().cloned().collect();
        whitelist.insert(delegate.address);

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let engine = Self {
            coordinator,
            store,
            oracle,
            pool,
            plan_watch: PlanWatch::new(&plans),
            corrector: AntiBotCorrector::new(plans.clone(), fees),
            plans,
            watch: TxWatchPool::new(),
            instant_pay_pending: settings.post_init_instant_pay,
            settings,
            whitelist,
            commands: command_rx,
            backlog: VecDeque::new(),
            events: event_tx,
        };
        Ok((
            engine,
            EngineHandle {
                commands: command_tx,
            },
            event_rx,
        ))
    }

    pub fn sync_state(&self) -> SyncState {
        self.coordinator.state()
    }

    fn emit(&self, event: EngineEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    /// Reconcile with the chain, load pending payments and schedule the
    /// initial sync if the ledger lags.
    pub async fn boot(&mut self) -> Result<(), SyncError> {
        if self.coordinator.reconcile().await? {
            self.backlog.push_back(EngineCommand::RequestSync);
        } else if self.instant_pay_pending {
            self.instant_pay_pending = false;
            self.emit(EngineEvent::InstantPayRequested);
        }

        self.watch.add(self.pool.unsettled_txids().await?);
        let net = *self.plans.network();
        for txid in self.watch.ids() {
            match self.oracle.transaction_confirmation(&txid).await? {
                Some(confirmation) => {
                    let rows = self
                        .store
                        .settle(&txid, net.unix_time(confirmation.timestamp))?;
                    if rows > 0 {
                        self.watch.remove(&txid);
                        info!(target: "settlement", txid = %txid, rows, "Settled payment confirmed while offline");
                        self.emit(EngineEvent::Settled { txid, rows });
                    }
                }
                None => {
                    error!(
                        target: "settlement",
                        critical = true,
                        txid = %txid,
                        "Unsettled allocation carries a transaction id unknown to the chain"
                    );
                    self.emit(EngineEvent::UnknownPaymentTx { txid });
                }
            }
        }
        debug!(target: "settlement", watched = self.watch.len(), "Watch pool loaded");
        Ok(())
    }

    /// Boot, then handle commands until every handle is dropped or a fatal
    /// error occurs.
    pub async fn run(mut self) -> Result<(), SyncError> {
        self.boot().await?;
        loop {
            let command = match self.backlog.pop_front() {
                Some(command) => command,
                None => match self.commands.recv().await {
                    Some(command) => command,
                    None => break,
                },
            };
            if let Err(e) = self.handle(command).await {
                if e.is_fatal() {
                    error!(target: "sync", error = %e, "Fatal engine error, stopping");
                    return Err(e);
                }
                warn!(target: "sync", error = %e, "Failed to handle chain event");
            }
        }
        info!(target: "sync", "Command channel closed, engine stopping");
        self.store.flush()?;
        Ok(())
    }

    async fn handle(&mut self, command: EngineCommand) -> Result<(), SyncError> {
        match command {
            EngineCommand::BlockApplied {
                height,
                generator_public_key,
            } => {
                self.wait_indexed(height).await?;
                if generator_public_key == self.coordinator.delegate().public_key {
                    debug!(target: "sync", height, "Block applied, forged by us");
                    self.run_sync().await?;
                }
                self.check_plan_change();
            }
            EngineCommand::BlockReverted {
                height,
                timestamp,
                generator_public_key,
            } => {
                if generator_public_key == self.coordinator.delegate().public_key {
                    debug!(target: "sync", height, "Block reverted, previously forged by us");
                    self.coordinator.purge_reverted(height, timestamp)?;
                }
                self.check_plan_change();
            }
            EngineCommand::TransferApplied {
                id,
                sender,
                amount,
                fee,
                block_height,
            } => {
                let block = self.wait_indexed(block_height).await?;
                if self.watch.contains(&id) {
                    self.settle(id, &block)?;
                } else {
                    self.correct(&sender, block_height, Reduction::Transfer { amount, fee })?;
                }
            }
            EngineCommand::VoteChanged {
                sender,
                block_height,
                voted_for_delegate,
                new_percent,
            } => {
                if voted_for_delegate {
                    self.correct(&sender, block_height, Reduction::VotePercent { new_percent })?;
                }
            }
            EngineCommand::TransactionReverted { id } => {
                let rows = self.store.clear_transaction_id(&id)?;
                self.watch.remove(&id);
                if rows > 0 {
                    info!(target: "settlement", txid = %id, rows, "Payment reverted, allocations unpaid again");
                }
            }
            EngineCommand::SlotMissed { height, timestamp } => {
                let round = self.plans.network().round_of(height).round;
                self.store.record_missed(&MissedBlock {
                    round,
                    height,
                    delegate: self.coordinator.delegate().username.clone(),
                    timestamp,
                })?;
                info!(target: "ledger", round, height, "Recorded missed slot");
            }
            EngineCommand::WatchTxids(ids) => {
                self.watch.add(ids);
            }
            EngineCommand::RequestSync => {
                self.run_sync().await?;
            }
            EngineCommand::Barrier(done) => {
                let _ = done.send(());
            }
        }
        Ok(())
    }

    /// Run a sync while buffering whatever arrives meanwhile.
    async fn run_sync(&mut self) -> Result<(), SyncError> {
        let initial = self.coordinator.is_initial_sync();
        let mut deferred = Vec::new();
        let outcome = {
            let sync = self.coordinator.sync();
            tokio::pin!(sync);
            loop {
                tokio::select! {
                    outcome = &mut sync => break outcome,
                    Some(command) = self.commands.recv() => match command {
                        EngineCommand::RequestSync => {
                            debug!(target: "sync", "Sync already running, request coalesced");
                        }
                        EngineCommand::VoteChanged { .. } if initial => {
                            debug!(target: "antibot", "Vote change ignored during initial sync");
                        }
                        EngineCommand::TransferApplied { ref id, .. }
                            if initial && !self.watch.contains(id) =>
                        {
                            debug!(target: "antibot", "Transfer ignored during initial sync");
                        }
                        other => deferred.push(other),
                    },
                }
            }
        };
        self.backlog.extend(deferred);

        if let SyncOutcome::Completed {
            stored_height,
            initial_sync_finished: true,
            ..
        } = outcome?
        {
            self.emit(EngineEvent::InitialSyncCompleted {
                height: stored_height,
            });
            if self.instant_pay_pending {
                self.instant_pay_pending = false;
                self.emit(EngineEvent::InstantPayRequested);
            }
        }
        Ok(())
    }

    /// Poll until the chain has indexed `height`.
    async fn wait_indexed(&self, height: u64) -> Result<ChainBlock, SyncError> {
        let interval = Duration::from_millis(self.settings.index_poll_interval_ms);
        for _ in 0..self.settings.index_poll_attempts.max(1) {
            if self.oracle.latest_height().await? >= height {
                if let Some(block) = self.oracle.block_at(height).await? {
                    return Ok(block);
                }
            }
            tokio::time::sleep(interval).await;
        }
        Err(SyncError::BlockNotIndexed(height))
    }

    fn settle(&mut self, txid: String, block: &ChainBlock) -> Result<(), SyncError> {
        let settled_at = self.plans.network().unix_time(block.timestamp);
        let rows = self.store.settle(&txid, settled_at)?;
        if rows > 0 {
            self.watch.remove(&txid);
            info!(target: "settlement", txid = %txid, rows, height = block.height, "Payment settled");
            self.emit(EngineEvent::Settled { txid, rows });
        }
        Ok(())
    }

    fn correct(
        &mut self,
        sender: &str,
        block_height: u64,
        reduction: Reduction,
    ) -> Result<(), SyncError> {
        if !self.settings.antibot || self.coordinator.is_initial_sync() {
            return Ok(());
        }
        if self.whitelist.contains(sender) {
            return Ok(());
        }
        let Some(last) = self.store.last_forged()? else {
            return Ok(());
        };
        let event_round = self.plans.network().round_of(block_height).round;
        if !is_eligible(event_round, last.round, self.settings.antibot_round_window) {
            return Ok(());
        }

        match self
            .corrector
            .correct(self.store.as_ref(), &last, sender, reduction)?
        {
            CorrectionOutcome::Corrected { valid_votes, .. } => {
                info!(
                    target: "antibot",
                    address = sender,
                    rounds = %format!("{}-{}", last.round, event_round),
                    height = last.height,
                    "Redistributed block allocations"
                );
                self.emit(EngineEvent::AllocationsCorrected {
                    height: last.height,
                    address: sender.to_string(),
                    valid_votes,
                });
            }
            outcome => {
                debug!(target: "antibot", address = sender, ?outcome, "No correction applied");
            }
        }
        Ok(())
    }

    fn check_plan_change(&mut self) {
        if self.plan_watch.has_present_plan_changed(&self.plans) {
            let present = self.plans.present();
            info!(
                target: "sync",
                height = present.height,
                timestamp = present.timestamp,
                "New reward plan in effect"
            );
            self.emit(EngineEvent::PresentPlanChanged {
                height: present.height,
                timestamp: present.timestamp,
            });
        }
    }
}
