//! Structural master: the serialized coordinator loop
//!
//! Every public entry point enqueues a `MasterMessage`; a single task drains
//! the queue and is the only code touching members, request contexts and
//! timers. Timer ticks and lock acquisitions happen in helper tasks and come
//! back through the same queue.

use crate::common::{retry_with_backoff, Error, MasterConfig, Result, WalSyncPolicy};
use crate::master::configuration::{
    ConfigurationStore, MemoryConfigurationStore, SharedConfiguration,
};
use crate::master::context::{Completion, Outcome, RequestContext};
use crate::master::lock::{LockGuard, LockManager, MemoryLockManager};
use crate::master::member::{MemberChannel, MemberMessage, MemberRegistry};
use crate::master::operation::{
    NodeIdentity, SessionOperationId, StructuralOperation, SubmitResponse,
};
use crate::master::submit::{
    MasterContext, ReplyRoute, SubmitRequest, CONFIGURATION_RESOURCE,
};
use crate::oplog::{FileOperationLog, LogId, MemoryOperationLog, OperationLog};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};

/// Snapshot of the master's in-flight state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterStatus {
    /// Operations proposed but not yet committed or abandoned
    pub pending: Vec<LogId>,
    pub members: Vec<NodeIdentity>,
    /// Periodic timeout ticks still scheduled
    pub active_timers: usize,
    /// Ticks that arrived for an operation already terminated
    pub stale_ticks: u64,
}

enum MasterMessage {
    Propose {
        operation: StructuralOperation,
        completion: Completion,
    },
    Ack {
        node: NodeIdentity,
        id: LogId,
    },
    Tick {
        id: LogId,
    },
    SyncLog,
    Submit {
        route: ReplyRoute,
        operation_id: SessionOperationId,
        request: SubmitRequest,
    },
    Locked {
        route: ReplyRoute,
        operation_id: SessionOperationId,
        request: SubmitRequest,
        guard: Result<LockGuard>,
    },
    Connected {
        member: Arc<dyn MemberChannel>,
    },
    Resend {
        identity: NodeIdentity,
        from: LogId,
        reply: oneshot::Sender<Result<usize>>,
    },
    FullConfiguration {
        identity: NodeIdentity,
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        reply: oneshot::Sender<MasterStatus>,
    },
    Shutdown,
}

/// Handle to a running structural master
pub struct StructuralMaster {
    tx: mpsc::UnboundedSender<MasterMessage>,
    task: Option<JoinHandle<()>>,
}

impl StructuralMaster {
    /// Start a master with the log and store described by `config`
    pub fn open(config: MasterConfig, initial: SharedConfiguration) -> Result<Self> {
        let log: Arc<dyn OperationLog> = match &config.log_path {
            Some(path) => Arc::new(FileOperationLog::open(path, config.wal_sync_policy)?),
            None => Arc::new(MemoryOperationLog::new()),
        };
        let store = Arc::new(MemoryConfigurationStore::new(initial));
        Self::start(config, log, store)
    }

    /// Start a master over the given collaborators, with an in-process lock manager
    pub fn start(
        config: MasterConfig,
        log: Arc<dyn OperationLog>,
        store: Arc<dyn ConfigurationStore>,
    ) -> Result<Self> {
        let locks = Arc::new(MemoryLockManager::new(
            config.lock_timeout(),
            config.lock_lease(),
        ));
        Self::start_with_locks(config, log, store, locks)
    }

    pub fn start_with_locks(
        config: MasterConfig,
        log: Arc<dyn OperationLog>,
        store: Arc<dyn ConfigurationStore>,
        locks: Arc<dyn LockManager>,
    ) -> Result<Self> {
        config.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        tracing::info!(
            node = %config.node_id,
            quorum = config.quorum,
            timeout_ms = config.operation_timeout_ms,
            max_retries = config.max_retries,
            "Starting structural master"
        );

        let mut state = MasterLoop {
            config,
            log,
            store,
            locks,
            members: MemberRegistry::new(),
            contexts: HashMap::new(),
            timers: HashMap::new(),
            sync_timer: None,
            stale_ticks: 0,
            locks_in_flight: 0,
            closing: false,
            tx: tx.downgrade(),
        };
        if state.config.wal_sync_policy == WalSyncPolicy::Interval {
            state.sync_timer = Some(state.spawn_ticker(
                state.config.wal_sync_interval(),
                || MasterMessage::SyncLog,
            ));
        }
        let task = tokio::spawn(state.run(rx));

        Ok(Self {
            tx,
            task: Some(task),
        })
    }

    fn enqueue(&self, message: MasterMessage) -> Result<()> {
        self.tx.send(message).map_err(|_| Error::Shutdown)
    }

    /// Append, track and propagate an operation; `on_finish` observes the outcome
    pub fn propagate_and_apply<F>(
        &self,
        operation: StructuralOperation,
        on_finish: F,
    ) -> Result<()>
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        self.enqueue(MasterMessage::Propose {
            operation,
            completion: Box::new(move |outcome, _| on_finish(outcome)),
        })
    }

    pub fn receive_ack(&self, node: NodeIdentity, id: LogId) -> Result<()> {
        self.enqueue(MasterMessage::Ack { node, id })
    }

    /// Submit arriving from a remote node; the reply goes through its channel
    pub fn receive_submit(
        &self,
        sender: NodeIdentity,
        operation_id: SessionOperationId,
        request: SubmitRequest,
    ) -> Result<()> {
        self.enqueue(MasterMessage::Submit {
            route: ReplyRoute::Remote(sender),
            operation_id,
            request,
        })
    }

    /// Submit from inside this process
    pub fn submit(
        &self,
        operation_id: SessionOperationId,
        request: SubmitRequest,
    ) -> Result<oneshot::Receiver<SubmitResponse>> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(MasterMessage::Submit {
            route: ReplyRoute::Local(reply),
            operation_id,
            request,
        })?;
        Ok(rx)
    }

    /// Admit a node, unless it is already a member or cannot be added
    pub fn join(&self, identity: NodeIdentity) -> Result<oneshot::Receiver<SubmitResponse>> {
        self.submit(SessionOperationId::new(), SubmitRequest::NodeJoin { identity })
    }

    pub fn create_database(
        &self,
        operation_id: SessionOperationId,
        name: impl Into<String>,
        database_type: impl Into<String>,
        configurations: BTreeMap<String, String>,
    ) -> Result<oneshot::Receiver<SubmitResponse>> {
        self.submit(
            operation_id,
            SubmitRequest::CreateDatabase {
                name: name.into(),
                database_type: database_type.into(),
                configurations,
            },
        )
    }

    pub fn drop_database(
        &self,
        operation_id: SessionOperationId,
        name: impl Into<String>,
    ) -> Result<oneshot::Receiver<SubmitResponse>> {
        self.submit(operation_id, SubmitRequest::DropDatabase { name: name.into() })
    }

    pub fn connected(&self, member: Arc<dyn MemberChannel>) -> Result<()> {
        self.enqueue(MasterMessage::Connected { member })
    }

    /// Replay `[from, last persistent id]` to one member; returns entries sent
    pub async fn try_resend(&self, identity: NodeIdentity, from: LogId) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(MasterMessage::Resend {
            identity,
            from,
            reply,
        })?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Bootstrap a member with the current configuration and the id it reflects
    pub async fn send_full_configuration(&self, identity: NodeIdentity) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(MasterMessage::FullConfiguration { identity, reply })?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    pub async fn status(&self) -> Result<MasterStatus> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(MasterMessage::Status { reply })?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Stop the loop. Pending operations complete as abandoned and submits
    /// still waiting for the lock are answered with a failure.
    pub async fn close(mut self) {
        let _ = self.tx.send(MasterMessage::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("Master loop ended abnormally: {}", e);
            }
        }
    }
}

struct MasterLoop {
    config: MasterConfig,
    log: Arc<dyn OperationLog>,
    store: Arc<dyn ConfigurationStore>,
    locks: Arc<dyn LockManager>,
    members: MemberRegistry,
    contexts: HashMap<LogId, RequestContext>,
    timers: HashMap<LogId, AbortHandle>,
    sync_timer: Option<AbortHandle>,
    stale_ticks: u64,
    /// Lock acquisitions whose `Locked` message has not arrived yet
    locks_in_flight: usize,
    closing: bool,
    tx: mpsc::WeakUnboundedSender<MasterMessage>,
}

impl MasterLoop {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<MasterMessage>) {
        while let Some(message) = rx.recv().await {
            match message {
                MasterMessage::Propose {
                    operation,
                    completion,
                } => self.append_and_propagate(operation, completion),
                MasterMessage::Ack { node, id } => self.receive_ack(node, id),
                MasterMessage::Tick { id } => self.operation_timeout(id),
                MasterMessage::SyncLog => self.sync_log(),
                MasterMessage::Submit {
                    route,
                    operation_id,
                    request,
                } => self.receive_submit(route, operation_id, request),
                MasterMessage::Locked {
                    route,
                    operation_id,
                    request,
                    guard,
                } => {
                    self.locks_in_flight -= 1;
                    match guard {
                        Ok(guard) if !self.closing => {
                            request.begin(route, operation_id, guard, &mut self)
                        }
                        Ok(guard) => {
                            drop(guard);
                            let response = request.failure(Error::Shutdown.to_string());
                            route.send(&self.members, &operation_id, response);
                        }
                        Err(e) => {
                            tracing::warn!(%operation_id, "Submit aborted, lock unavailable: {}", e);
                            let response = request.failure(e.to_string());
                            route.send(&self.members, &operation_id, response);
                        }
                    }
                }
                MasterMessage::Connected { member } => self.members.connect(member),
                MasterMessage::Resend {
                    identity,
                    from,
                    reply,
                } => self.try_resend(identity, from, reply),
                MasterMessage::FullConfiguration { identity, reply } => {
                    let _ = reply.send(self.send_full_configuration(&identity));
                }
                MasterMessage::Status { reply } => {
                    let _ = reply.send(self.status());
                }
                MasterMessage::Shutdown => {
                    self.closing = true;
                    self.abandon_pending();
                }
            }
            if self.closing && self.locks_in_flight == 0 {
                break;
            }
        }
        self.shutdown();
    }

    fn append_and_propagate(&mut self, operation: StructuralOperation, completion: Completion) {
        let id = match self.log.append(&operation) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(op = %operation, "Failed to append operation: {}", e);
                completion(Outcome::Failed(e.to_string()), &self.members);
                return;
            }
        };

        tracing::debug!(log_id = %id, op = %operation, members = self.members.len(), "Proposing");
        let context = RequestContext::new(
            operation,
            self.config.quorum,
            self.config.max_retries,
            completion,
        );
        self.timers.insert(id, self.spawn_timer(id));
        self.members.propagate_all(id, context.operation());
        self.contexts.insert(id, context);
    }

    fn spawn_timer(&self, id: LogId) -> AbortHandle {
        self.spawn_ticker(self.config.operation_timeout(), move || {
            MasterMessage::Tick { id }
        })
    }

    /// Enqueue `message()` every `period`, first one period from now
    fn spawn_ticker<F>(&self, period: Duration, message: F) -> AbortHandle
    where
        F: Fn() -> MasterMessage + Send + 'static,
    {
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            loop {
                interval.tick().await;
                let Some(tx) = tx.upgrade() else { break };
                if tx.send(message()).is_err() {
                    break;
                }
            }
        });
        task.abort_handle()
    }

    fn sync_log(&self) {
        if let Err(e) = self.log.sync() {
            tracing::error!("Periodic operation log sync failed: {}", e);
        }
    }

    fn cancel_timer(&mut self, id: LogId) {
        if let Some(timer) = self.timers.remove(&id) {
            timer.abort();
        }
    }

    fn receive_ack(&mut self, node: NodeIdentity, id: LogId) {
        let reached = match self.contexts.get_mut(&id) {
            Some(context) => context.ack(node),
            None => {
                tracing::trace!(log_id = %id, %node, "Ack for finished operation ignored");
                return;
            }
        };
        if !reached {
            return;
        }

        let Some(context) = self.contexts.remove(&id) else {
            return;
        };
        self.cancel_timer(id);
        self.members.confirm_all(id);
        if let Err(e) = self.store.apply(id, context.operation()) {
            tracing::error!(log_id = %id, "Failed to apply committed operation: {}", e);
        }
        tracing::info!(
            log_id = %id,
            op = %context.operation(),
            acks = context.ack_count(),
            "Operation committed"
        );
        context.finish(Outcome::Committed(id), &self.members);
    }

    fn operation_timeout(&mut self, id: LogId) {
        let Some(context) = self.contexts.get_mut(&id) else {
            self.stale_ticks += 1;
            self.cancel_timer(id);
            return;
        };

        if context.timeout() {
            self.cancel_timer(id);
            if let Some(context) = self.contexts.remove(&id) {
                tracing::warn!(
                    log_id = %id,
                    op = %context.operation(),
                    acks = context.ack_count(),
                    "Operation abandoned without quorum"
                );
                context.finish(Outcome::Abandoned(id), &self.members);
            }
        } else {
            tracing::debug!(log_id = %id, acks = context.ack_count(), "Quorum pending, re-propagating");
            self.members
                .propagate_where(id, context.operation(), |node| !context.has_acked(node));
        }
    }

    fn receive_submit(
        &mut self,
        route: ReplyRoute,
        operation_id: SessionOperationId,
        request: SubmitRequest,
    ) {
        if self.closing {
            let response = request.failure(Error::Shutdown.to_string());
            route.send(&self.members, &operation_id, response);
            return;
        }
        let Some(tx) = self.tx.upgrade() else {
            let response = request.failure(Error::Shutdown.to_string());
            route.send(&self.members, &operation_id, response);
            return;
        };
        let locks = self.locks.clone();
        self.locks_in_flight += 1;
        tokio::spawn(async move {
            let guard = locks.lock_resource(CONFIGURATION_RESOURCE).await;
            let _ = tx.send(MasterMessage::Locked {
                route,
                operation_id,
                request,
                guard,
            });
        });
    }

    fn try_resend(
        &mut self,
        identity: NodeIdentity,
        from: LogId,
        reply: oneshot::Sender<Result<usize>>,
    ) {
        let Some(member) = self.members.get(&identity) else {
            let _ = reply.send(Err(Error::UnknownMember(identity.to_string())));
            return;
        };
        let Some(last) = self.log.last_persistent_id() else {
            let _ = reply.send(Ok(0));
            return;
        };

        let log = self.log.clone();
        let batch = self.config.resend_batch_size;
        let attempts = self.config.resend_max_attempts;
        let backoff = self.config.resend_backoff();
        tokio::spawn(async move {
            let result = resend_range(log, member, from, last, batch, attempts, backoff).await;
            match &result {
                Ok(sent) => {
                    tracing::info!(node = %identity, from = %from, to = %last, sent, "Resend complete")
                }
                Err(e) => tracing::warn!(node = %identity, from = %from, "Resend failed: {}", e),
            }
            let _ = reply.send(result);
        });
    }

    fn send_full_configuration(&self, identity: &NodeIdentity) -> Result<()> {
        let member = self
            .members
            .get(identity)
            .ok_or_else(|| Error::UnknownMember(identity.to_string()))?;
        let last_update_id = self.store.last_update_id();
        tracing::info!(node = %identity, last_update_id = ?last_update_id, "Sending full configuration");
        member.send(MemberMessage::FullConfiguration {
            last_update_id,
            configuration: self.store.shared_configuration(),
        })
    }

    fn status(&self) -> MasterStatus {
        let mut pending: Vec<LogId> = self.contexts.keys().copied().collect();
        pending.sort();
        MasterStatus {
            pending,
            members: self.members.identities(),
            active_timers: self.timers.len(),
            stale_ticks: self.stale_ticks,
        }
    }

    fn abandon_pending(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        let mut pending: Vec<(LogId, RequestContext)> = self.contexts.drain().collect();
        pending.sort_by_key(|(id, _)| *id);
        for (id, context) in pending {
            context.finish(Outcome::Abandoned(id), &self.members);
        }
    }

    fn shutdown(&mut self) {
        self.abandon_pending();
        if let Some(timer) = self.sync_timer.take() {
            timer.abort();
        }
        self.sync_log();
        tracing::info!(node = %self.config.node_id, "Structural master stopped");
    }
}

impl MasterContext for MasterLoop {
    fn configuration(&self) -> SharedConfiguration {
        self.store.shared_configuration()
    }

    fn members(&self) -> &MemberRegistry {
        &self.members
    }

    fn propose(&mut self, operation: StructuralOperation, completion: Completion) {
        self.append_and_propagate(operation, completion)
    }
}

/// Stream `[from, to]` to one member in batches, retrying each entry
async fn resend_range(
    log: Arc<dyn OperationLog>,
    member: Arc<dyn MemberChannel>,
    from: LogId,
    to: LogId,
    batch: usize,
    attempts: usize,
    backoff: Duration,
) -> Result<usize> {
    let mut next = from;
    let mut sent = 0;

    while next <= to {
        let upper = LogId::new((next.value() + batch as u64 - 1).min(to.value()));
        for entry in log.iterate(next, upper)? {
            retry_with_backoff(
                || {
                    let result = member.propagate(entry.id, &entry.operation);
                    async move { result }
                },
                attempts,
                backoff,
            )
            .await
            .map_err(|e| Error::ResendFailed {
                node: member.identity().to_string(),
                log_id: entry.id.value(),
                reason: e.to_string(),
            })?;
            sent += 1;
        }
        next = upper.next();
    }

    Ok(sent)
}
