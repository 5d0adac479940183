//! Satellite protocol state machine.
//!
//! One [`SatelliteClient`] owns one socket. Incoming messages are handled
//! in delivery order by a single reader task; every handler runs to
//! completion under the client's state lock, so there is no concurrent
//! mutation of the replication records.

use crate::backoff::BackoffPolicy;
use crate::config::SatelliteClientConfig;
use crate::error::SatelliteError;
use crate::notifier::{ConnectivityNotifier, ConnectivityState};
use crate::replication::Replication;
use crate::socket::{SocketCloser, SocketEvent, SocketEvents, SocketFactory, SocketWriter};
use crate::throttle::{Throttle, ThrottleAction};
use crate::transaction::{apply_op, transaction_to_oplog};
use crate::types::{
    AckType, AuthResponse, Direction, Lsn, Relation, ReplicationStatus, Transaction, DEFAULT_LSN,
};
use parking_lot::Mutex;
use satellite_protocol::message::*;
use satellite_protocol::{decode, encode, PROTOCOL_VSN};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Receiving side of the client's event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<SatelliteEvent>;

/// Something the client reports to its owner.
#[derive(Debug, Clone)]
pub enum SatelliteEvent {
    /// An inbound transaction was fully received.
    Transaction(TransactionEvent),
    /// An outbound LSN was sent or acknowledged.
    Ack { lsn: Lsn, kind: AckType },
    /// The peer started consuming the outbound stream from `lsn`.
    OutboundStarted { lsn: Lsn },
    /// The peer announced a schema version change.
    MigrationNotification(SatMigrationNotification),
    /// An asynchronous failure.
    Error(SatelliteError),
}

/// A received transaction and the handle that acknowledges it.
#[derive(Debug, Clone)]
pub struct TransactionEvent {
    pub transaction: Transaction,
    pub ack: AckHandle,
}

/// Acknowledges an inbound transaction once the application applied it.
#[derive(Clone)]
pub struct AckHandle {
    inner: Weak<Inner>,
    lsn: Lsn,
}

impl AckHandle {
    /// Advances the inbound acknowledged LSN to this transaction's LSN.
    pub fn ack(&self) {
        if let Some(inner) = self.inner.upgrade() {
            tracing::debug!("acknowledging inbound lsn {}", self.lsn);
            inner.state.lock().inbound.ack_lsn = self.lsn.clone();
        }
    }

    pub fn lsn(&self) -> &Lsn {
        &self.lsn
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle").field("lsn", &self.lsn).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RpcKind {
    Auth,
    StartReplication,
    StopReplication,
}

impl RpcKind {
    fn request_name(self) -> &'static str {
        match self {
            RpcKind::Auth => MessageType::AuthReq.name(),
            RpcKind::StartReplication => MessageType::StartReplicationReq.name(),
            RpcKind::StopReplication => MessageType::StopReplicationReq.name(),
        }
    }
}

#[derive(Debug)]
enum RpcResponse {
    Auth(AuthResponse),
    Started,
    Stopped,
}

type RpcResult = Result<RpcResponse, SatelliteError>;

struct PendingRpc {
    id: u64,
    kind: RpcKind,
    tx: oneshot::Sender<RpcResult>,
}

struct PendingCall {
    id: u64,
    kind: RpcKind,
    rx: oneshot::Receiver<RpcResult>,
}

struct Connection {
    writer: SocketWriter,
    closer: SocketCloser,
    reader: JoinHandle<()>,
}

impl Connection {
    fn shutdown(self, abort_reader: bool) {
        self.closer.close_and_remove_listeners();
        if abort_reader {
            self.reader.abort();
        }
    }
}

struct ClientState {
    connection: Option<Connection>,
    inbound: Replication,
    outbound: Replication,
    /// Outstanding RPCs in send order; responses are matched to the head.
    pending: VecDeque<PendingRpc>,
    throttle: Option<Throttle>,
    trailing_flush: Option<JoinHandle<()>>,
}

impl ClientState {
    fn writer(&self) -> Result<SocketWriter, SatelliteError> {
        self.connection
            .as_ref()
            .map(|c| c.writer.clone())
            .ok_or(SatelliteError::NotConnected)
    }

    fn send(&self, msg: SatMessage) -> Result<(), SatelliteError> {
        tracing::debug!("sending {}", msg.message_type());
        self.writer()?.write(encode(&msg))
    }

    fn cancel_push(&mut self) {
        self.throttle = None;
        if let Some(task) = self.trailing_flush.take() {
            task.abort();
        }
    }

    /// Drops the connection and resets both directions, keeping their LSNs.
    fn teardown(&mut self) -> Option<Connection> {
        self.pending.clear();
        self.cancel_push();
        self.inbound.restart(ReplicationStatus::Stopped);
        self.outbound.restart(ReplicationStatus::Stopped);
        self.connection.take()
    }
}

struct Inner {
    db_name: String,
    config: SatelliteClientConfig,
    factory: Arc<dyn SocketFactory>,
    notifier: Arc<dyn ConnectivityNotifier>,
    events: mpsc::UnboundedSender<SatelliteEvent>,
    next_rpc_id: AtomicU64,
    state: Mutex<ClientState>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.cancel_push();
        if let Some(conn) = state.connection.take() {
            conn.shutdown(true);
        }
    }
}

/// Client side of the satellite replication protocol.
#[derive(Clone)]
pub struct SatelliteClient {
    inner: Arc<Inner>,
}

impl SatelliteClient {
    /// Creates a disconnected client and the stream of its events.
    pub fn new(
        db_name: impl Into<String>,
        config: SatelliteClientConfig,
        factory: Arc<dyn SocketFactory>,
        notifier: Arc<dyn ConnectivityNotifier>,
    ) -> (Self, EventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            db_name: db_name.into(),
            config,
            factory,
            notifier,
            events,
            next_rpc_id: AtomicU64::new(1),
            state: Mutex::new(ClientState {
                connection: None,
                inbound: Replication::reset(None, None, None),
                outbound: Replication::reset(None, None, None),
                pending: VecDeque::new(),
                throttle: None,
                trailing_flush: None,
            }),
        });
        (Self { inner }, rx)
    }

    /// Connects with the default backoff policy, retrying retryable errors.
    pub async fn connect(&self) -> Result<(), SatelliteError> {
        self.connect_with_retry(BackoffPolicy::default(), |err, _| err.is_retryable())
            .await
    }

    /// Connects, retrying per `policy` while `retry(error, attempt)` allows it.
    ///
    /// `attempt` counts from 1. A second connect while a socket is open fails
    /// with `UNEXPECTED_STATE`.
    pub async fn connect_with_retry<F>(
        &self,
        policy: BackoffPolicy,
        retry: F,
    ) -> Result<(), SatelliteError>
    where
        F: Fn(&SatelliteError, u32) -> bool,
    {
        let mut attempt = 1;
        loop {
            match self.open_socket().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if attempt >= policy.num_of_attempts || !retry(&err, attempt) {
                        tracing::warn!("connect failed after {} attempt(s): {}", attempt, err);
                        return Err(err);
                    }
                    let delay = policy.delay(attempt - 1);
                    tracing::debug!(
                        "connect attempt {} failed: {}; retrying in {:?}",
                        attempt,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn open_socket(&self) -> Result<(), SatelliteError> {
        if self.inner.state.lock().connection.is_some() {
            return Err(SatelliteError::UnexpectedState(
                "a socket is already open".to_string(),
            ));
        }

        let url = self.inner.config.url();
        tracing::debug!("connecting to {}", url);
        let socket = self.inner.factory.open(&url).await?;
        let (writer, events, closer) = socket.into_parts();

        {
            let mut state = self.inner.state.lock();
            if state.connection.is_some() {
                closer.close_and_remove_listeners();
                return Err(SatelliteError::UnexpectedState(
                    "a socket is already open".to_string(),
                ));
            }
            let reader = tokio::spawn(read_loop(Arc::downgrade(&self.inner), events));
            state.connection = Some(Connection {
                writer,
                closer,
                reader,
            });
        }

        tracing::info!("connected to {}", url);
        self.inner
            .notifier
            .connectivity_state_change(&self.inner.db_name, ConnectivityState::Connected);
        Ok(())
    }

    /// Closes the socket and resets both directions, keeping the last LSNs.
    ///
    /// Outstanding RPCs fail with `CONNECTION_CLOSED`.
    pub fn close(&self) {
        let conn = self.inner.state.lock().teardown();
        if let Some(conn) = conn {
            tracing::info!("closing connection");
            conn.shutdown(true);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connection.is_some()
    }

    /// Authenticates with the configured app id and token.
    pub async fn authenticate(&self) -> Result<AuthResponse, SatelliteError> {
        let request = SatAuthReq {
            id: self.inner.config.app.clone(),
            token: self.inner.config.token.clone(),
            headers: vec![SatAuthHeaderPair {
                key: SatAuthHeader::ProtoVersion as i32,
                value: PROTOCOL_VSN.to_string(),
            }],
        };

        let call = {
            let mut state = self.inner.state.lock();
            self.inner.send_rpc(&mut state, RpcKind::Auth, request.into())?
        };

        match self.inner.await_rpc(call).await? {
            RpcResponse::Auth(response) => Ok(response),
            other => Err(SatelliteError::UnexpectedMessageType(format!(
                "{:?} in response to {}",
                other,
                RpcKind::Auth.request_name()
            ))),
        }
    }

    /// Starts inbound replication from `lsn`; an empty LSN asks for the
    /// beginning of the log.
    pub async fn start_replication(&self, lsn: Lsn) -> Result<(), SatelliteError> {
        let call = {
            let mut state = self.inner.state.lock();
            if state.inbound.status != ReplicationStatus::Stopped {
                return Err(SatelliteError::ReplicationAlreadyStarted);
            }

            state.inbound.restart(ReplicationStatus::Starting);
            state.inbound.ack_lsn = lsn.clone();

            let options = if lsn.is_empty() {
                vec![ReplicationOption::FirstLsn as i32]
            } else {
                vec![]
            };
            let request = SatInStartReplicationReq {
                lsn: lsn.to_vec(),
                options,
                sync_batch_size: 0,
            };

            match self
                .inner
                .send_rpc(&mut state, RpcKind::StartReplication, request.into())
            {
                Ok(call) => call,
                Err(err) => {
                    state.inbound.status = ReplicationStatus::Stopped;
                    return Err(err);
                }
            }
        };

        let result = self.inner.await_rpc(call).await;
        if result.is_err() {
            let mut state = self.inner.state.lock();
            if state.inbound.status == ReplicationStatus::Starting {
                state.inbound.status = ReplicationStatus::Stopped;
            }
        }
        result.map(|_| ())
    }

    /// Stops inbound replication.
    pub async fn stop_replication(&self) -> Result<(), SatelliteError> {
        let call = {
            let mut state = self.inner.state.lock();
            if state.inbound.status != ReplicationStatus::Active {
                return Err(SatelliteError::ReplicationNotStarted(
                    "replication not active".to_string(),
                ));
            }

            state.inbound.status = ReplicationStatus::Stopping;
            match self.inner.send_rpc(
                &mut state,
                RpcKind::StopReplication,
                SatInStopReplicationReq {}.into(),
            ) {
                Ok(call) => call,
                Err(err) => {
                    state.inbound.status = ReplicationStatus::Active;
                    return Err(err);
                }
            }
        };

        let result = self.inner.await_rpc(call).await;
        if result.is_err() {
            let mut state = self.inner.state.lock();
            if state.inbound.status == ReplicationStatus::Stopping {
                state.inbound.status = ReplicationStatus::Active;
            }
        }
        result.map(|_| ())
    }

    /// Queues a local transaction for the peer.
    ///
    /// A transaction whose rows cannot be encoded is rejected here and never
    /// queued. The first enqueue of a push window flushes immediately; later
    /// ones in the same window are flushed together when it ends. Errors from
    /// an immediate flush are returned here, those of a delayed flush are emitted.
    pub fn enqueue_transaction(&self, transaction: Transaction) -> Result<(), SatelliteError> {
        let mut state = self.inner.state.lock();
        if !state.outbound.is_active() {
            return Err(SatelliteError::ReplicationNotStarted(
                "enqueuing a transaction while outbound replication has not started".to_string(),
            ));
        }
        transaction_to_oplog(&transaction)?;

        tracing::debug!("enqueuing transaction {}", transaction.lsn);
        state.outbound.enqueued_lsn = transaction.lsn.clone();
        state.outbound.transactions.push_back(transaction);

        let action = match state.throttle.as_mut() {
            Some(throttle) => throttle.call(Instant::now()),
            None => ThrottleAction::RunNow,
        };
        match action {
            ThrottleAction::RunNow => self.inner.flush(&mut state),
            ThrottleAction::Schedule(delay) => {
                self.inner.schedule_flush(&mut state, delay);
                Ok(())
            }
            ThrottleAction::Covered => Ok(()),
        }
    }

    /// Returns the outbound `(enqueued, acknowledged)` LSNs.
    pub fn outbound_log_positions(&self) -> (Lsn, Lsn) {
        let state = self.inner.state.lock();
        (
            state.outbound.enqueued_lsn.clone(),
            state.outbound.ack_lsn.clone(),
        )
    }

    /// Restores outbound positions, e.g. after a restart.
    pub fn set_outbound_log_positions(&self, enqueued: Lsn, ack: Lsn) {
        let mut state = self.inner.state.lock();
        state.outbound.enqueued_lsn = enqueued;
        state.outbound.ack_lsn = ack;
    }

    /// Returns the last inbound LSN the application acknowledged.
    pub fn inbound_ack_lsn(&self) -> Lsn {
        self.inner.state.lock().inbound.ack_lsn.clone()
    }

    pub fn replication_status(&self, direction: Direction) -> ReplicationStatus {
        let state = self.inner.state.lock();
        match direction {
            Direction::Inbound => state.inbound.status,
            Direction::Outbound => state.outbound.status,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.lock().inbound.authenticated
    }

    /// Returns the number of RPCs awaiting a response.
    pub fn pending_rpcs(&self) -> usize {
        self.inner.state.lock().pending.len()
    }
}

async fn read_loop(inner: Weak<Inner>, mut events: SocketEvents) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            SocketEvent::Message(data) => inner.handle_incoming(&data),
            SocketEvent::Error(err) => {
                tracing::warn!("socket error: {}", err);
                inner
                    .notifier
                    .connectivity_state_change(&inner.db_name, ConnectivityState::Error);
            }
            SocketEvent::Closed => {
                inner.handle_closed();
                break;
            }
        }
    }
    tracing::debug!("read loop finished");
}

impl Inner {
    fn emit(&self, event: SatelliteEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("event receiver dropped");
        }
    }

    fn emit_error(&self, err: SatelliteError) {
        tracing::warn!("{}", err);
        self.emit(SatelliteEvent::Error(err));
    }

    fn send_rpc(
        &self,
        state: &mut ClientState,
        kind: RpcKind,
        msg: SatMessage,
    ) -> Result<PendingCall, SatelliteError> {
        let writer = state.writer()?;
        let id = self.next_rpc_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        state.pending.push_back(PendingRpc { id, kind, tx });

        tracing::debug!("sending {} (rpc {})", msg.message_type(), id);
        if let Err(err) = writer.write(encode(&msg)) {
            state.pending.retain(|p| p.id != id);
            return Err(err);
        }
        Ok(PendingCall { id, kind, rx })
    }

    async fn await_rpc(&self, call: PendingCall) -> RpcResult {
        match tokio::time::timeout(self.config.timeout(), call.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SatelliteError::ConnectionClosed),
            Err(_) => {
                tracing::debug!("rpc {} timed out", call.id);
                self.state.lock().pending.retain(|p| p.id != call.id);
                Err(SatelliteError::Timeout(call.kind.request_name()))
            }
        }
    }

    /// Reports a response of `kind` that does not answer the oldest pending
    /// RPC. Such a response is ignored and the pending RPC keeps waiting.
    fn response_matches_head(&self, state: &ClientState, kind: RpcKind) -> bool {
        match state.pending.front() {
            Some(head) if head.kind != kind => {
                self.emit_error(SatelliteError::UnexpectedMessageType(format!(
                    "response to {} while waiting for response to {}",
                    kind.request_name(),
                    head.kind.request_name()
                )));
                false
            }
            _ => true,
        }
    }

    /// Settles the oldest pending RPC with a handler's result.
    ///
    /// Callers check the head first with [`Inner::response_matches_head`].
    fn complete_rpc(&self, state: &mut ClientState, kind: RpcKind, result: RpcResult) {
        if let Err(err) = &result {
            self.emit_error(err.clone());
        }

        match state.pending.pop_front() {
            Some(pending) => {
                let _ = pending.tx.send(result);
            }
            None => tracing::warn!(
                "response to {} arrived with no pending request",
                kind.request_name()
            ),
        }
    }

    fn handle_closed(&self) {
        let conn = self.state.lock().teardown();
        if let Some(conn) = conn {
            conn.shutdown(false);
        }
        tracing::info!("connection closed by peer");
        self.notifier
            .connectivity_state_change(&self.db_name, ConnectivityState::Disconnected);
    }

    fn handle_incoming(self: &Arc<Self>, data: &[u8]) {
        let msg = match decode(data) {
            Ok(msg) => msg,
            Err(err) => {
                self.emit_error(err.into());
                return;
            }
        };
        tracing::debug!("received {}", msg.message_type());

        let mut state = self.state.lock();
        match msg {
            SatMessage::AuthResp(resp) => {
                if self.response_matches_head(&state, RpcKind::Auth) {
                    state.inbound.authenticated = true;
                    let result = Ok(RpcResponse::Auth(AuthResponse { server_id: resp.id }));
                    self.complete_rpc(&mut state, RpcKind::Auth, result);
                }
            }
            SatMessage::StartReplicationResp(_) => {
                if self.response_matches_head(&state, RpcKind::StartReplication) {
                    let result = Self::handle_start_resp(&mut state);
                    self.complete_rpc(&mut state, RpcKind::StartReplication, result);
                }
            }
            SatMessage::StopReplicationResp(_) => {
                if self.response_matches_head(&state, RpcKind::StopReplication) {
                    let result = Self::handle_stop_resp(&mut state);
                    self.complete_rpc(&mut state, RpcKind::StopReplication, result);
                }
            }
            SatMessage::ErrorResp(resp) => self.handle_error_resp(&mut state, resp),
            SatMessage::PingReq(_) => self.handle_ping_req(&state),
            SatMessage::PingResp(resp) => self.handle_ping_resp(&mut state, resp),
            SatMessage::StartReplicationReq(req) => self.handle_start_req(&mut state, req),
            SatMessage::StopReplicationReq(_) => self.handle_stop_req(&mut state),
            SatMessage::Relation(relation) => self.handle_relation(&mut state, relation),
            SatMessage::OpLog(oplog) => self.handle_oplog(&mut state, oplog),
            SatMessage::MigrationNotification(notification) => {
                tracing::info!(
                    "peer migrated from schema {} to {}",
                    notification.old_schema_version,
                    notification.new_schema_version
                );
                self.emit(SatelliteEvent::MigrationNotification(notification));
            }
            SatMessage::AuthReq(_) => self.emit_error(SatelliteError::UnexpectedMessageType(
                format!("{} is not expected by a client", MessageType::AuthReq),
            )),
        }
    }

    fn handle_start_resp(state: &mut ClientState) -> RpcResult {
        if state.inbound.status == ReplicationStatus::Starting {
            state.inbound.status = ReplicationStatus::Active;
            tracing::info!("inbound replication active");
            Ok(RpcResponse::Started)
        } else {
            Err(SatelliteError::UnexpectedState(format!(
                "unexpected state {} handling 'start' response",
                state.inbound.status
            )))
        }
    }

    fn handle_stop_resp(state: &mut ClientState) -> RpcResult {
        if state.inbound.status == ReplicationStatus::Stopping {
            state.inbound.restart(ReplicationStatus::Stopped);
            tracing::info!("inbound replication stopped");
            Ok(RpcResponse::Stopped)
        } else {
            Err(SatelliteError::UnexpectedState(format!(
                "unexpected state {} handling 'stop' response",
                state.inbound.status
            )))
        }
    }

    fn handle_error_resp(&self, state: &mut ClientState, resp: SatErrorResp) {
        let code = resp.error_type();
        match state.pending.pop_front() {
            Some(pending) => {
                let err = match pending.kind {
                    RpcKind::Auth => SatelliteError::Auth(code.to_string()),
                    _ => SatelliteError::Server(code),
                };
                let _ = pending.tx.send(Err(err.clone()));
                self.emit_error(err);
            }
            None => self.emit_error(SatelliteError::Server(code)),
        }
    }

    fn handle_ping_req(&self, state: &ClientState) {
        let ack = &state.inbound.ack_lsn;
        let pong = SatPingResp {
            lsn: (!ack.is_empty()).then(|| ack.to_vec()),
        };
        if let Err(err) = state.send(pong.into()) {
            self.emit_error(err);
        }
    }

    fn handle_ping_resp(&self, state: &mut ClientState, resp: SatPingResp) {
        match resp.lsn {
            Some(lsn) if !lsn.is_empty() => {
                let lsn = Lsn::from(lsn);
                tracing::debug!("peer committed up to {}", lsn);
                state.outbound.ack_lsn = lsn.clone();
                self.emit(SatelliteEvent::Ack {
                    lsn,
                    kind: AckType::RemoteCommit,
                });
            }
            _ => {}
        }
    }

    /// Handles the peer asking to consume the outbound stream.
    ///
    /// The start LSN is resolved by two overrides applied in order: the
    /// requested LSN, or the enqueued LSN under `LAST_ACKNOWLEDGED`; then
    /// the empty LSN under `FIRST_LSN`. `FIRST_LSN` therefore wins.
    fn handle_start_req(self: &Arc<Self>, state: &mut ClientState, req: SatInStartReplicationReq) {
        if state.outbound.status != ReplicationStatus::Stopped {
            self.refuse_request(state, "start", state.outbound.status);
            return;
        }

        let last_acknowledged = req.has_option(ReplicationOption::LastAcknowledged);
        let first_lsn = req.has_option(ReplicationOption::FirstLsn);

        state.outbound.restart(ReplicationStatus::Active);
        let mut lsn = if last_acknowledged {
            state.outbound.enqueued_lsn.clone()
        } else {
            Lsn::from(req.lsn)
        };
        if first_lsn {
            lsn = DEFAULT_LSN;
        }
        state.outbound.ack_lsn = lsn.clone();
        state.throttle = Some(Throttle::new(self.config.push_period()));

        if let Err(err) = state.send(SatInStartReplicationResp {}.into()) {
            self.emit_error(err);
            return;
        }
        tracing::info!("outbound replication active from lsn {}", lsn);
        self.emit(SatelliteEvent::OutboundStarted { lsn });
    }

    fn handle_stop_req(&self, state: &mut ClientState) {
        if state.outbound.status != ReplicationStatus::Active {
            self.refuse_request(state, "stop", state.outbound.status);
            return;
        }

        state.outbound.restart(ReplicationStatus::Stopped);
        state.cancel_push();
        if let Err(err) = state.send(SatInStopReplicationResp {}.into()) {
            self.emit_error(err);
            return;
        }
        tracing::info!("outbound replication stopped");
    }

    fn refuse_request(&self, state: &ClientState, request: &str, status: ReplicationStatus) {
        let refusal = SatErrorResp {
            error_type: SatErrorCode::ReplicationFailed as i32,
        };
        if let Err(err) = state.send(refusal.into()) {
            self.emit_error(err);
        }
        self.emit_error(SatelliteError::UnexpectedState(format!(
            "unexpected state {} handling '{}' request",
            status, request
        )));
    }

    fn handle_relation(&self, state: &mut ClientState, msg: SatRelation) {
        if !state.inbound.is_active() {
            self.emit_error(SatelliteError::UnexpectedState(format!(
                "unexpected state {} handling 'relation' message",
                state.inbound.status
            )));
            return;
        }
        let relation = Relation::from_message(&msg);
        tracing::debug!("caching relation {} ({})", relation.id, relation.table);
        state.inbound.relations.insert(relation.id, relation);
    }

    fn handle_oplog(self: &Arc<Self>, state: &mut ClientState, oplog: SatOpLog) {
        for op in oplog.ops {
            match apply_op(&mut state.inbound, op) {
                Ok(Some(transaction)) => {
                    let ack = AckHandle {
                        inner: Arc::downgrade(self),
                        lsn: transaction.lsn.clone(),
                    };
                    self.emit(SatelliteEvent::Transaction(TransactionEvent { transaction, ack }));
                }
                Ok(None) => {}
                Err(err) => {
                    state.inbound.transactions.clear();
                    self.emit_error(err);
                    return;
                }
            }
        }
    }

    fn schedule_flush(self: &Arc<Self>, state: &mut ClientState, delay: Duration) {
        let weak = Arc::downgrade(self);
        state.trailing_flush = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut state = inner.state.lock();
            state.trailing_flush = None;
            match state.throttle.as_mut() {
                Some(throttle) => throttle.fire(Instant::now()),
                None => return,
            }
            if let Err(err) = inner.flush(&mut state) {
                inner.emit_error(err);
            }
        }));
    }

    /// Sends every queued outbound transaction in FIFO order.
    ///
    /// A transaction that fails to encode is dropped with an error event and
    /// the drain continues. Only a failed write stops it.
    fn flush(&self, state: &mut ClientState) -> Result<(), SatelliteError> {
        if !state.outbound.is_active() {
            return Err(SatelliteError::ReplicationNotStarted(
                "sending a transaction while outbound replication has not started".to_string(),
            ));
        }
        let writer = state.writer()?;

        while let Some(transaction) = state.outbound.transactions.pop_front() {
            let oplog = match transaction_to_oplog(&transaction) {
                Ok(oplog) => oplog,
                Err(err) => {
                    tracing::warn!("dropping transaction {}: {}", transaction.lsn, err);
                    self.emit_error(err);
                    continue;
                }
            };

            for change in &transaction.changes {
                let relation = &change.relation;
                if state.outbound.relations.contains_key(&relation.id) {
                    continue;
                }
                tracing::debug!("announcing relation {} ({})", relation.id, relation.table);
                writer.write(encode(&relation.to_message().into()))?;
                state
                    .outbound
                    .relations
                    .insert(relation.id, relation.clone());
            }

            writer.write(encode(&oplog.into()))?;
            tracing::debug!("sent transaction {}", transaction.lsn);
            self.emit(SatelliteEvent::Ack {
                lsn: transaction.lsn,
                kind: AckType::LocalSend,
            });
        }
        Ok(())
    }
}
