//! # Connection Reactor
//!
//! A [`Connection`] turns a [`Communicator`] into a multiplexed
//! request/response link.
//!
//! ## Architecture
//!
//! Once negotiation has selected a protocol, three tasks run until one fails
//! or the connection is closed:
//!
//! - the **reader** decodes frames and forwards them to the reactor;
//! - the **writer** encodes envelopes from the reactor and emits heartbeats;
//! - the **reactor** owns all connection state: the table of calls awaiting a
//!   reply and the time the peer was last heard from.
//!
//! Callers never touch that state. They enqueue calls on a bounded queue
//! and wait on their [`Sink`].
//!
//! ## Shutdown
//!
//! The reactor runs the shutdown procedure on its way out. Two barriers make
//! the final drain complete: the state moves to `Complete` (no new sends are
//! admitted) and the reactor waits for the in-flight send counter to reach
//! zero (no sender is still inside the enqueue). Every call still queued or
//! pending then receives the termination error.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio::time::Interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing::debug;
use tracing::info;
use tracing::info_span;
use tracing::trace;
use tracing::warn;

use crate::communicator::Communicator;
use crate::communicator::bounded;
use crate::config::ConnectionConfig;
use crate::config::Dispatch;
use crate::envelope::Envelope;
use crate::envelope::Outcome;
use crate::envelope::Sink;
use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Op;
use crate::error::Result;
use crate::handler::Handler;
use crate::handler::IncomingRequest;
use crate::id::ConnectionId;
use crate::id::MessageId;
use crate::id::MessageIds;
use crate::id::Side;
use crate::negotiate::Negotiator;
use crate::protocol::CodecState;
use crate::protocol::Protocol;

const NEW: u8 = 0;
const RUNNING: u8 = 1;
const COMPLETE: u8 = 2;

/// Most calls remembered after their response timeout, so a late reply can
/// be told apart from one that was never asked for.
const ABANDONED_CAPACITY: usize = 4096;
/// How long an expired call is remembered.
const ABANDONED_RETENTION: Duration = Duration::from_secs(300);

/// Lifecycle of a connection. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    New,
    Running,
    Complete,
}

/// Reported once when a connection has fully stopped.
#[derive(Debug, Clone)]
pub struct Ended {
    pub id: ConnectionId,
    /// The first failure, or `None` for an orderly close.
    pub error: Option<Error>,
}

/// Work submitted to the reactor.
enum Call<M> {
    /// An original message expecting a reply.
    Original {
        id: MessageId,
        message: M,
        sink: Sink<M>,
        deadline: Option<Instant>,
    },
    /// An answer to a request received earlier. An error here terminates
    /// the connection instead of replying.
    Reply { reply_to: MessageId, result: Result<M> },
}

/// A call waiting for its reply.
struct Pending<M> {
    sink: Sink<M>,
    deadline: Option<Instant>,
}

type Pendings<M> = HashMap<MessageId, Pending<M>>;

/// Ids of calls that gave up waiting, oldest first.
#[derive(Default)]
struct Abandoned {
    ids: HashSet<MessageId>,
    order: VecDeque<(MessageId, Instant)>,
}

impl Abandoned {
    fn insert(&mut self, id: MessageId, now: Instant) {
        if self.ids.insert(id) {
            self.order.push_back((id, now));
        }
        while self.order.len() > ABANDONED_CAPACITY {
            self.pop();
        }
    }

    /// Forgets `id`, returning whether it was remembered.
    fn take(&mut self, id: MessageId) -> bool {
        self.ids.remove(&id)
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(_, at)) = self.order.front() {
            if at + ABANDONED_RETENTION > now {
                break;
            }
            self.pop();
        }
    }

    fn pop(&mut self) {
        if let Some((id, _)) = self.order.pop_front() {
            self.ids.remove(&id);
        }
    }
}

/// Everything `start` consumes.
struct Parts<M: Send + 'static> {
    calls: mpsc::Receiver<Call<M>>,
    negotiator: Arc<dyn Negotiator<M>>,
    handler: Option<Arc<dyn Handler<M>>>,
}

struct Shared<M: Send + 'static> {
    id: ConnectionId,
    side: Side,
    config: ConnectionConfig,
    communicator: Arc<dyn Communicator>,
    state: AtomicU8,
    message_ids: MessageIds,
    calls: mpsc::Sender<Call<M>>,
    parts: Mutex<Option<Parts<M>>>,
    /// Callers currently inside an enqueue.
    senders: AtomicUsize,
    senders_idle: Notify,
    stop: CancellationToken,
    /// Cancelled once shutdown has delivered every outstanding result.
    stopped: CancellationToken,
    closed: AtomicBool,
    failure: Mutex<Option<Error>>,
    protocol_name: Mutex<Option<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<M: Send + 'static> Shared<M> {
    fn state(&self) -> State {
        match self.state.load(Ordering::SeqCst) {
            NEW => State::New,
            RUNNING => State::Running,
            _ => State::Complete,
        }
    }

    /// Records the first failure and asks every task to stop. Failures seen
    /// after stop was requested are consequences, not causes.
    fn fail(&self, error: Error) {
        {
            let mut slot = lock(&self.failure);
            if slot.is_none() && !self.stop.is_cancelled() {
                debug!(error = %error, "connection failing");
                *slot = Some(error.on(self.id));
            }
        }
        self.stop.cancel();
    }

    fn failure(&self) -> Option<Error> {
        lock(&self.failure).clone()
    }

    async fn wait_senders_idle(&self) {
        loop {
            let idle = self.senders_idle.notified();
            if self.senders.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    fn error(&self, kind: ErrorKind, op: Op) -> Error {
        Error::new(kind).during(op).on(self.id)
    }
}

/// Holds a slot in the send counter until dropped, including when the
/// caller abandons the enqueue.
struct SendGuard<'a, M: Send + 'static> {
    shared: &'a Shared<M>,
}

impl<'a, M: Send + 'static> SendGuard<'a, M> {
    fn enter(shared: &'a Shared<M>) -> Self {
        shared.senders.fetch_add(1, Ordering::SeqCst);
        Self { shared }
    }
}

impl<M: Send + 'static> Drop for SendGuard<'_, M> {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.senders_idle.notify_waiters();
        }
    }
}

/// A multiplexed request/response link over one communicator.
///
/// Cheap to clone; all clones drive the same link.
pub struct Connection<M: Send + 'static> {
    shared: Arc<Shared<M>>,
}

impl<M: Send + 'static> Clone for Connection<M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<M: Send + 'static> fmt::Debug for Connection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("side", &self.shared.side)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl<M: Send + 'static> Connection<M> {
    pub fn new(
        id: ConnectionId,
        side: Side,
        config: ConnectionConfig,
        communicator: Arc<dyn Communicator>,
        negotiator: Arc<dyn Negotiator<M>>,
        handler: Option<Arc<dyn Handler<M>>>,
    ) -> Result<Self> {
        config.validate()?;
        let (calls_tx, calls_rx) = mpsc::channel(config.outgoing_buffer);
        let shared = Shared {
            id,
            side,
            communicator,
            state: AtomicU8::new(NEW),
            message_ids: MessageIds::new(side),
            calls: calls_tx,
            parts: Mutex::new(Some(Parts {
                calls: calls_rx,
                negotiator,
                handler,
            })),
            senders: AtomicUsize::new(0),
            senders_idle: Notify::new(),
            stop: CancellationToken::new(),
            stopped: CancellationToken::new(),
            closed: AtomicBool::new(false),
            failure: Mutex::new(None),
            protocol_name: Mutex::new(None),
            config,
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn side(&self) -> Side {
        self.shared.side
    }

    pub fn state(&self) -> State {
        self.shared.state()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Name of the negotiated protocol, once negotiation has succeeded.
    pub fn protocol_name(&self) -> Option<String> {
        lock(&self.shared.protocol_name).clone()
    }

    /// Negotiates a protocol and spawns the connection's tasks.
    ///
    /// Returns once the tasks are running, or with the negotiation failure.
    /// Either way, exactly one [`Ended`] is posted on `ended` when the
    /// connection has fully stopped.
    pub async fn start(&self, ended: mpsc::UnboundedSender<Ended>) -> Result<()> {
        let shared = &self.shared;
        if shared
            .state
            .compare_exchange(NEW, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(shared.error(ErrorKind::AlreadyRunning, Op::Connect));
        }
        let Some(parts) = lock(&shared.parts).take() else {
            return Err(shared.error(ErrorKind::AlreadyRunning, Op::Connect));
        };
        let Parts {
            mut calls,
            negotiator,
            handler,
        } = parts;

        let span = info_span!("connection", conn = %shared.id, side = %shared.side);

        let protocol = match self.negotiate(negotiator.as_ref()).instrument(span.clone()).await {
            Ok(protocol) => protocol,
            Err(error) => {
                let error = error.during(Op::Negotiate).on(shared.id);
                warn!(parent: &span, error = %error, "negotiation failed");
                shared.fail(error.clone());
                shut_down(shared, &mut calls, &mut HashMap::new()).instrument(span).await;
                let _ = ended.send(Ended {
                    id: shared.id,
                    error: shared.failure(),
                });
                return Err(error);
            }
        };

        *lock(&shared.protocol_name) = Some(protocol.name().to_string());
        debug!(parent: &span, protocol = protocol.name(), "negotiated");

        let supervisor = supervise(shared.clone(), protocol, calls, handler, ended);
        tokio::spawn(supervisor.instrument(span));
        Ok(())
    }

    async fn negotiate(&self, negotiator: &dyn Negotiator<M>) -> Result<Arc<Protocol<M>>> {
        let shared = &self.shared;
        let negotiated = bounded(
            shared.config.read_timeout,
            ErrorKind::ReadTimeout,
            negotiator.negotiate(shared.communicator.as_ref(), shared.side),
        );
        tokio::select! {
            biased;
            _ = shared.stop.cancelled() => Err(Error::new(ErrorKind::Shutdown)),
            negotiated = negotiated => negotiated?.ok_or_else(|| Error::new(ErrorKind::NoProtocol)),
        }
    }

    /// Enqueues an original message; its outcome is delivered to `sink`.
    ///
    /// Returns the id assigned to the message. Blocks while the call queue
    /// is full. Dropping the returned future abandons the enqueue.
    pub async fn send(&self, message: M, sink: Sink<M>) -> Result<MessageId> {
        let shared = &self.shared;
        let id = shared.message_ids.next();
        let response_timeout = shared.config.response_timeout;
        let deadline = (!response_timeout.is_zero()).then(|| Instant::now() + response_timeout);
        self.enqueue(
            Call::Original {
                id,
                message,
                sink,
                deadline,
            },
            Op::Send,
        )
        .await?;
        Ok(id)
    }

    /// Sends `message` and waits for the reply.
    pub async fn request(&self, message: M) -> Result<M> {
        let (sink, rx) = Sink::once();
        self.send(message, sink)
            .await
            .map_err(|e| e.during(Op::Request))?;
        match rx.await {
            Ok(outcome) => outcome.result,
            Err(_) => Err(self.shared.error(ErrorKind::Shutdown, Op::Request)),
        }
    }

    /// Like [`request`](Self::request), but gives up after `timeout`.
    ///
    /// Giving up only ends the wait: the call stays pending until its reply
    /// arrives or the response timeout sweeps it.
    pub async fn request_timeout(&self, message: M, timeout: Duration) -> Result<M> {
        bounded(timeout, ErrorKind::DeadlineExceeded, self.request(message))
            .await
            .map_err(|e| e.during(Op::Request).on(self.shared.id))
    }

    /// Answers the request `reply_to`. An `Err` terminates the connection
    /// with that error instead of replying.
    pub async fn reply(&self, reply_to: MessageId, result: Result<M>) -> Result<()> {
        self.enqueue(Call::Reply { reply_to, result }, Op::Reply).await
    }

    async fn enqueue(&self, call: Call<M>, op: Op) -> Result<()> {
        let shared = &self.shared;
        if shared.state() != State::Running {
            return Err(shared.error(ErrorKind::NotRunning, op));
        }
        let _guard = SendGuard::enter(shared);
        tokio::select! {
            biased;
            _ = shared.stop.cancelled() => Err(shared.error(ErrorKind::Shutdown, op)),
            permit = shared.calls.reserve() => match permit {
                Ok(permit) => {
                    permit.send(call);
                    Ok(())
                }
                Err(_) => Err(shared.error(ErrorKind::Shutdown, op)),
            },
        }
    }

    /// Stops the connection and waits until every outstanding call has its
    /// result. A second call fails with `AlreadyClosed`.
    pub async fn close(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::SeqCst) {
            return Err(shared.error(ErrorKind::AlreadyClosed, Op::Close));
        }
        if shared
            .state
            .compare_exchange(NEW, COMPLETE, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // never started: no reactor will run the shutdown procedure
            shared.stop.cancel();
            let closed = shared.communicator.close().await;
            shared.stopped.cancel();
            return closed.map_err(|e| e.during(Op::Close).on(shared.id));
        }
        shared.stop.cancel();
        shared.stopped.cancelled().await;
        Ok(())
    }

    /// Resolves once the connection has fully stopped.
    pub async fn closed(&self) {
        self.shared.stopped.cancelled().await
    }
}

/// Runs the three connection tasks and reports how they ended.
async fn supervise<M: Send + 'static>(
    shared: Arc<Shared<M>>,
    protocol: Arc<Protocol<M>>,
    calls: mpsc::Receiver<Call<M>>,
    handler: Option<Arc<dyn Handler<M>>>,
    ended: mpsc::UnboundedSender<Ended>,
) {
    let config = &shared.config;
    let limit = protocol.effective_limit(shared.communicator.message_limit());
    let (incoming_tx, incoming_rx) = mpsc::channel(config.incoming_buffer);
    let (outgoing_tx, outgoing_rx) = mpsc::channel(config.outgoing_buffer);

    let reader = Reader {
        shared: shared.clone(),
        protocol: protocol.clone(),
        incoming: incoming_tx,
        limit,
    };
    let writer = Writer {
        shared: shared.clone(),
        protocol: protocol.clone(),
        outgoing: outgoing_rx,
        limit,
    };
    let reactor = Reactor {
        shared: shared.clone(),
        pongs: shared.communicator.pongs(),
        protocol,
        handler,
        calls,
        incoming: incoming_rx,
        outgoing: outgoing_tx,
        pending: HashMap::new(),
        abandoned: Abandoned::default(),
        last_receive: Instant::now(),
    };

    // each task records its own failure before dropping its channel ends
    let tasks = [
        ("reader", tokio::spawn(reader.run().in_current_span())),
        ("writer", tokio::spawn(writer.run().in_current_span())),
        ("reactor", tokio::spawn(reactor.run().in_current_span())),
    ];
    for (name, task) in tasks {
        if let Err(e) = task.await {
            shared.fail(Error::protocol(format!("{} task failed: {}", name, e)));
        }
    }

    // the reactor closed it already unless it panicked
    let _ = shared.communicator.close().await;
    shared.stopped.cancel();

    let error = shared.failure();
    match &error {
        Some(e) => warn!(error = %e, "connection ended"),
        None => info!("connection closed"),
    }
    let _ = ended.send(Ended {
        id: shared.id,
        error,
    });
}

/// A periodic tick, or `None` when disabled by a zero period.
fn ticker(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn next_pong(pongs: &mut Option<mpsc::UnboundedReceiver<()>>) -> Option<()> {
    match pongs {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

struct Reader<M: Send + 'static> {
    shared: Arc<Shared<M>>,
    protocol: Arc<Protocol<M>>,
    incoming: mpsc::Sender<Option<Envelope<M>>>,
    limit: usize,
}

impl<M: Send + 'static> Reader<M> {
    async fn run(self) -> Result<()> {
        let result = self.read().await;
        if let Err(e) = &result {
            self.shared.fail(e.clone());
        }
        result
    }

    async fn read(&self) -> Result<()> {
        let shared = &self.shared;
        let read_timeout = shared.config.read_timeout;
        let mut buf = Vec::with_capacity(shared.config.read_buffer_initial);
        let mut state = CodecState::new();

        loop {
            let read = tokio::select! {
                biased;
                _ = shared.stop.cancelled() => return Ok(()),
                read = shared.communicator.read_message(&mut buf, self.limit, read_timeout) => read,
            };
            read.map_err(|e| e.during(Op::Read))?;

            // an empty frame is a heartbeat
            let envelope = if buf.is_empty() {
                trace!("heartbeat received");
                None
            } else {
                let envelope = self
                    .protocol
                    .codec()
                    .decode(&buf, self.protocol.mapper(), &mut state)
                    .map_err(|e| e.during(Op::Read))?;
                trace!(id = %envelope.id, reply_to = %envelope.reply_to, kind = envelope.kind, "received");
                Some(envelope)
            };

            tokio::select! {
                biased;
                _ = shared.stop.cancelled() => return Ok(()),
                sent = self.incoming.send(envelope) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

struct Writer<M: Send + 'static> {
    shared: Arc<Shared<M>>,
    protocol: Arc<Protocol<M>>,
    outgoing: mpsc::Receiver<Envelope<M>>,
    limit: usize,
}

impl<M: Send + 'static> Writer<M> {
    async fn run(mut self) -> Result<()> {
        let result = self.write().await;
        if let Err(e) = &result {
            self.shared.fail(e.clone());
        }
        result
    }

    async fn write(&mut self) -> Result<()> {
        let write_timeout = self.shared.config.write_timeout;
        let mut heartbeat = ticker(self.shared.config.heartbeat_send_interval);
        let mut buf = Vec::with_capacity(self.shared.config.write_buffer_initial);
        let mut state = CodecState::new();

        loop {
            tokio::select! {
                biased;
                _ = self.shared.stop.cancelled() => return Ok(()),
                envelope = self.outgoing.recv() => {
                    let Some(envelope) = envelope else {
                        return Ok(());
                    };
                    self.encode(&envelope, &mut buf, &mut state)?;
                    self.shared
                        .communicator
                        .write_message(&buf, write_timeout)
                        .await
                        .map_err(|e| e.during(Op::Write))?;
                }
                _ = tick(&mut heartbeat) => {
                    trace!("sending heartbeat");
                    self.shared
                        .communicator
                        .ping(write_timeout)
                        .await
                        .map_err(|e| e.during(Op::Ping))?;
                }
            }
        }
    }

    fn encode(&self, envelope: &Envelope<M>, buf: &mut Vec<u8>, state: &mut CodecState) -> Result<()> {
        buf.clear();
        self.protocol
            .codec()
            .encode(envelope, buf, state)
            .map_err(|e| e.during(Op::Write))?;
        if buf.is_empty() {
            return Err(Error::protocol("codec produced an empty frame").during(Op::Write));
        }
        if buf.len() > self.limit {
            let kind = ErrorKind::MessageTooLarge {
                size: buf.len(),
                limit: self.limit,
            };
            return Err(Error::new(kind).during(Op::Write));
        }
        trace!(id = %envelope.id, reply_to = %envelope.reply_to, size = buf.len(), "sending");
        Ok(())
    }
}

struct Reactor<M: Send + 'static> {
    shared: Arc<Shared<M>>,
    protocol: Arc<Protocol<M>>,
    handler: Option<Arc<dyn Handler<M>>>,
    calls: mpsc::Receiver<Call<M>>,
    incoming: mpsc::Receiver<Option<Envelope<M>>>,
    outgoing: mpsc::Sender<Envelope<M>>,
    pongs: Option<mpsc::UnboundedReceiver<()>>,
    pending: Pendings<M>,
    abandoned: Abandoned,
    last_receive: Instant,
}

impl<M: Send + 'static> Reactor<M> {
    async fn run(mut self) -> Result<()> {
        let result = self.react().await;
        if let Err(e) = &result {
            self.shared.fail(e.clone());
        }
        shut_down(&self.shared, &mut self.calls, &mut self.pending).await;
        result
    }

    async fn react(&mut self) -> Result<()> {
        let mut cleanup = ticker(self.shared.config.cleanup_interval);
        let mut heartbeat_check = ticker(self.shared.config.heartbeat_check_interval);

        loop {
            tokio::select! {
                _ = self.shared.stop.cancelled() => return Ok(()),
                incoming = self.incoming.recv() => match incoming {
                    Some(Some(envelope)) => {
                        self.last_receive = Instant::now();
                        self.on_envelope(envelope).await?;
                    }
                    Some(None) => self.last_receive = Instant::now(),
                    // the reader has exited and recorded why
                    None => return Ok(()),
                },
                Some(call) = self.calls.recv() => self.on_call(call).await?,
                pong = next_pong(&mut self.pongs) => match pong {
                    Some(()) => self.last_receive = Instant::now(),
                    None => self.pongs = None,
                },
                _ = tick(&mut cleanup) => self.sweep()?,
                _ = tick(&mut heartbeat_check) => self.check_liveness()?,
            }
        }
    }

    fn connection(&self) -> Connection<M> {
        Connection {
            shared: self.shared.clone(),
        }
    }

    async fn on_envelope(&mut self, envelope: Envelope<M>) -> Result<()> {
        if envelope.is_reply() {
            let Some(pending) = self.pending.remove(&envelope.reply_to) else {
                if self.abandoned.take(envelope.reply_to) {
                    debug!(reply_to = %envelope.reply_to, "dropping late reply");
                    return Ok(());
                }
                return Err(Error::new(ErrorKind::UnexpectedReply(envelope.reply_to)).during(Op::Read));
            };
            let outcome = Outcome::reply(envelope.reply_to, envelope.id, envelope.message);
            return pending.sink.deliver(outcome).map_err(|e| e.during(Op::Read));
        }

        let Some(handler) = self.handler.clone() else {
            return Err(Error::new(ErrorKind::NoHandler).during(Op::Handle));
        };
        let response_timeout = self.shared.config.response_timeout;
        let deadline = (!response_timeout.is_zero()).then(|| self.last_receive + response_timeout);
        let request_id = envelope.id;
        let request = IncomingRequest::new(
            self.connection(),
            request_id,
            envelope.kind,
            envelope.message,
            deadline,
        );

        match self.shared.config.dispatch {
            Dispatch::Inline => {
                let handled = tokio::select! {
                    biased;
                    _ = self.shared.stop.cancelled() => return Ok(()),
                    handled = handler.handle_request(request) => handled,
                };
                if let Some(reply) = handled.map_err(|e| e.during(Op::Handle))? {
                    self.write_reply(request_id, reply).await?;
                }
            }
            Dispatch::Spawn => {
                let responder = request.responder();
                let task = async move {
                    let reply = match handler.handle_request(request).await {
                        Ok(Some(reply)) => Ok(reply),
                        Ok(None) => return,
                        Err(e) => Err(e.during(Op::Handle)),
                    };
                    if let Err(e) = responder.done(reply).await {
                        debug!(error = %e, "reply dropped");
                    }
                };
                tokio::spawn(task.in_current_span());
            }
        }
        Ok(())
    }

    async fn on_call(&mut self, call: Call<M>) -> Result<()> {
        match call {
            Call::Original {
                id,
                message,
                sink,
                deadline,
            } => {
                let kind = match self.protocol.mapper().kind(&message) {
                    Ok(kind) => kind,
                    Err(e) => {
                        let error = e.during(Op::Send).on(self.shared.id);
                        return sink.deliver(Outcome::failed(id, error));
                    }
                };
                self.pending.insert(id, Pending { sink, deadline });
                let envelope = Envelope {
                    id,
                    reply_to: MessageId::NONE,
                    kind,
                    message,
                };
                self.forward(envelope).await
            }
            Call::Reply { reply_to, result } => match result {
                Ok(message) => self.write_reply(reply_to, message).await,
                Err(error) => Err(error.during(Op::Reply)),
            },
        }
    }

    async fn write_reply(&mut self, reply_to: MessageId, message: M) -> Result<()> {
        let kind = self
            .protocol
            .mapper()
            .kind(&message)
            .map_err(|e| e.during(Op::Reply))?;
        let envelope = Envelope {
            id: self.shared.message_ids.next(),
            reply_to,
            kind,
            message,
        };
        self.forward(envelope).await
    }

    /// Hands an envelope to the writer.
    async fn forward(&self, envelope: Envelope<M>) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.shared.stop.cancelled() => Err(Error::new(ErrorKind::Shutdown).during(Op::Write)),
            sent = self.outgoing.send(envelope) => {
                sent.map_err(|_| Error::new(ErrorKind::Shutdown).during(Op::Write))
            }
        }
    }

    /// Fails every call whose response deadline has passed.
    fn sweep(&mut self) -> Result<()> {
        let now = Instant::now();
        self.abandoned.prune(now);
        let expired: Vec<MessageId> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                debug!(id = %id, "response timeout");
                self.abandoned.insert(id, now);
                let error = self.shared.error(ErrorKind::ResponseTimeout, Op::Request);
                pending
                    .sink
                    .deliver(Outcome::failed(id, error))
                    .map_err(|e| e.during(Op::Request))?;
            }
        }
        Ok(())
    }

    fn check_liveness(&self) -> Result<()> {
        let read_timeout = self.shared.config.read_timeout;
        if !read_timeout.is_zero() && self.last_receive.elapsed() > read_timeout {
            return Err(Error::new(ErrorKind::ReadTimeout).during(Op::Read));
        }
        Ok(())
    }
}

/// Moves the connection to `Complete` and settles every outstanding call.
async fn shut_down<M: Send + 'static>(
    shared: &Shared<M>,
    calls: &mut mpsc::Receiver<Call<M>>,
    pending: &mut Pendings<M>,
) {
    shared.state.store(COMPLETE, Ordering::SeqCst);
    shared.stop.cancel();
    shared.wait_senders_idle().await;

    if let Err(e) = shared.communicator.close().await {
        debug!(error = %e, "closing communicator");
    }

    calls.close();
    while let Ok(call) = calls.try_recv() {
        if let Call::Original {
            id, sink, deadline, ..
        } = call
        {
            pending.insert(id, Pending { sink, deadline });
        }
    }

    let error = shared
        .failure()
        .unwrap_or_else(|| shared.error(ErrorKind::Shutdown, Op::Close));
    for (id, pending) in pending.drain() {
        let _ = pending.sink.deliver(Outcome::failed(id, error.clone()));
    }
    shared.stopped.cancel();
}
