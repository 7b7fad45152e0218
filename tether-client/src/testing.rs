//! In-process doubles for transports and the request channel.
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures03::{channel::mpsc, StreamExt};
use parking_lot::Mutex;

use tether_common::dto::{Frame, FrameType, GraphRequest, GraphResponse, OperationKind};

use crate::{
    rpc::{RPCError, RequestChannel},
    transport::{ConnectParams, Connection, FrameSink, Transport, TransportError, TransportKind},
};

type Inbound = mpsc::UnboundedSender<Result<Frame, TransportError>>;

struct FakeState {
    refuse: bool,
    auto_pong: bool,
    connect_delay: Option<Duration>,
    connects: Vec<ConnectParams>,
    generation: u64,
    inbound: Option<Inbound>,
    sent: Vec<Frame>,
    closes: usize,
}

/// Transport whose server side is driven by a [`FakeRemote`].
pub(crate) struct FakeTransport {
    kind: TransportKind,
    state: Arc<Mutex<FakeState>>,
}

/// Server side of a [`FakeTransport`].
#[derive(Clone)]
pub(crate) struct FakeRemote {
    state: Arc<Mutex<FakeState>>,
}

/// Creates a transport that accepts connections and answers pings until told otherwise.
pub(crate) fn fake_transport(kind: TransportKind) -> (FakeTransport, FakeRemote) {
    let state = Arc::new(Mutex::new(FakeState {
        refuse: false,
        auto_pong: true,
        connect_delay: None,
        connects: Vec::new(),
        generation: 0,
        inbound: None,
        sent: Vec::new(),
        closes: 0,
    }));
    (FakeTransport { kind, state: Arc::clone(&state) }, FakeRemote { state })
}

#[async_trait]
impl Transport for FakeTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn connect(&self, params: &ConnectParams) -> Result<Connection, TransportError> {
        let delay = self.state.lock().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        state.connects.push(params.clone());
        if state.refuse {
            return Err(TransportError::ConnectionFailed("refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded();
        state.generation += 1;
        state.inbound = Some(tx);
        let sink = FakeSink { state: Arc::clone(&self.state), generation: state.generation };
        Ok(Connection { sink: Box::new(sink), frames: rx.boxed() })
    }
}

struct FakeSink {
    state: Arc<Mutex<FakeState>>,
    generation: u64,
}

#[async_trait]
impl FrameSink for FakeSink {
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.generation != self.generation || state.inbound.is_none() {
            return Err(TransportError::SendFailed("connection gone".to_string()));
        }
        state.sent.push(frame.clone());
        if state.auto_pong && frame.frame_type == FrameType::Ping {
            let pong = Frame::pong(frame.id.as_deref().unwrap_or_default());
            if let Some(inbound) = state.inbound.as_ref() {
                let _ = inbound.unbounded_send(Ok(pong));
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.closes += 1;
        if state.generation == self.generation {
            state.inbound = None;
        }
        Ok(())
    }
}

impl FakeRemote {
    pub(crate) fn set_refuse(&self, refuse: bool) {
        self.state.lock().refuse = refuse;
    }

    pub(crate) fn set_auto_pong(&self, auto_pong: bool) {
        self.state.lock().auto_pong = auto_pong;
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = Some(delay);
    }

    /// Delivers a frame on the live connection. Returns false when there is none.
    pub(crate) fn push(&self, frame: Frame) -> bool {
        self.push_result(Ok(frame))
    }

    pub(crate) fn push_result(&self, item: Result<Frame, TransportError>) -> bool {
        self.state
            .lock()
            .inbound
            .as_ref()
            .is_some_and(|inbound| inbound.unbounded_send(item).is_ok())
    }

    /// Ends the inbound stream of the live connection.
    pub(crate) fn drop_connection(&self) {
        self.state.lock().inbound = None;
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state.lock().inbound.is_some()
    }

    pub(crate) fn connects(&self) -> usize {
        self.state.lock().connects.len()
    }

    pub(crate) fn connect_params(&self) -> Vec<ConnectParams> {
        self.state.lock().connects.clone()
    }

    pub(crate) fn sent(&self) -> Vec<Frame> {
        self.state.lock().sent.clone()
    }

    /// Number of sent frames of `frame_type`.
    pub(crate) fn sent_count(&self, frame_type: FrameType) -> usize {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|f| f.frame_type == frame_type)
            .count()
    }

    pub(crate) fn closes(&self) -> usize {
        self.state.lock().closes
    }
}

/// Request channel answering every request with the same reply after `delay`.
pub(crate) struct FakeChannel {
    delay: Duration,
    reply: Mutex<Result<GraphResponse, RPCError>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<(OperationKind, GraphRequest)>>,
}

impl FakeChannel {
    pub(crate) fn new(delay: Duration, reply: Result<GraphResponse, RPCError>) -> Arc<Self> {
        Arc::new(Self {
            delay,
            reply: Mutex::new(reply),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn set_reply(&self, reply: Result<GraphResponse, RPCError>) {
        *self.reply.lock() = reply;
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<(OperationKind, GraphRequest)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl RequestChannel for FakeChannel {
    async fn execute(
        &self,
        kind: OperationKind,
        request: &GraphRequest,
    ) -> Result<GraphResponse, RPCError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .push((kind, request.clone()));
        tokio::time::sleep(self.delay).await;
        self.reply.lock().clone()
    }
}
