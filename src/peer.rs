//! Local view of a remote Agent: runs the handshake, owns the callback
//! and proxy tables, and dispatches inbound messages, per spec §4.3.

use crate::agent::Agent;
use crate::error::{Error, Result};
use crate::marshal::{self, GetFunction, StoreFunction};
use crate::transport::{Transport, TransportEvent};
use crate::value::{procedure, ProcedureRef, Value};
use crate::wire::WireValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::AsyncWrite;
use tokio::sync::broadcast;
use tracing::warn;

/// Error string delivered to the last-argument callback of a proxy
/// invoked while its Peer is not [`PeerState::Live`].
pub const ENOTCONNECTED: &str = "ENOTCONNECTED";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Connecting,
    Live,
    Disconnected,
}

/// Out-of-band signal surfaced alongside ordinary procedure dispatch.
/// Subscribe with [`Peer::events`]; every subscriber sees every event
/// from the point it subscribed.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// The far side's published names have been installed as proxies.
    Connect,
    /// Terminal loss of the Transport, or an explicit [`Peer::disconnect`].
    Disconnect(Option<Error>),
    /// The outbound buffer has drained below its high-water mark.
    Drain,
    /// A protocol violation was observed. In this design every `Error`
    /// event is followed by a `Disconnect`.
    Error(Error),
}

struct CallbackTable {
    map: HashMap<u32, ProcedureRef>,
    next_key: u32,
}

impl CallbackTable {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            next_key: 1,
        }
    }

    /// Allocate the next free key, starting at `next_key` and scanning
    /// forward with 32-bit wraparound.
    fn store(&mut self, proc: ProcedureRef) -> Result<u32> {
        if self.map.len() as u64 >= u32::MAX as u64 {
            return Err(Error::KeysExhausted);
        }
        let start = self.next_key;
        let mut key = start;
        while self.map.contains_key(&key) {
            key = key.wrapping_add(1);
            if key == start {
                return Err(Error::KeysExhausted);
            }
        }
        self.map.insert(key, proc);
        self.next_key = key.wrapping_add(1);
        Ok(key)
    }

    /// Remove and return the callback at `key`, if any — single-shot
    /// consumption. Prefers reusing the freed key on the next `store`.
    fn take(&mut self, key: u32) -> Option<ProcedureRef> {
        let proc = self.map.remove(&key);
        if proc.is_some() {
            self.next_key = key;
        }
        proc
    }

    fn drain(&mut self) -> Vec<ProcedureRef> {
        self.map.drain().map(|(_, v)| v).collect()
    }
}

struct PeerInner<W> {
    agent: Arc<Agent>,
    state: StdMutex<PeerState>,
    transport: StdMutex<Option<Arc<Transport<W>>>>,
    callbacks: StdMutex<CallbackTable>,
    proxies: StdMutex<HashMap<String, ProcedureRef>>,
    events: broadcast::Sender<PeerEvent>,
    /// The currently spawned `dispatch_loop` for the bound transport, if
    /// any. Aborted whenever a new generation is spawned (`connect`) or
    /// the current one is torn down (`disconnect_inner`), so at most one
    /// dispatch loop is ever driving this Peer's shared state — see
    /// spec §5's single-threaded-dispatch-per-Peer guarantee and §4.3's
    /// "detach all Peer-installed listeners" teardown requirement.
    dispatch_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Local view of the remote side of a [`Transport`]. Cheaply cloneable —
/// clones share the same underlying state.
pub struct Peer<W> {
    inner: Arc<PeerInner<W>>,
}

impl<W> Clone for Peer<W> {
    fn clone(&self) -> Self {
        Peer {
            inner: self.inner.clone(),
        }
    }
}

struct StoreCtx<W>(Arc<PeerInner<W>>);

impl<W> StoreFunction for StoreCtx<W> {
    fn store(&mut self, proc: ProcedureRef) -> Result<u32> {
        self.0.callbacks.lock().unwrap().store(proc)
    }
}

struct GetCtx<W>(Arc<PeerInner<W>>);

impl<W> GetFunction for GetCtx<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Build an ad-hoc proxy for a handle the far side just registered.
    /// Invoking it sends `[key, ...args]` — the dual of a published-name
    /// proxy, which sends `[name, ...args]`.
    fn get(&mut self, key: u32) -> ProcedureRef {
        let inner = self.0.clone();
        procedure(move |args| {
            let inner = inner.clone();
            async move {
                let message = Value::array(std::iter::once(Value::Int(key as i64)).chain(args).collect());
                if let Err(e) = send_value(&inner, &message).await {
                    warn!(error = %e, "callback proxy send failed");
                }
            }
        })
    }
}

impl<W> Peer<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub(crate) fn new(agent: Arc<Agent>) -> Self {
        let (events, _rx) = broadcast::channel(64);
        Peer {
            inner: Arc::new(PeerInner {
                agent,
                state: StdMutex::new(PeerState::Idle),
                transport: StdMutex::new(None),
                callbacks: StdMutex::new(CallbackTable::new()),
                proxies: StdMutex::new(HashMap::new()),
                events,
                dispatch_task: StdMutex::new(None),
            }),
        }
    }

    /// Bind (or rebind, on reconnect) a fresh [`Transport`], arm a fresh
    /// callback table, and send the handshake. The proxy table survives
    /// across rebinds on the same `Peer`.
    ///
    /// Aborts any previously spawned dispatch loop first — otherwise a
    /// stale generation bound to the old transport would keep dispatching
    /// inbound messages against the same shared callback/proxy tables as
    /// the freshly spawned one.
    pub async fn connect(&self, transport: Transport<W>) -> Result<()> {
        let transport = Arc::new(transport);
        if let Some(previous) = self.inner.dispatch_task.lock().unwrap().take() {
            previous.abort();
        }
        *self.inner.callbacks.lock().unwrap() = CallbackTable::new();
        *self.inner.transport.lock().unwrap() = Some(transport.clone());
        *self.inner.state.lock().unwrap() = PeerState::Connecting;

        let handle = tokio::spawn(dispatch_loop(self.inner.clone(), transport));
        *self.inner.dispatch_task.lock().unwrap() = Some(handle);

        send_ready(&self.inner).await
    }

    /// Send a raw application message (dispatch identifier followed by
    /// arguments). Most callers invoke a proxy from [`Peer::api`] instead.
    pub async fn send(&self, message: Vec<Value>) -> Result<bool> {
        send_value(&self.inner, &Value::array(message)).await
    }

    /// Idempotent teardown: detaches the transport, flushes every
    /// outstanding callback with an error, and emits `Disconnect`.
    pub async fn disconnect(&self, err: Option<Error>) {
        let bound = self.inner.transport.lock().unwrap().is_some();
        if !bound {
            let reported = err.unwrap_or(Error::NotConnected);
            let _ = self.inner.events.send(PeerEvent::Error(reported));
            return;
        }
        disconnect_inner(&self.inner, err).await;
    }

    pub fn state(&self) -> PeerState {
        *self.inner.state.lock().unwrap()
    }

    /// Snapshot of the currently installed proxies, keyed by the far
    /// side's published name.
    pub fn api(&self) -> HashMap<String, ProcedureRef> {
        self.inner.proxies.lock().unwrap().clone()
    }

    pub fn events(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.events.subscribe()
    }
}

async fn send_value<W>(inner: &Arc<PeerInner<W>>, message: &Value) -> Result<bool>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let transport = inner.transport.lock().unwrap().clone();
    let Some(transport) = transport else {
        return Err(Error::NotConnected);
    };
    let mut store = StoreCtx(inner.clone());
    let wire = marshal::freeze(message, &mut store)?;
    transport.send(&wire).await
}

async fn send_ready<W>(inner: &Arc<PeerInner<W>>) -> Result<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let handshake_inner = inner.clone();
    let ready_cb = procedure(move |args| {
        let inner = handshake_inner.clone();
        async move {
            install_proxies_and_go_live(&inner, args).await;
        }
    });
    let message = Value::array(vec![Value::str("ready"), Value::Procedure(ready_cb)]);
    send_value(inner, &message).await.map(|_| ())
}

async fn install_proxies_and_go_live<W>(inner: &Arc<PeerInner<W>>, args: Vec<Value>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let names = match args.into_iter().next() {
        Some(Value::Array(arr)) => arr
            .read()
            .unwrap()
            .iter()
            .filter_map(|v| match v {
                Value::Str(s) => Some(s.clone()),
                _ => None,
            })
            .collect::<Vec<_>>(),
        _ => Vec::new(),
    };

    {
        let mut proxies = inner.proxies.lock().unwrap();
        for name in names {
            proxies
                .entry(name.clone())
                .or_insert_with(|| make_proxy(inner.clone(), name));
        }
    }

    *inner.state.lock().unwrap() = PeerState::Live;
    let _ = inner.events.send(PeerEvent::Connect);
}

fn make_proxy<W>(inner: Arc<PeerInner<W>>, name: String) -> ProcedureRef
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    procedure(move |mut args| {
        let inner = inner.clone();
        let name = name.clone();
        async move {
            let live = *inner.state.lock().unwrap() == PeerState::Live;
            if !live {
                if matches!(args.last(), Some(Value::Procedure(_))) {
                    if let Some(Value::Procedure(cb)) = args.pop() {
                        cb.call(vec![Value::str(ENOTCONNECTED)]).await;
                    }
                }
                return;
            }

            let mut message_args = vec![Value::str(name)];
            message_args.extend(args);
            if let Err(e) = send_value(&inner, &Value::array(message_args)).await {
                warn!(error = %e, "proxy send failed");
            }
        }
    })
}

async fn dispatch_loop<W>(inner: Arc<PeerInner<W>>, transport: Arc<Transport<W>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        match transport.recv().await {
            Some(TransportEvent::Message(wire)) => handle_inbound(&inner, wire).await,
            Some(TransportEvent::Drain) => {
                let _ = inner.events.send(PeerEvent::Drain);
            }
            Some(TransportEvent::Disconnect(err)) => {
                disconnect_inner(&inner, err).await;
                break;
            }
            None => {
                disconnect_inner(&inner, None).await;
                break;
            }
        }
    }
}

async fn handle_inbound<W>(inner: &Arc<PeerInner<W>>, wire: WireValue)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    if !matches!(wire, WireValue::Array(_)) {
        emit_protocol_violation(inner, "message must be a sequence").await;
        return;
    }

    let mut get = GetCtx(inner.clone());
    let value = match marshal::liven(&wire, &mut get) {
        Ok(value) => value,
        Err(e) => {
            emit_protocol_violation(inner, &e.to_string()).await;
            return;
        }
    };
    let Value::Array(items) = value else {
        unreachable!("liven of a WireValue::Array always yields Value::Array");
    };
    let mut items = items.read().unwrap().clone();
    if items.is_empty() {
        emit_protocol_violation(inner, "empty message").await;
        return;
    }
    let id = items.remove(0);

    if let Value::Str(s) = &id {
        if s == "ready" {
            handle_ready_request(inner, items).await;
            return;
        }
    }

    let callable = match &id {
        Value::Str(name) => inner.agent.lookup(name),
        Value::Int(i) if *i >= 0 && *i <= u32::MAX as i64 => {
            inner.callbacks.lock().unwrap().take(*i as u32)
        }
        _ => None,
    };

    match callable {
        Some(proc) => {
            tokio::spawn(async move {
                proc.call(items).await;
            });
        }
        None => {
            emit_protocol_violation(inner, "unknown dispatch identifier").await;
        }
    }
}

async fn handle_ready_request<W>(inner: &Arc<PeerInner<W>>, mut args: Vec<Value>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    if args.is_empty() {
        emit_protocol_violation(inner, "ready handshake missing reply callback").await;
        return;
    }
    let Value::Procedure(cb) = args.remove(0) else {
        emit_protocol_violation(inner, "ready handshake argument is not callable").await;
        return;
    };
    let names = inner.agent.procedure_names();
    tokio::spawn(async move {
        cb.call(vec![Value::array(names.into_iter().map(Value::Str).collect())])
            .await;
    });
}

async fn emit_protocol_violation<W>(inner: &Arc<PeerInner<W>>, message: &str)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let err = Error::Protocol(message.to_string());
    let _ = inner.events.send(PeerEvent::Error(err.clone()));
    disconnect_inner(inner, Some(err)).await;
}

async fn disconnect_inner<W>(inner: &Arc<PeerInner<W>>, err: Option<Error>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let transport = inner.transport.lock().unwrap().take();
    if transport.is_none() {
        return;
    }

    if let Some(handle) = inner.dispatch_task.lock().unwrap().take() {
        handle.abort();
    }

    let flushed = inner.callbacks.lock().unwrap().drain();
    let disconnect_err = err.clone().unwrap_or(Error::Disconnect(None));
    for cb in flushed {
        let disconnect_err = disconnect_err.clone();
        tokio::spawn(async move {
            cb.call(vec![Value::str(disconnect_err.to_string())]).await;
        });
    }

    *inner.state.lock().unwrap() = PeerState::Disconnected;
    let _ = inner.events.send(PeerEvent::Disconnect(err));
}
