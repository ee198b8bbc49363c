//! An Agent binds a name→procedure registry and is the factory that turns
//! a [`Transport`] into a [`Peer`], per spec §2 and §4.3's connection-timeout
//! policy.

use crate::error::{Error, Result};
use crate::peer::{Peer, PeerEvent};
use crate::transport::Transport;
use crate::value::ProcedureRef;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tracing::debug;

/// Default connection-handshake timeout, per spec §4.3/§5.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A local registry of published procedures. Immutable once built —
/// construct with [`Agent::builder`].
pub struct Agent {
    registry: HashMap<String, ProcedureRef>,
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<ProcedureRef> {
        self.registry.get(name).cloned()
    }

    pub(crate) fn procedure_names(&self) -> Vec<String> {
        self.registry.keys().cloned().collect()
    }

    /// Produce a [`Peer`] bound to `transport`, waiting up to the default
    /// handshake timeout for the connection to go live.
    pub async fn connect<W>(self: Arc<Self>, transport: Transport<W>) -> Result<Peer<W>>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.connect_with_timeout(transport, DEFAULT_HANDSHAKE_TIMEOUT)
            .await
    }

    /// As [`Agent::connect`], with an explicit handshake timeout.
    pub async fn connect_with_timeout<W>(
        self: Arc<Self>,
        transport: Transport<W>,
        timeout: Duration,
    ) -> Result<Peer<W>>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let peer = Peer::new(self.clone());
        let mut events = peer.events();

        peer.connect(transport).await?;

        let wait_for_handshake = async {
            loop {
                match events.recv().await {
                    Ok(PeerEvent::Connect) => return Ok(()),
                    Ok(PeerEvent::Disconnect(err)) => {
                        return Err(err.unwrap_or(Error::Disconnect(None)))
                    }
                    Ok(PeerEvent::Error(_)) | Ok(PeerEvent::Drain) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        return Err(Error::Disconnect(None))
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, wait_for_handshake).await {
            Ok(Ok(())) => Ok(peer),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                debug!(?timeout, "handshake timed out");
                peer.disconnect(None).await;
                Err(Error::HandshakeTimeout)
            }
        }
    }
}

/// Builder for [`Agent`], mirroring the rest of this crate's builder
/// conventions.
#[derive(Default)]
pub struct AgentBuilder {
    registry: HashMap<String, ProcedureRef>,
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self {
            registry: HashMap::new(),
        }
    }

    /// Publish `proc` under `name`. Later calls with the same name replace
    /// the earlier one.
    pub fn publish(mut self, name: impl Into<String>, proc: ProcedureRef) -> Self {
        self.registry.insert(name.into(), proc);
        self
    }

    pub fn build(self) -> Arc<Agent> {
        Arc::new(Agent {
            registry: self.registry,
        })
    }
}
