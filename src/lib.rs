//! A symmetric, bidirectional, message-oriented RPC mesh between two peer
//! agents connected by a duplex binary byte stream.
//!
//! Each [`Agent`] publishes a set of named procedures. Once two agents are
//! connected over a [`Transport`], each obtains [`Peer::api`] — proxies for
//! the other side's published procedures — and may invoke them while
//! simultaneously serving its own. Call arguments may themselves be
//! procedures (callbacks); the far side receives those as invocable
//! proxies and results are delivered by invoking them.
//!
//! ```rust,no_run
//! use meshrpc::{Agent, Transport};
//! use meshrpc::value::{procedure, Value};
//!
//! # async fn example() -> meshrpc::Result<()> {
//! let agent = Agent::builder()
//!     .publish("add", procedure(|args| async move {
//!         let (Value::Int(x), Value::Int(y)) = (&args[0], &args[1]) else { return };
//!         if let Value::Procedure(cb) = &args[2] {
//!             cb.call(vec![Value::Null, Value::Int(x + y)]).await;
//!         }
//!     }))
//!     .build();
//!
//! let stream = tokio::net::TcpStream::connect("localhost:9000").await?;
//! let (r, w) = stream.into_split();
//! let peer = agent.connect(Transport::new(r, w)).await?;
//! # let _ = peer;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod error;
pub mod framer;
pub mod marshal;
pub mod peer;
pub mod transport;
pub mod value;
pub mod wire;

pub use agent::{Agent, AgentBuilder};
pub use error::{Error, Result};
pub use peer::{Peer, PeerEvent, PeerState};
pub use transport::{Transport, TransportEvent};
pub use value::Value;
