// Transport module: capability trait and the in-process hub

pub mod abstraction;
pub mod local;

pub use abstraction::{BytesCallback, InboundFrame, MeshTransport, TransportError};
pub use local::{LocalHub, LocalTransport};
