//! Outrigger Core
//!
//! Runtime-agnostic building blocks of the RPC runtime:
//! - SAX-style archive contract and failure taxonomy (`archive`, `error`)
//! - Per-type metadata registry and reflection drivers (`meta`, `types`)
//! - Type-erased object views (`view`)
//! - Byte-stream transport and executor capabilities (`transport`, `exec`)
//! - Service routing with pooled parameter buffers (`service`, `pool`)
//! - Per-peer session state machine (`session`, `proxy`, `protocol`)
//! - Notify fan-out groups and observability hooks (`group`, `monitor`)
//!
//! Wire protocols (msgpack-rpc in `outrigger-msgpack`) and concrete
//! transports/executors (in `outrigger`) plug in through the `protocol`,
//! `transport`, and `exec` contracts.

pub mod archive;
pub mod error;
pub mod exec;
pub mod group;
pub mod meta;
pub mod monitor;
pub mod pool;
pub mod profile;
pub mod protocol;
pub mod proxy;
pub mod service;
pub mod session;
pub mod signature;
pub mod transport;
pub mod types;
pub mod view;

/// Ergonomic re-exports for downstream crates.
pub mod prelude {
    pub use crate::archive::{ArchiveConfig, ArchiveRead, ArchiveWrite, ContextKey, EntityType};
    pub use crate::error::{ArchiveError, HandlerError, ProtocolState, RpcError, StreamError};
    pub use crate::exec::{EventProc, Task};
    pub use crate::group::SessionGroup;
    pub use crate::meta::{
        object_factory, tuple_factory, type_metadata, Reflect, TypeMetadata,
    };
    pub use crate::monitor::{Monitor, NullMonitor, TracingMonitor};
    pub use crate::profile::SessionProfile;
    pub use crate::protocol::ProtocolAdapter;
    pub use crate::service::{Service, ServiceBuilder};
    pub use crate::session::{RequestHandle, Session, SessionBuilder};
    pub use crate::signature::Signature;
    pub use crate::transport::ByteStream;
    pub use crate::types::Blob;
    pub use crate::view::{BoxedObject, ObjectConstView, ObjectView, SharedObject};
}
