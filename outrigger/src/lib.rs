//! # Outrigger
//!
//! A bidirectional, concurrent RPC runtime built on a reflection-driven
//! serialization layer.
//!
//! ## Architecture
//!
//! Outrigger is structured as an **RPC kernel** with clean layering:
//!
//! - **`outrigger-core`**: archive contract, metadata registry, object
//!   views, session state machine, service routing, fan-out groups
//! - **Protocol crates**: pure framing over the archive contract
//!   (`outrigger-msgpack` ships msgpack-rpc)
//! - **`outrigger`**: public API surface plus reference transports
//!   (in-process pipe, TCP) and a reference worker-pool executor
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use outrigger::prelude::*;
//! use outrigger::{pipe::pipe, worker::WorkerPool};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let exec = WorkerPool::with_default_workers();
//! let (client_end, server_end) = pipe();
//!
//! // Shared typed signature: String echo(String)
//! let echo = Signature::<String, (String,)>::new("echo");
//!
//! let service = ServiceBuilder::new()
//!     .route(&echo, |text: &String| text.clone())?
//!     .build();
//!
//! let _server = SessionBuilder::new(server_end, MsgpackRpc::new(), exec.clone())
//!     .service(service)
//!     .build();
//! let client = SessionBuilder::new(client_end, MsgpackRpc::new(), exec)
//!     .enable_request()
//!     .build();
//!
//! let reply = echo.request(&client, &("hello".to_string(),))?;
//! assert_eq!(reply, "hello");
//! # Ok(())
//! # }
//! ```

pub mod pipe;
pub mod tcp;
pub mod worker;

pub use outrigger_core::{
    archive, error, exec, group, meta, monitor, pool, profile, protocol, proxy, service, session,
    signature, transport, types, view,
};
// `refl_field!` is exported at the core crate root; forward it here.
pub use outrigger_core::refl_field;
pub use outrigger_msgpack::{MsgpackRpc, Reader as MsgpackReader, Writer as MsgpackWriter};

/// Ergonomic re-exports covering the embedding API.
pub mod prelude {
    pub use outrigger_core::prelude::*;
    pub use outrigger_msgpack::MsgpackRpc;

    pub use crate::pipe::{pipe, PipeTransport};
    pub use crate::tcp::TcpTransport;
    pub use crate::worker::WorkerPool;
}
