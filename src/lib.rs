pub mod acceptor;
pub mod config;
pub mod connection;
pub mod contracts;
pub mod diagnostics;
pub mod error;
pub mod four_letter;
pub mod frame;
pub mod records;
pub mod registry;
pub mod stats;

pub use acceptor::{run_single_reactor, Acceptor};
pub use config::{ServerConfig, ServerConfigBuilder};
pub use connection::ConnectionHandle;
pub use contracts::{
    AuthFailure, AuthProvider, AuthRegistry, Identity, RequestProcessor, SessionOutcome,
    UpwardRequest,
};
pub use error::{AcceptorError, ConnectionError, Error, FrameError, Result};
pub use four_letter::FourLetterWord;
pub use frame::{FrameCodec, FrameOutcome};
pub use records::{
    AuthPacket, ConnectRequest, ConnectResponse, Decodable, Encodable, ReplyHeader, RequestHeader,
    WatcherEvent,
};
pub use registry::ConnectionRegistry;
pub use stats::{ConnectionStats, ServerStats};

#[cfg(any(test, feature = "test-util"))]
pub use contracts::mock;
