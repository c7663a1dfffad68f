// ABOUTME: Upward interfaces this layer consumes from its collaborators
// ABOUTME: The request pipeline, session tracker, and auth registry are all external; only traits live here

use crate::connection::ConnectionHandle;
use crate::stats::ServerStats;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;

/// An authenticated identity attached to a connection. Every connection
/// begins with an `ip`-scheme identity derived from its remote address;
/// further identities are appended by successful `auth` packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub scheme: String,
    pub id: String,
}

impl Identity {
    pub fn ip(addr: std::net::IpAddr) -> Self {
        Identity {
            scheme: "ip".to_string(),
            id: addr.to_string(),
        }
    }
}

/// An opaque request handed up to the pipeline. Everything past the
/// header is a pass-through slice; this layer never interprets operation
/// bodies.
#[derive(Debug, Clone)]
pub struct UpwardRequest {
    pub cnxn: ConnectionHandle,
    pub session_id: i64,
    pub xid: i32,
    pub op_type: i32,
    pub payload: Bytes,
    pub auth: Vec<Identity>,
}

/// Outcome of a `create_session`/`reopen_session` call. The pipeline
/// completes the handshake by returning the decided session parameters
/// rather than calling back into the connection (see DESIGN.md).
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub valid: bool,
    pub session_id: i64,
    pub passwd: Bytes,
    pub timeout: i32,
}

impl SessionOutcome {
    pub fn rejected() -> Self {
        SessionOutcome {
            valid: false,
            session_id: 0,
            passwd: Bytes::new(),
            timeout: 0,
        }
    }
}

/// The request-execution pipeline this layer submits work to. An external
/// collaborator; this crate only depends on this trait.
///
/// Implemented with a native `async fn` rather than `#[async_trait]`: every
/// caller is generic over `P: RequestProcessor`, so no trait object /
/// dyn-compatibility concern arises — upward contracts are never
/// type-erased in this crate.
pub trait RequestProcessor: Send + Sync {
    /// Enqueue an opaque request onto the pipeline.
    fn submit_request(&self, req: UpwardRequest);

    /// Create a brand new session for a connection whose `ConnectRequest`
    /// carried `session_id == 0`.
    fn create_session(
        &self,
        passwd: Bytes,
        timeout: i32,
    ) -> impl std::future::Future<Output = SessionOutcome> + Send;

    /// Reopen an existing session. The pipeline is responsible for first
    /// closing any other connection already bound to `session_id`.
    fn reopen_session(
        &self,
        session_id: i64,
        passwd: Bytes,
        timeout: i32,
    ) -> impl std::future::Future<Output = SessionOutcome> + Send;

    /// Current global in-flight request count, read for backpressure
    /// decisions.
    fn get_in_process(&self) -> i32;

    fn get_global_outstanding_limit(&self) -> i32;
    fn get_min_session_timeout(&self) -> i32;
    fn get_max_session_timeout(&self) -> i32;

    /// The server's last processed zxid, compared against a handshake's
    /// proposed `last_zxid_seen`.
    fn last_processed_zxid(&self) -> i64;

    fn remove_cnxn(&self, session_id: i64);

    /// `false` when there is no pipeline to serve requests yet; diagnostic
    /// responders fall back to a fixed "not currently serving" string.
    fn is_serving(&self) -> bool;

    fn server_stats(&self) -> ServerStats;
    fn reset_server_stats(&self);
    fn node_count(&self) -> i64;
    fn dump_conf(&self) -> String;
    fn dump_ephemerals(&self) -> String;
    fn dump_session_tracker(&self) -> String;
    fn dump_watch_summary(&self) -> String;
    fn dump_watches_by_session(&self) -> String;
    fn dump_watches_by_path(&self) -> String;
}

/// Returned by an `AuthProvider` when credentials are rejected.
#[derive(Debug, Clone)]
pub struct AuthFailure(pub String);

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "authentication failed: {}", self.0)
    }
}

impl std::error::Error for AuthFailure {}

/// A pluggable authentication scheme. Dyn-compatible, since the registry
/// holds heterogeneous providers keyed by scheme name and validation is
/// synchronous.
pub trait AuthProvider: Send + Sync {
    fn scheme(&self) -> &str;
    fn handle(&self, auth_data: &[u8]) -> Result<Identity, AuthFailure>;
}

/// Maps a scheme name (from an `AuthPacket`) to its provider.
#[derive(Default)]
pub struct AuthRegistry {
    providers: HashMap<String, Box<dyn AuthProvider>>,
}

impl AuthRegistry {
    pub fn new() -> Self {
        AuthRegistry {
            providers: HashMap::new(),
        }
    }

    pub fn register(&mut self, provider: Box<dyn AuthProvider>) {
        self.providers.insert(provider.scheme().to_string(), provider);
    }

    pub fn authenticate(&self, scheme: &str, data: &[u8]) -> Result<Identity, AuthFailure> {
        match self.providers.get(scheme) {
            Some(provider) => provider.handle(data),
            None => Err(AuthFailure(format!("no provider registered for scheme {scheme}"))),
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    //! A minimal in-memory stand-in for the external request pipeline,
    //! used by this crate's own integration tests.

    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;

    pub struct MockProcessor {
        pub serving: bool,
        pub last_zxid: i64,
        pub min_timeout: i32,
        pub max_timeout: i32,
        pub outstanding_limit: i32,
        in_process: AtomicI64,
        next_session_id: AtomicI64,
        pub submitted: Mutex<Vec<UpwardRequest>>,
    }

    impl MockProcessor {
        pub fn new() -> Self {
            MockProcessor {
                serving: true,
                last_zxid: 0,
                min_timeout: 4_000,
                max_timeout: 40_000,
                outstanding_limit: 1_000,
                in_process: AtomicI64::new(0),
                next_session_id: AtomicI64::new(1),
                submitted: Mutex::new(Vec::new()),
            }
        }

        pub fn set_in_process(&self, n: i64) {
            self.in_process.store(n, Ordering::SeqCst);
        }
    }

    impl Default for MockProcessor {
        fn default() -> Self {
            Self::new()
        }
    }

    impl RequestProcessor for MockProcessor {
        fn submit_request(&self, req: UpwardRequest) {
            self.submitted.lock().unwrap().push(req);
        }

        async fn create_session(&self, passwd: Bytes, timeout: i32) -> SessionOutcome {
            let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
            SessionOutcome {
                valid: true,
                session_id: id,
                passwd,
                timeout,
            }
        }

        async fn reopen_session(&self, session_id: i64, passwd: Bytes, timeout: i32) -> SessionOutcome {
            SessionOutcome {
                valid: true,
                session_id,
                passwd,
                timeout,
            }
        }

        fn get_in_process(&self) -> i32 {
            self.in_process.load(Ordering::SeqCst) as i32
        }

        fn get_global_outstanding_limit(&self) -> i32 {
            self.outstanding_limit
        }

        fn get_min_session_timeout(&self) -> i32 {
            self.min_timeout
        }

        fn get_max_session_timeout(&self) -> i32 {
            self.max_timeout
        }

        fn last_processed_zxid(&self) -> i64 {
            self.last_zxid
        }

        fn remove_cnxn(&self, _session_id: i64) {}

        fn is_serving(&self) -> bool {
            self.serving
        }

        fn server_stats(&self) -> ServerStats {
            ServerStats::new("mock-0.0")
        }

        fn reset_server_stats(&self) {}

        fn node_count(&self) -> i64 {
            0
        }

        fn dump_conf(&self) -> String {
            "mock configuration\n".to_string()
        }

        fn dump_ephemerals(&self) -> String {
            "Sessions with Ephemerals (0):\n".to_string()
        }

        fn dump_session_tracker(&self) -> String {
            "SessionTracker dump:\n".to_string()
        }

        fn dump_watch_summary(&self) -> String {
            "WatchSummary: 0\n".to_string()
        }

        fn dump_watches_by_session(&self) -> String {
            "WatchesBySession:\n".to_string()
        }

        fn dump_watches_by_path(&self) -> String {
            "WatchesByPath:\n".to_string()
        }
    }
}
