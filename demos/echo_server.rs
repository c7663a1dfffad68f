// ABOUTME: Runnable demo wiring a trivial in-memory pipeline against the acceptor
// ABOUTME: Every request is echoed back with a zero error code; watches are never fired

use bytes::Bytes;
use cnxn_gateway::{
    run_single_reactor, AuthRegistry, ConnectionHandle, ReplyHeader, RequestProcessor,
    ServerConfig, ServerStats, SessionOutcome, UpwardRequest,
};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

struct EchoProcessor {
    next_session_id: AtomicI64,
    zxid: AtomicI64,
    sessions: Mutex<Vec<ConnectionHandle>>,
}

impl EchoProcessor {
    fn new() -> Self {
        EchoProcessor {
            next_session_id: AtomicI64::new(1),
            zxid: AtomicI64::new(0),
            sessions: Mutex::new(Vec::new()),
        }
    }
}

impl RequestProcessor for EchoProcessor {
    fn submit_request(&self, req: UpwardRequest) {
        let zxid = self.zxid.fetch_add(1, Ordering::SeqCst) + 1;
        req.cnxn.send_response(ReplyHeader { xid: req.xid, zxid, err: 0 }, None);
    }

    async fn create_session(&self, passwd: Bytes, timeout: i32) -> SessionOutcome {
        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        SessionOutcome { valid: true, session_id, passwd, timeout }
    }

    async fn reopen_session(&self, session_id: i64, passwd: Bytes, timeout: i32) -> SessionOutcome {
        SessionOutcome { valid: true, session_id, passwd, timeout }
    }

    fn get_in_process(&self) -> i32 {
        0
    }

    fn get_global_outstanding_limit(&self) -> i32 {
        1_000
    }

    fn get_min_session_timeout(&self) -> i32 {
        4_000
    }

    fn get_max_session_timeout(&self) -> i32 {
        40_000
    }

    fn last_processed_zxid(&self) -> i64 {
        self.zxid.load(Ordering::SeqCst)
    }

    fn remove_cnxn(&self, _session_id: i64) {}

    fn is_serving(&self) -> bool {
        true
    }

    fn server_stats(&self) -> ServerStats {
        ServerStats::new("echo-demo-0.1")
    }

    fn reset_server_stats(&self) {}

    fn node_count(&self) -> i64 {
        self.sessions.lock().unwrap().len() as i64
    }

    fn dump_conf(&self) -> String {
        "echo demo, no configuration\n".to_string()
    }

    fn dump_ephemerals(&self) -> String {
        "Sessions with Ephemerals (0):\n".to_string()
    }

    fn dump_session_tracker(&self) -> String {
        "SessionTracker dump: echo demo\n".to_string()
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

fn main() {
    tracing_subscriber::fmt::init();

    let config = ServerConfig::builder("127.0.0.1:2181".parse().unwrap()).build();
    let processor = Arc::new(EchoProcessor::new());
    let auth_registry = Arc::new(AuthRegistry::new());

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(e) = run_single_reactor(config, processor, auth_registry, shutdown) {
        eprintln!("echo server exited with error: {e}");
        std::process::exit(1);
    }
}
