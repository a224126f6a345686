//! HTTP stats server for traffic monitoring.
//!
//! Serves the traffic counters as JSON and lets an operator zero them.
//! Uses `tiny_http` which works on both host and ESP32 (via std::net).
//!
//! | Request | Response |
//! |---|---|
//! | `GET /stats` | counters as JSON |
//! | `POST /stats/reset` | counters zeroed, then returned |
//! | `GET /` | redirect to `/stats` |
//!
//! # Example Response
//!
//! ```json
//! {
//!   "uptime_secs": 3600,
//!   "tracked_nodes": 42,
//!   "traffic": {
//!     "packets_inspected": 1520,
//!     "position_dedup_drops": 87,
//!     "rate_limit_drops": 4,
//!     "unknown_packet_drops": 12,
//!     "nodeinfo_cache_hits": 9,
//!     "hop_exhausted_packets": 130,
//!     "router_hops_preserved": 0
//!   }
//! }
//! ```

use log::{error, info, warn};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tiny_http::{Header, Method, Request, Response, Server};

use crate::traffic::{Clock, MeshServices, TrafficManager, TrafficStats};

/// Default port for the stats server.
pub const DEFAULT_STATS_PORT: u16 = 8080;

/// Anything whose traffic counters can be served.
pub trait StatsSource {
    /// Current counters.
    fn stats(&self) -> TrafficStats;
    /// Zero the counters.
    fn reset_stats(&self);
    /// Nodes currently tracked by the cache.
    fn tracked_nodes(&self) -> usize;
}

impl<M: MeshServices, C: Clock> StatsSource for TrafficManager<M, C> {
    fn stats(&self) -> TrafficStats {
        TrafficManager::stats(self)
    }

    fn reset_stats(&self) {
        TrafficManager::reset_stats(self)
    }

    fn tracked_nodes(&self) -> usize {
        TrafficManager::tracked_nodes(self)
    }
}

#[derive(Serialize)]
struct StatsBody {
    uptime_secs: u64,
    tracked_nodes: usize,
    traffic: TrafficStats,
}

fn stats_json<S: StatsSource + ?Sized>(source: &S, started: Instant) -> String {
    let body = StatsBody {
        uptime_secs: started.elapsed().as_secs(),
        tracked_nodes: source.tracked_nodes(),
        traffic: source.stats(),
    };
    serde_json::to_string(&body).unwrap_or_else(|_| String::from("{}"))
}

/// HTTP stats server.
///
/// Runs in a background thread and serves traffic statistics as JSON.
pub struct StatsServer {
    /// Address actually bound (resolves port 0).
    local_addr: Option<SocketAddr>,
    /// Server thread handle.
    handle: Option<thread::JoinHandle<()>>,
    /// Flag to signal shutdown.
    shutdown: Arc<AtomicBool>,
}

impl StatsServer {
    /// Start the stats server.
    ///
    /// # Arguments
    ///
    /// * `bind_addr` - IP address to bind to (use `None` for 0.0.0.0)
    /// * `port` - Port to listen on (0 picks a free port)
    /// * `source` - Shared counters to serve
    ///
    /// # Returns
    ///
    /// A handle to the running server. Drop it to stop the server.
    pub fn start<S>(bind_addr: Option<IpAddr>, port: u16, source: Arc<S>) -> Result<Self, std::io::Error>
    where
        S: StatsSource + Send + Sync + 'static,
    {
        let addr = match bind_addr {
            Some(ip) => format!("{}:{}", ip, port),
            None => format!("0.0.0.0:{}", port),
        };

        let server = Server::http(&addr)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::AddrInUse, format!("{}", e)))?;
        let local_addr = server.server_addr().to_ip();

        match local_addr {
            Some(bound) => info!("Stats server listening on http://{}/stats", bound),
            None => info!("Stats server listening on http://{}/stats", addr),
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let handle = thread::spawn(move || {
            Self::run_server(server, source, shutdown_clone);
        });

        Ok(Self {
            local_addr,
            handle: Some(handle),
            shutdown,
        })
    }

    /// Address the server is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Run the server loop.
    fn run_server<S: StatsSource + ?Sized>(server: Server, source: Arc<S>, shutdown: Arc<AtomicBool>) {
        let started = Instant::now();

        loop {
            // Acquire pairs with the Release store in stop()
            if shutdown.load(Ordering::Acquire) {
                info!("Stats server shutting down");
                break;
            }

            match server.recv_timeout(Duration::from_millis(100)) {
                Ok(Some(request)) => Self::handle(request, source.as_ref(), started),
                Ok(None) => {
                    // Timeout, check shutdown flag and continue
                }
                Err(e) => {
                    error!("Server error: {}", e);
                    break;
                }
            }
        }
    }

    fn handle<S: StatsSource + ?Sized>(request: Request, source: &S, started: Instant) {
        let path = request.url().trim_end_matches('/').to_string();
        let method = request.method().clone();

        let response = match (path.as_str(), method) {
            ("/stats", Method::Get) => json_response(stats_json(source, started)),
            ("/stats/reset", Method::Post) => {
                source.reset_stats();
                info!("Traffic stats reset over HTTP");
                json_response(stats_json(source, started))
            }
            ("", Method::Get) => with_header(
                Response::from_string("See /stats for traffic statistics").with_status_code(302),
                "Location",
                "/stats",
            ),
            ("/stats", _) | ("", _) => method_not_allowed("GET"),
            ("/stats/reset", _) => method_not_allowed("POST"),
            _ => Response::from_string("Not Found").with_status_code(404),
        };

        if let Err(e) = request.respond(response) {
            warn!("Failed to send response to {}: {}", path, e);
        }
    }

    /// Stop the server.
    ///
    /// Note: May take up to 100ms due to polling interval.
    pub fn stop(&mut self) {
        // Release so the server thread sees this write
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Attach a header; the static names and values used here always parse.
fn with_header<R: std::io::Read>(response: Response<R>, name: &str, value: &str) -> Response<R> {
    match Header::from_bytes(name.as_bytes(), value.as_bytes()) {
        Ok(header) => response.with_header(header),
        Err(_) => response,
    }
}

fn json_response(body: String) -> Response<std::io::Cursor<Vec<u8>>> {
    with_header(Response::from_string(body), "Content-Type", "application/json").with_status_code(200)
}

fn method_not_allowed(allow: &str) -> Response<std::io::Cursor<Vec<u8>>> {
    with_header(
        Response::from_string("Method Not Allowed").with_status_code(405),
        "Allow",
        allow,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpStream};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FixedSource {
        stats: Mutex<TrafficStats>,
    }

    impl StatsSource for FixedSource {
        fn stats(&self) -> TrafficStats {
            *self.stats.lock().unwrap()
        }

        fn reset_stats(&self) {
            *self.stats.lock().unwrap() = TrafficStats::default();
        }

        fn tracked_nodes(&self) -> usize {
            7
        }
    }

    fn source() -> Arc<FixedSource> {
        let source = FixedSource::default();
        {
            let mut stats = source.stats.lock().unwrap();
            stats.packets_inspected = 12;
            stats.rate_limit_drops = 3;
        }
        Arc::new(source)
    }

    fn start(source: Arc<FixedSource>) -> StatsServer {
        StatsServer::start(Some(IpAddr::V4(Ipv4Addr::LOCALHOST)), 0, source).unwrap()
    }

    fn send(server: &StatsServer, method: &str, path: &str) -> String {
        let addr = server.local_addr().unwrap();
        let mut stream = TcpStream::connect(addr).unwrap();
        write!(
            stream,
            "{} {} HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            method, path
        )
        .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    #[test]
    fn test_stats_json_body() {
        let source = source();
        let json = stats_json(source.as_ref(), Instant::now());
        assert!(json.contains("\"tracked_nodes\":7"));
        assert!(json.contains("\"packets_inspected\":12"));
        assert!(json.contains("\"uptime_secs\":0"));
    }

    #[test]
    fn test_get_stats() {
        let server = start(source());
        let response = send(&server, "GET", "/stats");
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("application/json"));
        assert!(response.contains("\"rate_limit_drops\":3"));
    }

    #[test]
    fn test_reset_stats() {
        let source = source();
        let server = start(source.clone());
        let response = send(&server, "POST", "/stats/reset");
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("\"packets_inspected\":0"));
        assert_eq!(source.stats(), TrafficStats::default());
    }

    #[test]
    fn test_root_redirects() {
        let server = start(source());
        let response = send(&server, "GET", "/");
        assert!(response.starts_with("HTTP/1.1 302"));
        assert!(response.contains("Location: /stats"));
    }

    #[test]
    fn test_wrong_method_and_path() {
        let server = start(source());
        assert!(send(&server, "POST", "/stats").starts_with("HTTP/1.1 405"));
        assert!(send(&server, "GET", "/stats/reset").starts_with("HTTP/1.1 405"));
        assert!(send(&server, "GET", "/nope").starts_with("HTTP/1.1 404"));
    }
}
