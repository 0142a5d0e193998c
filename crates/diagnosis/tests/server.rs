#[cfg(test)]
pub mod tests {
    use diagnosis::{
        ByteSink, CaptureError, Config, Diagnosis, DiagnosisError, DiagnosisServer, Facility,
        FacilityError, HttpSettings, NamedProfile, ProfileRegistry, ProfileSession, Recording, Resource, Route,
        TraceLayer, KEY_ENABLE, KEY_HTTP_ADDRESS, KEY_MODE,
    };
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread::{self, sleep, JoinHandle};
    use std::time::{Duration, Instant};
    use tokio_util::sync::CancellationToken;

    /// Writes `tick` lines every 20ms until stopped, then `end`.
    struct Ticker;

    impl Facility for Ticker {
        fn start(&self, sink: ByteSink) -> Result<Box<dyn Recording>, FacilityError> {
            let done = CancellationToken::new();
            {
                let sink = sink.clone();
                let done = done.clone();
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(Duration::from_millis(20));
                    loop {
                        tokio::select! {
                            _ = done.cancelled() => break,
                            _ = interval.tick() => {
                                if sink.write(b"tick\n".to_vec()).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
            Ok(Box::new(TickerRecording { sink, done }))
        }
    }

    struct TickerRecording {
        sink: ByteSink,
        done: CancellationToken,
    }

    impl Recording for TickerRecording {
        fn failed(&mut self) -> BoxFuture<'_, CaptureError> {
            async move {
                self.sink.closed().await;
                CaptureError::StreamWriteFailed
            }
            .boxed()
        }

        fn stop(self: Box<Self>) -> BoxFuture<'static, Result<(), CaptureError>> {
            let TickerRecording { sink, done } = *self;
            done.cancel();
            async move { sink.write(b"end\n".to_vec()).await }.boxed()
        }
    }

    fn settings(write_timeout: Duration) -> HttpSettings {
        HttpSettings {
            address: "127.0.0.1:0".to_string(),
            write_timeout,
        }
    }

    fn ticker_server(write_timeout: Duration) -> DiagnosisServer {
        DiagnosisServer::new("test-app", &settings(write_timeout))
            .with_session(ProfileSession::new(Arc::new(Ticker), Arc::new(Ticker)))
    }

    struct Running {
        server: Arc<DiagnosisServer>,
        addr: SocketAddr,
        handle: Option<JoinHandle<Result<(), DiagnosisError>>>,
    }

    impl Running {
        fn url(&self, route: Route) -> String {
            route.to_url(self.addr)
        }

        fn shutdown(mut self) -> Result<(), DiagnosisError> {
            self.server.stop();
            match self.handle.take() {
                Some(handle) => handle.join().expect("server thread panicked"),
                None => Ok(()),
            }
        }
    }

    impl Drop for Running {
        fn drop(&mut self) {
            self.server.stop();
        }
    }

    fn start(server: DiagnosisServer) -> Running {
        let server = Arc::new(server);
        let runner = Arc::clone(&server);
        let handle = thread::spawn(move || runner.run());

        for _ in 0..250 {
            if let Some(addr) = server.local_addr() {
                return Running {
                    server,
                    addr,
                    handle: Some(handle),
                };
            }
            sleep(Duration::from_millis(20));
        }
        panic!("diagnosis server did not start listening");
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let started = Instant::now();
        while started.elapsed() < timeout {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(10));
        }
        condition()
    }

    fn get_text(url: &str) -> String {
        ureq::get(url)
            .call()
            .unwrap_or_else(|e| panic!("GET {url} failed: {e}"))
            .body_mut()
            .read_to_string()
            .expect("Failed to read response body")
    }

    fn status_of(result: Result<ureq::http::Response<ureq::Body>, ureq::Error>) -> u16 {
        match result {
            Ok(response) => response.status().as_u16(),
            Err(ureq::Error::StatusCode(code)) => code,
            Err(e) => panic!("request failed: {e}"),
        }
    }

    #[test]
    fn test_index_pages_list_profiles() {
        let running = start(ticker_server(Duration::from_secs(10)));

        let landing = get_text(&running.url(Route::Index));
        assert!(landing.contains("test-app diagnosis"));
        assert!(landing.contains("/diagnosis/pprof/"));

        let landing_slash = get_text(&format!("http://{}/diagnosis/", running.addr));
        assert_eq!(landing, landing_slash);

        let index = get_text(&running.url(Route::ProfileIndex));
        for name in ["allocs", "block", "goroutine", "heap", "mutex", "threads"] {
            assert!(
                index.contains(&format!("/diagnosis/pprof/{name}?debug=1")),
                "missing {name} in {index}"
            );
        }
        assert!(index.contains("/diagnosis/pprof/profile?seconds=30"));
        assert!(index.contains("/diagnosis/pprof/trace?seconds=1"));
    }

    #[test]
    fn test_named_profiles_and_unknown_paths() {
        let reclaims = Arc::new(AtomicUsize::new(0));
        let registry = {
            let reclaims = Arc::clone(&reclaims);
            ProfileRegistry::default().with_reclaim(move || {
                reclaims.fetch_add(1, Ordering::SeqCst);
            })
        };
        let running = start(ticker_server(Duration::from_secs(10)).with_registry(registry));
        let heap_url = running.url(Route::Profile {
            name: "heap".into(),
        });

        let mut response = ureq::get(&heap_url).call().expect("heap");
        assert_eq!(
            response
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok()),
            Some("application/json")
        );
        let body = response.body_mut().read_to_string().expect("heap body");
        let heap: serde_json::Value = serde_json::from_str(&body).expect("heap JSON");
        assert!(heap.is_object());
        assert_eq!(reclaims.load(Ordering::SeqCst), 0);

        get_text(&format!("{heap_url}?gc=1"));
        assert_eq!(reclaims.load(Ordering::SeqCst), 1);

        // gc only applies to heap
        get_text(&format!(
            "{}?gc=1&debug=1",
            running.url(Route::Profile {
                name: "allocs".into()
            })
        ));
        assert_eq!(reclaims.load(Ordering::SeqCst), 1);

        let unknown = ureq::get(&running.url(Route::Profile {
            name: "nosuchprofile".into(),
        }))
        .call();
        assert_eq!(status_of(unknown), 404);
        assert_eq!(reclaims.load(Ordering::SeqCst), 1);

        let outside = ureq::get(&format!("http://{}/metrics", running.addr)).call();
        assert_eq!(status_of(outside), 404);
    }

    #[test]
    fn test_cmdline_and_symbol_endpoints() {
        let running = start(ticker_server(Duration::from_secs(10)));

        let cmdline = get_text(&running.url(Route::Cmdline));
        assert!(!cmdline.is_empty());
        assert_eq!(
            cmdline.split('\0').count(),
            std::env::args_os().count(),
            "arguments are NUL separated"
        );

        let by_query = get_text(&format!("{}?0x0", running.url(Route::Symbol)));
        assert!(by_query.starts_with("num_symbols: 1\n"));

        let mut posted = ureq::post(&running.url(Route::Symbol))
            .send("nonsense+0x0")
            .expect("symbol POST");
        assert_eq!(
            posted.body_mut().read_to_string().expect("symbol body"),
            "num_symbols: 1\n"
        );
    }

    #[test]
    fn test_concurrent_capture_of_same_resource_gets_conflict() {
        let running = start(ticker_server(Duration::from_secs(10)));
        let trace_url = format!("{}?seconds=1", running.url(Route::Trace));

        let first = {
            let url = trace_url.clone();
            thread::spawn(move || get_text(&url))
        };
        assert!(wait_until(Duration::from_secs(5), || running
            .server
            .session()
            .is_active(Resource::Trace)));

        assert_eq!(status_of(ureq::get(&trace_url).call()), 409);

        // cpu is a separate resource
        let cpu = get_text(&format!("{}?seconds=0.2", running.url(Route::Cpu)));
        assert!(cpu.ends_with("end\n"));

        let body = first.join().expect("first capture");
        assert!(body.starts_with("tick\n"));
        assert!(body.ends_with("end\n"));
        assert!(!running.server.session().is_active(Resource::Trace));
    }

    #[test]
    fn test_client_disconnect_cancels_capture() {
        let running = start(ticker_server(Duration::from_secs(120)));

        let mut stream = TcpStream::connect(running.addr).expect("connect");
        write!(
            stream,
            "GET /diagnosis/pprof/trace?seconds=60 HTTP/1.1\r\nHost: localhost\r\n\r\n"
        )
        .expect("write request");
        let mut buf = [0u8; 256];
        let n = stream.read(&mut buf).expect("read response head");
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 200"));
        assert!(running.server.session().is_active(Resource::Trace));

        let dropped_at = Instant::now();
        drop(stream);

        assert!(
            wait_until(Duration::from_secs(5), || !running
                .server
                .session()
                .is_active(Resource::Trace)),
            "capture still running after client went away"
        );
        assert!(dropped_at.elapsed() < Duration::from_secs(5));

        // the resource is free again
        let body = get_text(&format!("{}?seconds=0.1", running.url(Route::Trace)));
        assert!(body.ends_with("end\n"));
    }

    #[test]
    fn test_write_timeout_truncates_and_cancels_capture() {
        let running = start(ticker_server(Duration::from_millis(300)));

        let started = Instant::now();
        let body = get_text(&format!("{}?seconds=30", running.url(Route::Trace)));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(body.starts_with("tick\n"));
        assert!(!body.ends_with("end\n"));

        assert!(wait_until(Duration::from_secs(5), || !running
            .server
            .session()
            .is_active(Resource::Trace)));
    }

    const BULK_BYTES: usize = 32 << 20;

    /// Larger than any socket buffer on the path to the client.
    struct Bulk;

    impl NamedProfile for Bulk {
        fn description(&self) -> &str {
            "bulk"
        }

        fn write_to(&self, out: &mut dyn Write, _debug: i32) -> std::io::Result<()> {
            out.write_all(&vec![b'x'; BULK_BYTES])
        }
    }

    #[test]
    fn test_client_that_stops_reading_is_dropped_after_write_timeout() {
        let running = start(
            DiagnosisServer::new("test-app", &settings(Duration::from_millis(300)))
                .with_registry(ProfileRegistry::default().register("bulk", Bulk)),
        );

        let mut stream = TcpStream::connect(running.addr).expect("connect");
        write!(
            stream,
            "GET /diagnosis/pprof/bulk HTTP/1.1\r\nHost: {}\r\n\r\n",
            running.addr
        )
        .expect("write request");
        // never read while the server is writing
        sleep(Duration::from_secs(2));

        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("read timeout");
        let mut received = 0usize;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => received += n,
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => break,
                Err(e) => panic!("connection still open after write timeout: {e}"),
            }
        }
        assert!(received > 0);
        assert!(received < BULK_BYTES, "received the whole body: {received}");

        // the server keeps serving others
        assert!(get_text(&running.url(Route::Index)).contains("test-app diagnosis"));
    }

    #[test]
    fn test_execution_trace_is_framed_json_lines() {
        use tracing_subscriber::prelude::*;
        let _ = tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(TraceLayer),
        );

        let running = start(DiagnosisServer::new(
            "test-app",
            &settings(Duration::from_secs(10)),
        ));
        let mut response = ureq::get(&format!("{}?seconds=0.3", running.url(Route::Trace)))
            .call()
            .expect("trace");
        assert_eq!(
            response
                .headers()
                .get("content-disposition")
                .and_then(|v| v.to_str().ok()),
            Some("attachment; filename=\"trace\"")
        );
        let body = response.body_mut().read_to_string().expect("trace body");

        let records: Vec<serde_json::Value> = body
            .lines()
            .map(|line| serde_json::from_str(line).expect("JSON line"))
            .collect();
        assert_eq!(records.first().map(|r| r["kind"].clone()), Some("start".into()));
        assert_eq!(records.last().map(|r| r["kind"].clone()), Some("stop".into()));
        // the session logs "capture started" once the tracer is live
        assert!(records.iter().any(|r| r["kind"] == "event"));
    }

    #[cfg(all(feature = "cpu", unix))]
    #[test]
    fn test_cpu_profile_is_served_as_protobuf() {
        let running = start(DiagnosisServer::new(
            "test-app",
            &settings(Duration::from_secs(10)),
        ));
        let worker = thread::spawn(|| {
            let until = Instant::now() + Duration::from_millis(500);
            let mut acc = 0u64;
            while Instant::now() < until {
                acc = acc.wrapping_mul(31).wrapping_add(7);
            }
            acc
        });

        let mut response = ureq::get(&format!("{}?seconds=0.5", running.url(Route::Cpu)))
            .call()
            .expect("cpu profile");
        let body = response.body_mut().read_to_vec().expect("cpu body");
        assert!(!body.is_empty());
        let _ = worker.join();
    }

    #[test]
    fn test_stop_closes_listener() {
        let running = start(ticker_server(Duration::from_secs(10)));
        let addr = running.addr;
        get_text(&running.url(Route::Index));

        running.shutdown().expect("clean shutdown");
        assert!(TcpStream::connect(addr).is_err());
    }

    #[test]
    fn test_stop_before_run_never_listens() {
        let server = ticker_server(Duration::from_secs(10));
        server.stop();
        server.stop();
        assert!(server.run().is_ok());
        assert!(server.local_addr().is_none());
    }

    #[test]
    fn test_disabled_diagnosis_never_listens() {
        let port = TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .expect("reserve port")
            .port();
        let address = format!("127.0.0.1:{port}");

        let cfg = Config::new()
            .set(KEY_ENABLE, "false")
            .set(KEY_MODE, "http")
            .set(KEY_HTTP_ADDRESS, address.clone());
        assert!(Diagnosis::new("test-app", &cfg)
            .expect("config")
            .is_none());
        assert!(TcpStream::connect(&address).is_err());
    }

    #[test]
    fn test_controller_runs_and_stops_http_target() {
        let cfg = Config::new()
            .set(KEY_ENABLE, "true")
            .set(KEY_MODE, "http")
            .set(KEY_HTTP_ADDRESS, "127.0.0.1:0");
        let diagnosis = Arc::new(
            Diagnosis::new("test-app", &cfg)
                .expect("config")
                .expect("enabled"),
        );
        let runner = Arc::clone(&diagnosis);
        let handle = thread::spawn(move || runner.run());

        let server = diagnosis.server().expect("http target");
        assert!(wait_until(Duration::from_secs(5), || server
            .local_addr()
            .is_some()));
        let addr = server.local_addr().expect("bound");
        assert!(get_text(&Route::Index.to_url(addr)).contains("test-app"));

        diagnosis.stop();
        handle
            .join()
            .expect("controller thread panicked")
            .expect("clean run");
    }

    #[test]
    fn test_listen_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").expect("bind");
        let address = taken.local_addr().expect("addr").to_string();
        let server = DiagnosisServer::new(
            "test-app",
            &HttpSettings {
                address: address.clone(),
                write_timeout: Duration::from_secs(1),
            },
        );
        match server.run() {
            Err(DiagnosisError::Listen { address: a, .. }) => assert_eq!(a, address),
            other => panic!("expected Listen error, got {other:?}"),
        }
    }
}
