use crate::{RateBudget, RemoteError, Upstream, UpstreamConfig};
use elmirror_schema::{AllPackages, Endpoint, PackageId};
use serde::de::DeserializeOwned;
use std::io::Read;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// HTTP client for the Elm package registry protocol.
///
/// Index requests go to the configured registry:
/// - `GET /all-packages/since/<N>` : newest-first identifiers
/// - `GET /all-packages` : full index
/// - `GET /packages/<author>/<name>/<version>/endpoint.json`
/// - `GET /packages/<author>/<name>/<version>/elm.json`
///
/// Archives are fetched from whatever URL `endpoint.json` names (the content
/// origin); only those requests carry the auth token.
pub struct HttpUpstream {
    config: UpstreamConfig,
    agent: ureq::Agent,
    budget: Arc<RateBudget>,
    deadline: Option<Instant>,
}

impl HttpUpstream {
    pub fn new(config: UpstreamConfig, budget: Arc<RateBudget>) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(config.timeout()))
            .build()
            .into();
        Self {
            config,
            agent,
            budget,
            deadline: None,
        }
    }

    /// Give up with `BudgetExhausted` instead of waiting past `deadline`.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    fn package_url(&self, id: &PackageId, file: &str) -> String {
        format!(
            "{}/packages/{}/{}/{}/{file}",
            self.config.url,
            id.author(),
            id.name(),
            id.version()
        )
    }

    fn do_get(&self, url: &str, with_auth: bool) -> Result<Vec<u8>, RemoteError> {
        self.budget.acquire(self.deadline)?;
        debug!("GET {url}");

        let mut req = self
            .agent
            .get(url)
            .header("User-Agent", &self.config.user_agent);
        if with_auth {
            if let Some(ref token) = self.config.auth_token {
                req = req.header("Authorization", &format!("Bearer {token}"));
            }
        }
        let resp = match req.call() {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(404)) => {
                return Err(RemoteError::NotFound(url.to_owned()));
            }
            Err(ureq::Error::StatusCode(code)) => {
                return Err(RemoteError::Http(format!("HTTP {code} for {url}")));
            }
            Err(e) => {
                return Err(RemoteError::Http(format!("{url}: {e}")));
            }
        };

        let code = resp.status().as_u16();
        if code == 404 {
            return Err(RemoteError::NotFound(url.to_owned()));
        }
        if code >= 400 {
            return Err(RemoteError::Http(format!("HTTP {code} for {url}")));
        }

        let mut reader = resp.into_body().into_reader();
        let mut body = Vec::new();
        reader
            .read_to_end(&mut body)
            .map_err(|e| RemoteError::Http(format!("{url}: {e}")))?;
        Ok(body)
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, RemoteError> {
        let body = self.do_get(url, false)?;
        serde_json::from_slice(&body).map_err(|e| RemoteError::Malformed {
            url: url.to_owned(),
            reason: e.to_string(),
        })
    }
}

impl Upstream for HttpUpstream {
    fn since(&self, anchor: u64) -> Result<Vec<PackageId>, RemoteError> {
        let url = format!("{}/all-packages/since/{anchor}", self.config.url);
        let raw: Vec<String> = self.get_json(&url)?;
        raw.iter()
            .map(|s| {
                s.parse().map_err(|e| RemoteError::Malformed {
                    url: url.clone(),
                    reason: format!("{e}"),
                })
            })
            .collect()
    }

    fn all_packages(&self) -> Result<AllPackages, RemoteError> {
        let url = format!("{}/all-packages", self.config.url);
        self.get_json(&url)
    }

    fn endpoint(&self, id: &PackageId) -> Result<Endpoint, RemoteError> {
        self.get_json(&self.package_url(id, "endpoint.json"))
    }

    fn metadata(&self, id: &PackageId) -> Result<Vec<u8>, RemoteError> {
        self.do_get(&self.package_url(id, "elm.json"), false)
    }

    fn archive(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        self.do_get(url, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::Mutex;
    use std::time::Duration;

    /// A captured HTTP request for header inspection.
    #[derive(Debug, Clone)]
    struct CapturedRequest {
        path: String,
        headers: HashMap<String, String>,
    }

    struct MockServer {
        addr: String,
        _handle: std::thread::JoinHandle<()>,
        routes: Arc<Mutex<HashMap<String, (u16, Vec<u8>)>>>,
        requests: Arc<Mutex<Vec<CapturedRequest>>>,
    }

    impl MockServer {
        fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = format!("http://{}", listener.local_addr().unwrap());
            let routes: Arc<Mutex<HashMap<String, (u16, Vec<u8>)>>> =
                Arc::new(Mutex::new(HashMap::new()));
            let requests: Arc<Mutex<Vec<CapturedRequest>>> = Arc::new(Mutex::new(Vec::new()));

            let routes_clone = Arc::clone(&routes);
            let requests_clone = Arc::clone(&requests);
            let handle = std::thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(mut stream) = stream else { break };
                    let routes = Arc::clone(&routes_clone);
                    let reqs = Arc::clone(&requests_clone);

                    std::thread::spawn(move || {
                        let mut reader = BufReader::new(stream.try_clone().unwrap());
                        let mut request_line = String::new();
                        if reader.read_line(&mut request_line).is_err() {
                            return;
                        }
                        let parts: Vec<&str> = request_line.trim().splitn(3, ' ').collect();
                        if parts.len() < 2 {
                            return;
                        }
                        let path = parts[1].to_owned();

                        let mut headers = HashMap::new();
                        loop {
                            let mut line = String::new();
                            if reader.read_line(&mut line).is_err() || line.trim().is_empty() {
                                break;
                            }
                            if let Some((k, v)) = line.trim().split_once(": ") {
                                headers.insert(k.to_lowercase(), v.to_owned());
                            }
                        }
                        reqs.lock().unwrap().push(CapturedRequest {
                            path: path.clone(),
                            headers,
                        });

                        let (code, body) = routes
                            .lock()
                            .unwrap()
                            .get(&path)
                            .cloned()
                            .unwrap_or((404, Vec::new()));
                        let head = format!(
                            "HTTP/1.1 {code} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            body.len()
                        );
                        let _ = stream.write_all(head.as_bytes());
                        let _ = stream.write_all(&body);
                        let _ = stream.flush();
                    });
                }
            });

            MockServer {
                addr,
                _handle: handle,
                routes,
                requests,
            }
        }

        fn route(&self, path: &str, code: u16, body: &[u8]) {
            self.routes
                .lock()
                .unwrap()
                .insert(path.to_owned(), (code, body.to_vec()));
        }

        fn captured_requests(&self) -> Vec<CapturedRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    fn test_upstream(url: &str) -> HttpUpstream {
        HttpUpstream::new(UpstreamConfig::new(url), Arc::new(RateBudget::unlimited()))
    }

    fn id(s: &str) -> PackageId {
        s.parse().unwrap()
    }

    #[test]
    fn since_parses_identifiers() {
        let server = MockServer::start();
        server.route(
            "/all-packages/since/1",
            200,
            br#"["a/x@2.0.0","b/y@1.0.0"]"#,
        );
        let up = test_upstream(&server.addr);
        let ids = up.since(1).unwrap();
        assert_eq!(ids, vec![id("a/x@2.0.0"), id("b/y@1.0.0")]);
    }

    #[test]
    fn since_rejects_bad_identifier() {
        let server = MockServer::start();
        server.route("/all-packages/since/0", 200, br#"["not-an-id"]"#);
        let up = test_upstream(&server.addr);
        assert!(matches!(up.since(0), Err(RemoteError::Malformed { .. })));
    }

    #[test]
    fn all_packages_and_endpoint() {
        let server = MockServer::start();
        server.route("/all-packages", 200, br#"{"elm/core":["1.0.0","1.0.5"]}"#);
        server.route(
            "/packages/elm/core/1.0.5/endpoint.json",
            200,
            br#"{"url":"https://github.com/elm/core/zipball/1.0.5/","hash":"abc"}"#,
        );
        let up = test_upstream(&server.addr);
        let index = up.all_packages().unwrap();
        assert_eq!(index["elm/core"].len(), 2);
        let ep = up.endpoint(&id("elm/core@1.0.5")).unwrap();
        assert_eq!(ep.hash.as_str(), "abc");
    }

    #[test]
    fn missing_resource_is_not_found() {
        let server = MockServer::start();
        let up = test_upstream(&server.addr);
        assert!(matches!(
            up.metadata(&id("elm/core@1.0.0")),
            Err(RemoteError::NotFound(_))
        ));
    }

    #[test]
    fn server_error_is_http() {
        let server = MockServer::start();
        server.route("/all-packages", 502, b"");
        let up = test_upstream(&server.addr);
        let err = up.all_packages().unwrap_err();
        assert!(matches!(err, RemoteError::Http(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn malformed_json_is_reported() {
        let server = MockServer::start();
        server.route("/all-packages", 200, b"<html>");
        let up = test_upstream(&server.addr);
        assert!(matches!(
            up.all_packages(),
            Err(RemoteError::Malformed { .. })
        ));
    }

    #[test]
    fn connection_refused_returns_error() {
        let up = test_upstream("http://127.0.0.1:1");
        assert!(up.since(0).is_err());
    }

    #[test]
    fn auth_token_only_on_archive_requests() {
        let server = MockServer::start();
        server.route("/packages/elm/core/1.0.0/elm.json", 200, b"{}");
        server.route("/zipball/core", 200, b"zip");
        let up = HttpUpstream::new(
            UpstreamConfig::new(&server.addr).with_token("secret-token-42"),
            Arc::new(RateBudget::unlimited()),
        );

        up.metadata(&id("elm/core@1.0.0")).unwrap();
        let bytes = up.archive(&format!("{}/zipball/core", server.addr)).unwrap();
        assert_eq!(bytes, b"zip");

        std::thread::sleep(Duration::from_millis(50));

        let reqs = server.captured_requests();
        let meta = reqs.iter().find(|r| r.path.ends_with("elm.json")).unwrap();
        let zip = reqs.iter().find(|r| r.path == "/zipball/core").unwrap();
        assert!(
            !meta.headers.contains_key("authorization"),
            "index requests must not carry the token"
        );
        assert_eq!(
            zip.headers.get("authorization"),
            Some(&"Bearer secret-token-42".to_owned())
        );
    }

    #[test]
    fn user_agent_is_sent() {
        let server = MockServer::start();
        server.route("/all-packages", 200, b"{}");
        let up = test_upstream(&server.addr);
        up.all_packages().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let reqs = server.captured_requests();
        assert!(reqs[0].headers["user-agent"].starts_with("elmirror/"));
    }

    #[test]
    fn failed_requests_still_consume_budget() {
        let server = MockServer::start();
        let budget = Arc::new(RateBudget::unlimited());
        let up = HttpUpstream::new(UpstreamConfig::new(&server.addr), Arc::clone(&budget));
        let _ = up.metadata(&id("elm/core@1.0.0"));
        let _ = up.metadata(&id("elm/core@1.0.1"));
        assert_eq!(budget.consumed(), 2);
    }

    #[test]
    fn budget_exhaustion_stops_before_request() {
        let server = MockServer::start();
        server.route("/all-packages", 200, b"{}");
        let budget = Arc::new(RateBudget::new(1, Duration::from_secs(3600)));
        let up = HttpUpstream::new(UpstreamConfig::new(&server.addr), budget)
            .with_deadline(Some(Instant::now() + Duration::from_secs(5)));
        up.all_packages().unwrap();
        assert!(matches!(
            up.all_packages(),
            Err(RemoteError::BudgetExhausted)
        ));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(server.captured_requests().len(), 1);
    }
}
