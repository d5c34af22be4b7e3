//! Upstream-compatible HTTP server over a mirror's committed state.
//!
//! Serves the Elm package registry protocol from the files a sync run commits:
//! - `GET /all-packages` : stored full index
//! - `GET /all-packages/since/{N}` : newest-first identifiers after N
//! - `GET /packages/{author}/{name}/{version}/endpoint.json` : archive URL on this mirror
//! - `GET /packages/{author}/{name}/{version}/elm.json`
//! - `GET /packages/{author}/{name}/{version}/hash.json`
//! - `GET /packages/{author}/{name}/{version}/package.zip`
//! - `GET /health`
//!
//! The server never writes. It re-reads `registry.json` whenever a checkpoint
//! replaces it, so a sync in another thread or process becomes visible without
//! a restart.
//!
//! The [`TestServer`] helper starts a server on a random port for integration testing.

use elmirror_schema::{Endpoint, HashDocument, PackageId};
use elmirror_store::{
    IndexStore, MirrorLayout, PackageStore, RegistryState, RegistryStore, StoreError,
};
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::SystemTime;
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tracing::{debug, error, info, warn};

/// Read-only view of a mirror for serving.
pub struct Mirror {
    layout: MirrorLayout,
    base_url: String,
    state: RwLock<Arc<RegistryState>>,
    loaded: Mutex<Option<SystemTime>>,
}

impl Mirror {
    pub fn open(root: impl Into<PathBuf>, base_url: &str) -> Result<Self, StoreError> {
        let mirror = Self {
            layout: MirrorLayout::new(root),
            base_url: base_url.trim_end_matches('/').to_owned(),
            state: RwLock::new(Arc::new(RegistryState::new())),
            loaded: Mutex::new(None),
        };
        mirror.reload()?;
        Ok(mirror)
    }

    pub fn layout(&self) -> &MirrorLayout {
        &self.layout
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Snapshot of the last loaded registry state.
    pub fn state(&self) -> Arc<RegistryState> {
        Arc::clone(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Load the committed registry unconditionally.
    pub fn reload(&self) -> Result<(), StoreError> {
        let mtime = registry_mtime(&self.layout);
        let state = RegistryStore::new(self.layout.clone()).load()?;
        debug!("loaded registry: {} records", state.len());
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(state);
        *self.loaded.lock().unwrap_or_else(PoisonError::into_inner) = mtime;
        Ok(())
    }

    /// Reload if `registry.json` was replaced since the last load. A failed
    /// reload keeps serving the previous state.
    pub fn refresh(&self) {
        let current = registry_mtime(&self.layout);
        let stale = *self.loaded.lock().unwrap_or_else(PoisonError::into_inner) != current;
        if stale {
            if let Err(e) = self.reload() {
                warn!("keeping previous registry, reload failed: {e}");
            }
        }
    }
}

fn registry_mtime(layout: &MirrorLayout) -> Option<SystemTime> {
    fs::metadata(layout.registry_file())
        .and_then(|m| m.modified())
        .ok()
}

/// Files served per release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageFile {
    Endpoint,
    Metadata,
    Checksum,
    Archive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Health,
    AllPackages,
    Since(u64),
    Package(PackageId, PackageFile),
}

/// Why a path did not resolve to a [`Route`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    NotFound,
    BadRequest,
}

/// Parse a request path (query string ignored) into a route.
pub fn parse_route(url: &str) -> Result<Route, RouteError> {
    let path = url.split_once('?').map_or(url, |(p, _)| p);
    match path {
        "/health" => return Ok(Route::Health),
        "/all-packages" => return Ok(Route::AllPackages),
        _ => {}
    }
    if let Some(n) = path.strip_prefix("/all-packages/since/") {
        return n
            .parse()
            .map(Route::Since)
            .map_err(|_| RouteError::BadRequest);
    }
    if let Some(rest) = path.strip_prefix("/packages/") {
        let segments: Vec<&str> = rest.split('/').collect();
        if segments
            .iter()
            .any(|s| s.is_empty() || *s == "." || *s == ".." || s.contains('\\'))
        {
            return Err(RouteError::BadRequest);
        }
        let [author, name, version, file] = segments.as_slice() else {
            return Err(RouteError::NotFound);
        };
        let file = match *file {
            "endpoint.json" => PackageFile::Endpoint,
            "elm.json" => PackageFile::Metadata,
            "hash.json" => PackageFile::Checksum,
            "package.zip" => PackageFile::Archive,
            _ => return Err(RouteError::NotFound),
        };
        let id = PackageId::from_parts(&format!("{author}/{name}"), version)
            .map_err(|_| RouteError::BadRequest)?;
        return Ok(Route::Package(id, file));
    }
    Err(RouteError::NotFound)
}

fn respond_err(req: tiny_http::Request, code: u16, msg: &str) {
    let body = json!({ "error": msg }).to_string();
    let header = Header::from_bytes("Content-Type", "application/json").expect("valid header");
    let _ = req.respond(
        Response::from_string(body)
            .with_status_code(StatusCode(code))
            .with_header(header),
    );
}

fn respond_data(req: tiny_http::Request, content_type: &str, data: Vec<u8>) {
    let header = Header::from_bytes("Content-Type", content_type).expect("valid header");
    let _ = req.respond(Response::from_data(data).with_header(header));
}

fn respond_json(req: tiny_http::Request, json: impl Into<Vec<u8>>) {
    respond_data(req, "application/json", json.into());
}

fn handle_package(mirror: &Mirror, req: tiny_http::Request, id: &PackageId, file: PackageFile) {
    let state = mirror.state();
    let files = match PackageStore::new(mirror.layout.clone()).locate(&state, id) {
        Ok(files) => files,
        Err(StoreError::PackageUnavailable { id, reason, .. }) => {
            respond_err(req, 503, &format!("{id} {reason}"));
            return;
        }
        Err(StoreError::PackageNotFound(what)) => {
            respond_err(req, 404, &format!("{what} is not a known package"));
            return;
        }
        Err(e) => {
            error!("locate {id}: {e}");
            respond_err(req, 500, "internal error");
            return;
        }
    };

    let result = match file {
        PackageFile::Endpoint => fs::read(&files.checksum).and_then(|data| {
            let doc: HashDocument = serde_json::from_slice(&data)?;
            let endpoint = Endpoint {
                url: format!(
                    "{}/packages/{}/{}/{}/package.zip",
                    mirror.base_url,
                    id.author(),
                    id.name(),
                    id.version()
                ),
                hash: doc.hash,
            };
            Ok(serde_json::to_vec(&endpoint)?)
        }),
        PackageFile::Metadata => fs::read(&files.metadata),
        PackageFile::Checksum => fs::read(&files.checksum),
        PackageFile::Archive => fs::read(&files.archive),
    };
    match result {
        Ok(data) if file == PackageFile::Archive => respond_data(req, "application/zip", data),
        Ok(data) => respond_json(req, data),
        Err(e) => {
            error!("read {id} {file:?}: {e}");
            respond_err(req, 500, "internal error");
        }
    }
}

/// Handle a single HTTP request, dispatching to the appropriate route handler.
pub fn handle_request(mirror: &Mirror, req: tiny_http::Request) {
    let method = req.method().clone();
    let url = req.url().to_owned();
    debug!("{method} {url}");

    if method != Method::Get {
        respond_err(req, 405, "method not allowed");
        return;
    }
    mirror.refresh();

    match parse_route(&url) {
        Ok(Route::Health) => {
            let state = mirror.state();
            let body = json!({ "status": "ok", "known_total": state.known_total() });
            respond_json(req, body.to_string());
        }
        Ok(Route::AllPackages) => match IndexStore::new(mirror.layout.clone()).load_raw() {
            Ok(Some(data)) => respond_json(req, data),
            Ok(None) => respond_err(req, 404, "all-packages not found"),
            Err(e) => {
                error!("read all-packages: {e}");
                respond_err(req, 500, "internal error");
            }
        },
        Ok(Route::Since(anchor)) => {
            let state = mirror.state();
            let ids: Vec<String> = state.since(anchor).iter().map(ToString::to_string).collect();
            let body = serde_json::to_vec(&ids).unwrap_or_else(|_| b"[]".to_vec());
            respond_json(req, body);
        }
        Ok(Route::Package(id, file)) => handle_package(mirror, req, &id, file),
        Err(RouteError::BadRequest) => respond_err(req, 400, "bad request"),
        Err(RouteError::NotFound) => respond_err(req, 404, "not found"),
    }
}

/// Start the server loop, blocking the current thread.
pub fn run_server(mirror: &Arc<Mirror>, addr: &str) -> Result<(), String> {
    let server = Server::http(addr).map_err(|e| format!("failed to bind {addr}: {e}"))?;
    info!("serving {} on http://{addr}", mirror.layout.root().display());
    for request in server.incoming_requests() {
        handle_request(mirror, request);
    }
    Ok(())
}

/// A test helper that starts an elmirror server on a random port in a background thread.
///
/// The server listens on `127.0.0.1:{port}` and serves the mirror at `root`,
/// using its own URL as the base URL. Drop the `TestServer` to stop the
/// server (via `Server::unblock`).
pub struct TestServer {
    pub url: String,
    pub port: u16,
    pub mirror: Arc<Mirror>,
    server: Arc<Server>,
    _handle: std::thread::JoinHandle<()>,
}

impl TestServer {
    /// Start a test server on `root`. Binds to `127.0.0.1:0` (random port).
    pub fn start(root: PathBuf) -> Self {
        fs::create_dir_all(&root).expect("failed to create test mirror dir");
        let server =
            Arc::new(Server::http("127.0.0.1:0").expect("failed to bind test HTTP server"));
        let port = server.server_addr().to_ip().expect("not an IP addr").port();
        let url = format!("http://127.0.0.1:{port}");

        let mirror = Arc::new(Mirror::open(root, &url).expect("failed to open test mirror"));
        let srv = Arc::clone(&server);
        let served = Arc::clone(&mirror);
        let handle = std::thread::spawn(move || {
            for request in srv.incoming_requests() {
                handle_request(&served, request);
            }
        });

        Self {
            url,
            port,
            mirror,
            server,
            _handle: handle,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.unblock();
    }
}
