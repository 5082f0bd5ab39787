use std::{path::Path as FsPath, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use futures_util::StreamExt;
use serde::Serialize;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::{
    cors::CorsLayer,
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::{
    config::ServerCfg,
    error::StoreError,
    events::Broadcaster,
    llm::ModelInfo,
    sequencer::{self, Availability, Sequencer},
    store::RunSummary,
};

#[derive(Clone)]
pub struct AppState {
    seq: Arc<Sequencer>,
}

pub async fn serve(cfg: ServerCfg) -> Result<()> {
    let bind = cfg.bind.clone();
    let static_dir = cfg.static_dir.clone();

    let tools = Availability::probe(&cfg).await;
    info!(gpu = tools.gpu, llm = tools.llm, "tool availability probed");

    let events = Arc::new(Broadcaster::new(cfg.viewer_queue));
    let seq = Arc::new(Sequencer::new(Arc::new(cfg), events, tools));
    seq.store()
        .ensure_root()
        .await
        .with_context(|| format!("Failed to create runs directory: {}", seq.store().root().display()))?;
    info!(runs_dir = %seq.store().root().display(), "runs directory ready");

    let app = router(AppState::new(seq), &static_dir);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    info!("benchdash listening on http://{bind}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}

pub fn router(state: AppState, static_dir: &FsPath) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/runs", get(list_runs).delete(reset_runs))
        .route("/api/run/{label}", delete(delete_run))
        .route("/api/run/{label}/llm", get(llm_response))
        .route("/api/ollama/models", get(list_models))
        .route_service("/", ServeFile::new(static_dir.join("index.html")))
        .nest_service("/static", ServeDir::new(static_dir))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

impl AppState {
    pub fn new(seq: Arc<Sequencer>) -> Self {
        Self { seq }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(st): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| viewer_session(socket, st))
}

/// One connected viewer: every broadcast line goes out, every text frame
/// coming in is treated as a control command.
async fn viewer_session(socket: WebSocket, st: AppState) {
    let events = st.seq.events().clone();
    let (id, rx) = events.register();
    debug!(viewer = %id, viewers = events.viewer_count(), "viewer connected");

    let (sink, mut incoming) = socket.split();
    let mut outgoing = tokio::spawn(
        ReceiverStream::new(rx)
            .map(|line| Ok::<_, axum::Error>(Message::Text(line.into())))
            .forward(sink),
    );

    loop {
        tokio::select! {
            _ = &mut outgoing => break,
            msg = incoming.next() => match msg {
                Some(Ok(Message::Text(text))) => handle_command(&st, text.as_str()),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    events.deregister(id);
    outgoing.abort();
    debug!(viewer = %id, "viewer disconnected");
}

fn handle_command(st: &AppState, text: &str) {
    let Some((label, opts)) = sequencer::parse_control(text) else {
        warn!(command = text, "ignoring unknown control message");
        return;
    };
    let seq = st.seq.clone();
    tokio::spawn(async move {
        if let Err(e) = seq.run(&label, opts).await {
            warn!(label = %label, error = %e, "run ended early");
        }
    });
}

async fn list_runs(State(st): State<AppState>) -> Result<Json<Vec<RunSummary>>, ApiErr> {
    let runs = st.seq.store().list_runs().await.map_err(ApiErr::store)?;
    Ok(Json(runs))
}

#[derive(Debug, Serialize)]
struct ResetResp {
    deleted: usize,
}

async fn reset_runs(State(st): State<AppState>) -> Result<Json<ResetResp>, ApiErr> {
    let deleted = st.seq.store().delete_all().await.map_err(ApiErr::store)?;
    info!(deleted, "all runs deleted");
    Ok(Json(ResetResp { deleted }))
}

async fn delete_run(State(st): State<AppState>, Path(label): Path<String>) -> Result<StatusCode, ApiErr> {
    st.seq.store().delete_run(&label).await.map_err(ApiErr::store)?;
    info!(label = %label, "run deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct LlmResp {
    response: String,
    available: bool,
}

/// A run without a saved response is not an error; only an unknown run is.
async fn llm_response(State(st): State<AppState>, Path(label): Path<String>) -> Result<Json<LlmResp>, ApiErr> {
    let resp = match st.seq.store().read_llm_response(&label).await.map_err(ApiErr::store)? {
        Some(response) => LlmResp { response, available: true },
        None => LlmResp { response: String::new(), available: false },
    };
    Ok(Json(resp))
}

#[derive(Debug, Serialize)]
struct ModelsResp {
    models: Vec<ModelInfo>,
    available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn list_models(State(st): State<AppState>) -> Json<ModelsResp> {
    if !st.seq.availability().llm {
        return Json(ModelsResp { models: Vec::new(), available: false, error: Some("Ollama not available".into()) });
    }
    let timeout = st.seq.config().telemetry.probe_timeout();
    match st.seq.llm().list_models(timeout).await {
        Ok(models) => Json(ModelsResp { available: !models.is_empty(), models, error: None }),
        Err(e) => {
            warn!(error = %e, "listing LLM models failed");
            Json(ModelsResp { models: Vec::new(), available: false, error: Some(e.to_string()) })
        }
    }
}

#[derive(Debug)]
struct ApiErr {
    status: StatusCode,
    code: String,
    message: String,
    suggestion: Option<String>,
}

impl ApiErr {
    fn internal(e: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error".to_string(),
            message: format!("Internal error: {}", e),
            suggestion: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request".to_string(),
            message: message.into(),
            suggestion: Some("Run labels must be a single name without path separators.".to_string()),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found".to_string(),
            message: message.into(),
            suggestion: None,
        }
    }

    fn store(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(label) => Self::not_found(format!("Run not found: {label}")),
            StoreError::InvalidLabel(label) => Self::bad_request(format!("Invalid run label: {label}")),
            other => Self::internal(other),
        }
    }
}

impl IntoResponse for ApiErr {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            code: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            suggestion: Option<String>,
        }
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
                code: self.code,
                suggestion: self.suggestion,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ToolCmd, record::RunRecord};
    use std::time::Duration;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    fn state(root: &FsPath, tools: Availability) -> AppState {
        let cfg = ServerCfg { runs_dir: root.join("runs"), ..ServerCfg::default() };
        let events = Arc::new(Broadcaster::new(cfg.viewer_queue));
        AppState::new(Arc::new(Sequencer::new(Arc::new(cfg), events, tools)))
    }

    #[tokio::test]
    async fn runs_listing_and_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let st = state(dir.path(), Availability::default());
        let store = st.seq.store();
        for label in ["a", "b"] {
            store.create_run(label).await.unwrap();
            store.write_record(&RunRecord::new(label)).await.unwrap();
        }

        let Json(runs) = list_runs(State(st.clone())).await.unwrap();
        assert_eq!(runs.len(), 2);

        let status = delete_run(State(st.clone()), Path("a".into())).await.unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        let err = delete_run(State(st.clone()), Path("a".into())).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        let err = delete_run(State(st.clone()), Path("..".into())).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let Json(reset) = reset_runs(State(st.clone())).await.unwrap();
        assert_eq!(reset.deleted, 1);
        assert!(st.seq.store().root().is_dir());
    }

    #[tokio::test]
    async fn llm_response_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let st = state(dir.path(), Availability::default());
        st.seq.store().create_run("r").await.unwrap();

        let Json(resp) = llm_response(State(st.clone()), Path("r".into())).await.unwrap();
        assert!(!resp.available);
        assert_eq!(resp.response, "");

        st.seq.store().write_llm_response("r", "\x1b[1mQuantum\x1b[0m bits.").await.unwrap();
        let Json(resp) = llm_response(State(st.clone()), Path("r".into())).await.unwrap();
        assert!(resp.available);
        assert_eq!(resp.response, "Quantum bits.");

        let err = llm_response(State(st), Path("missing".into())).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn models_without_runtime_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        let st = state(dir.path(), Availability::default());
        let Json(resp) = list_models(State(st)).await;
        assert!(!resp.available);
        assert!(resp.models.is_empty());
        assert!(resp.error.is_some());
    }

    #[tokio::test]
    async fn failing_model_listing_is_reported_in_the_body() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = ServerCfg { runs_dir: dir.path().join("runs"), ..ServerCfg::default() };
        cfg.tools.ollama = ToolCmd {
            program: "sh".into(),
            prefix_args: vec!["-c".into(), "echo 'could not connect to ollama app' >&2; exit 1".into()],
        };
        let events = Arc::new(Broadcaster::new(cfg.viewer_queue));
        let tools = Availability { gpu: false, llm: true };
        let st = AppState::new(Arc::new(Sequencer::new(Arc::new(cfg), events, tools)));

        let Json(resp) = list_models(State(st)).await;
        assert!(!resp.available);
        assert!(resp.models.is_empty());
        assert!(resp.error.is_some());
        let body = serde_json::to_value(&resp).unwrap();
        assert_eq!(body["models"], serde_json::json!([]));
        assert_eq!(body["available"], false);
    }

    async fn spawn_server(st: AppState, static_dir: &FsPath) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(st, static_dir);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        addr
    }

    async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf).into_owned()
    }

    async fn read_text_frame(stream: &mut TcpStream) -> String {
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await.unwrap();
        assert_eq!(head[0], 0x81, "expected a final text frame");
        let len = match head[1] & 0x7f {
            126 => {
                let mut ext = [0u8; 2];
                stream.read_exact(&mut ext).await.unwrap();
                u16::from_be_bytes(ext) as usize
            }
            n => n as usize,
        };
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();
        String::from_utf8(payload).unwrap()
    }

    async fn send_text_frame(stream: &mut TcpStream, text: &str) {
        let mask = [0x37u8, 0xfa, 0x21, 0x3d];
        let bytes = text.as_bytes();
        assert!(bytes.len() < 126);
        let mut frame = vec![0x81, 0x80 | bytes.len() as u8];
        frame.extend_from_slice(&mask);
        frame.extend(bytes.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        stream.write_all(&frame).await.unwrap();
    }

    async fn wait_for_viewers(events: &Broadcaster, n: usize) {
        for _ in 0..200 {
            if events.viewer_count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("viewer count never reached {n}, is {}", events.viewer_count());
    }

    #[tokio::test]
    async fn websocket_viewer_receives_lines_and_sends_commands() {
        let dir = tempfile::tempdir().unwrap();
        let st = state(dir.path(), Availability::default());
        let events = st.seq.events().clone();
        let addr = spawn_server(st, dir.path()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let req = format!(
            "GET /ws HTTP/1.1\r\nHost: {addr}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n"
        );
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            let mut b = [0u8; 1];
            stream.read_exact(&mut b).await.unwrap();
            head.push(b[0]);
        }
        let head = String::from_utf8(head).unwrap();
        assert!(head.starts_with("HTTP/1.1 101"), "{head}");

        wait_for_viewers(&events, 1).await;
        assert_eq!(events.publish("[x] hello"), 1);
        assert_eq!(read_text_frame(&mut stream).await, "[x] hello");

        send_text_frame(&mut stream, "run:../escape").await;
        let line = tokio::time::timeout(Duration::from_secs(5), read_text_frame(&mut stream))
            .await
            .unwrap();
        assert!(line.contains("cannot create run directory"), "{line}");

        drop(stream);
        wait_for_viewers(&events, 0).await;
    }

    #[tokio::test]
    async fn index_at_root_and_assets_under_static() {
        let dir = tempfile::tempdir().unwrap();
        let web = dir.path().join("web");
        std::fs::create_dir_all(&web).unwrap();
        std::fs::write(web.join("index.html"), "<h1>benchdash</h1>").unwrap();
        std::fs::write(web.join("app.js"), "console.log('dash');").unwrap();
        let addr = spawn_server(state(dir.path(), Availability::default()), &web).await;

        let index = http_get(addr, "/").await;
        assert!(index.starts_with("HTTP/1.1 200"), "{index}");
        assert!(index.ends_with("<h1>benchdash</h1>"));

        let asset = http_get(addr, "/static/app.js").await;
        assert!(asset.starts_with("HTTP/1.1 200"), "{asset}");
        assert!(asset.ends_with("console.log('dash');"));

        let stray = http_get(addr, "/app.js").await;
        assert!(stray.starts_with("HTTP/1.1 404"), "{stray}");
    }
}
