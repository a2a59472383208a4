use axum::{
    Json, Router,
    extract::{
        Path, Query, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::Parser;
use credflow_sdk::{
    CapabilityManifest,
    definitions::{
        MESSAGE_ERROR, MESSAGE_FLOW_CONTINUE, MESSAGE_FLOW_START, MESSAGE_GENERIC_REQUEST,
        MESSAGE_PROGRESS,
    },
    discovery::capability,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::net::SocketAddr;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "flow-server")]
#[command(about = "Scripted flow backend speaking the credflow wire protocol", long_about = None)]
struct Cli {
    #[arg(short, long, default_value_t = 3000)]
    port: u16,
    #[arg(long, help = "Leave the websocket capability out of the status manifest")]
    legacy: bool,
}

/// Define the routes and start a server
#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_ansi(false),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flow_server=trace".into()),
        )
        .init();

    let args = Cli::parse();

    let mut manifest = CapabilityManifest::legacy();
    manifest.service = "flow-server".into();
    manifest.api_version = 2;
    if !args.legacy {
        manifest.capabilities.push(capability::WEBSOCKET.into());
    }

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .allow_origin(Any);

    let app = Router::new()
        .route("/status", get(move || async move { Json(manifest) }))
        .route("/ws", get(websocket_handler))
        .route("/api/{*action}", get(proxy_get).post(proxy_post))
        .layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    tracing::debug!("listening on {}", listener.local_addr().unwrap());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();
}

async fn shutdown_signal() {
    signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

async fn websocket_handler(ws: WebSocketUpgrade, Query(query): Query<TokenQuery>) -> Response {
    if query.token.is_none_or(|token| token.is_empty()) {
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    }

    ws.on_upgrade(flow_socket)
}

async fn flow_socket(mut socket: WebSocket) {
    tracing::debug!("flow socket opened");

    while let Some(Ok(message)) = socket.recv().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let replies = match serde_json::from_str::<Value>(&text) {
            Ok(request) => answer(&request),
            Err(e) => vec![error_message(Value::Null, "INVALID_MESSAGE", &e.to_string())],
        };

        for reply in replies {
            if socket
                .send(Message::Text(reply.to_string().into()))
                .await
                .is_err()
            {
                return;
            }
        }
    }

    tracing::debug!("flow socket closed");
}

fn error_message(flow_id: Value, code: &str, message: &str) -> Value {
    json!({
        "flowId": flow_id,
        "type": MESSAGE_ERROR,
        "error": {"code": code, "message": message},
    })
}

fn progress_message(flow_id: &Value, stage: &str, progress: u8) -> Value {
    json!({
        "flowId": flow_id,
        "type": MESSAGE_PROGRESS,
        "stage": stage,
        "progress": progress,
    })
}

/// Scripted answers: one progress event, then the result
fn answer(request: &Value) -> Vec<Value> {
    let flow_id = request["flowId"].clone();
    let kind = request["type"].as_str().unwrap_or_default();
    let flow = request["flow"].as_str().unwrap_or_default();
    let action = request["action"].as_str().unwrap_or_default();
    tracing::debug!("{flow_id} {kind} {flow} {action}");

    if !flow_id.is_string() {
        return vec![error_message(flow_id, "INVALID_MESSAGE", "missing flowId")];
    }

    match (kind, flow) {
        (MESSAGE_FLOW_START, "issuance") => vec![
            progress_message(&flow_id, "fetching_metadata", 20),
            json!({
                "flowId": flow_id,
                "type": "flow.result",
                "issuerMetadata": {"credential_issuer": "https://issuer.example.com"},
                "credentialConfigurations": {"demo_credential": {"format": "dc+sd-jwt"}},
            }),
        ],
        (MESSAGE_FLOW_START, "presentation") => vec![
            progress_message(&flow_id, "parsing_request", 10),
            json!({
                "flowId": flow_id,
                "type": "flow.result",
                "clientId": "https://verifier.example.com",
                "nonce": uuid::Uuid::new_v4().to_string(),
                "requestedClaims": ["given_name"],
                "matchedCredentials": [],
            }),
        ],
        (MESSAGE_FLOW_CONTINUE, "issuance") if action == "consent" => vec![
            progress_message(&flow_id, "requesting_credential", 80),
            json!({
                "flowId": flow_id,
                "type": "flow.result",
                "credentials": ["demo-credential"],
            }),
        ],
        (MESSAGE_FLOW_CONTINUE, "issuance" | "presentation") => vec![json!({
            "flowId": flow_id,
            "type": "flow.result",
            "redirectUri": "https://verifier.example.com/done",
        })],
        (MESSAGE_GENERIC_REQUEST, _) => vec![json!({
            "flowId": flow_id,
            "type": "generic.response",
            "data": {"action": action, "payload": request["payload"]},
        })],
        _ => vec![error_message(
            flow_id,
            "UNKNOWN_ACTION",
            &format!("unsupported message '{kind}'"),
        )],
    }
}

async fn proxy_get(Path(action): Path<String>) -> Json<Value> {
    Json(json!({"action": action}))
}

async fn proxy_post(Path(action): Path<String>, Json(payload): Json<Value>) -> Json<Value> {
    Json(json!({"action": action, "payload": payload}))
}
