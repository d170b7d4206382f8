use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use fanrelay_store::{CommandRepo, CommandStore, Database, ReadingRepo};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::connection;
use crate::delivery::{AckPolicy, DeliveryEngine};
use crate::fanout::TelemetryFanout;
use crate::registry::SessionRegistry;
use crate::routes;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Outbound frames buffered per connection before sends start dropping.
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    /// Sessions silent for this long are closed by the sweeper.
    pub client_timeout: Duration,
    pub ack_policy: AckPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 5000,
            max_send_queue: 256,
            heartbeat_interval: Duration::from_secs(30),
            client_timeout: Duration::from_secs(90),
            ack_policy: AckPolicy::OnSend,
        }
    }
}

impl ServerConfig {
    /// Zero periods would panic the ping and sweep timers.
    pub fn validate(&self) -> Result<(), std::io::Error> {
        if self.heartbeat_interval.is_zero() {
            return Err(invalid_config("heartbeat_interval must be greater than zero"));
        }
        if self.client_timeout.is_zero() {
            return Err(invalid_config("client_timeout must be greater than zero"));
        }
        Ok(())
    }
}

fn invalid_config(message: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, message)
}

/// Shared state passed to Axum handlers and connection loops.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub engine: Arc<DeliveryEngine>,
    pub fanout: TelemetryFanout,
    pub readings: Arc<ReadingRepo>,
    pub commands: Arc<CommandRepo>,
    pub config: Arc<ServerConfig>,
}

/// Wire the registry, engine, and repos over one database.
pub fn build_state(config: ServerConfig, db: Database) -> AppState {
    let registry = Arc::new(SessionRegistry::new());
    let commands = Arc::new(CommandRepo::new(db.clone()));
    let store: Arc<dyn CommandStore> = commands.clone();
    let engine = Arc::new(DeliveryEngine::new(
        store,
        Arc::clone(&registry),
        config.ack_policy,
    ));

    AppState {
        fanout: TelemetryFanout::new(Arc::clone(&registry)),
        readings: Arc::new(ReadingRepo::new(db)),
        registry,
        engine,
        commands,
        config: Arc::new(config),
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(routes::root))
        .route("/health", get(routes::health))
        .route("/telemetry", post(routes::ingest_telemetry))
        .route("/telemetry/recent", get(routes::recent_telemetry))
        .route("/command", post(routes::submit_command))
        .route("/commands/recent", get(routes::recent_commands))
        .route("/ws", get(routes::ws_upgrade))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and start serving. Returns a handle to shut it down.
pub async fn start(config: ServerConfig, db: Database) -> Result<ServerHandle, std::io::Error> {
    config.validate()?;
    let addr = format!("{}:{}", config.host, config.port);
    let state = build_state(config, db);

    let sweeper = connection::start_stale_sweeper(
        Arc::clone(&state.registry),
        state.config.heartbeat_interval,
        state.config.client_timeout,
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(
        addr = %local_addr,
        ack_policy = ?state.config.ack_policy,
        "fanrelay server started"
    );

    let registry = Arc::clone(&state.registry);
    let router = build_router(state);
    let token = CancellationToken::new();
    let shutdown = token.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        port: local_addr.port(),
        registry,
        token,
        server,
        sweeper,
    })
}

/// Handle returned by `start()`. Keeps background tasks alive.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    registry: Arc<SessionRegistry>,
    token: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    sweeper: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Stop accepting, close live sessions, and wait briefly for in-flight
    /// requests to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        self.registry.close_all();
        self.sweeper.abort();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.server).await.is_err() {
            tracing::warn!("server did not stop within grace period");
        }
        tracing::info!("fanrelay server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app() -> (AppState, Router) {
        let state = build_state(ServerConfig::default(), Database::in_memory().unwrap());
        (state.clone(), build_router(state))
    }

    async fn call(router: Router, request: Request<Body>) -> (StatusCode, Value) {
        let resp = router.oneshot(request).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, value)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 5000);
        assert_eq!(config.max_send_queue, 256);
        assert_eq!(config.client_timeout, Duration::from_secs(90));
        assert_eq!(config.ack_policy, AckPolicy::OnSend);
    }

    #[test]
    fn zero_periods_are_invalid() {
        assert!(ServerConfig::default().validate().is_ok());

        let no_heartbeat = ServerConfig {
            heartbeat_interval: Duration::ZERO,
            ..Default::default()
        };
        let err = no_heartbeat.validate().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);

        let no_timeout = ServerConfig {
            client_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(no_timeout.validate().is_err());
    }

    #[tokio::test]
    async fn start_rejects_zero_heartbeat() {
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            heartbeat_interval: Duration::ZERO,
            ..Default::default()
        };
        let result = start(config, Database::in_memory().unwrap()).await;
        let Err(err) = result else {
            panic!("server started with a zero heartbeat");
        };
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn root_and_health() {
        let (_, router) = app();
        let resp = router.clone().oneshot(get("/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let (status, body) = call(router, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["devices"], 0);
    }

    #[tokio::test]
    async fn telemetry_is_stored_and_listed_newest_first() {
        let (_, router) = app();
        for temperature in [20.5, 21.0] {
            let (status, body) = call(
                router.clone(),
                post_json("/telemetry", json!({"device_id": "esp01", "temperature": temperature, "fan_rpm": 900})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["ok"], true);
            assert_eq!(body["reading"]["device_id"], "esp01");
        }
        call(router.clone(), post_json("/telemetry", json!({"device_id": "esp02"}))).await;

        let (status, body) = call(router.clone(), get("/telemetry/recent?device_id=esp01")).await;
        assert_eq!(status, StatusCode::OK);
        let rows = body["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["temperature"], 21.0);
        assert_eq!(rows[1]["temperature"], 20.5);

        let (_, body) = call(router, get("/telemetry/recent?limit=1")).await;
        assert_eq!(body["rows"].as_array().unwrap().len(), 1);
        assert_eq!(body["rows"][0]["device_id"], "esp02");
    }

    #[tokio::test]
    async fn telemetry_without_device_is_rejected() {
        let (_, router) = app();
        let (status, body) = call(router, post_json("/telemetry", json!({"temperature": 20.0}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("device_id"));
    }

    #[tokio::test]
    async fn command_for_offline_device_is_queued() {
        let (state, router) = app();
        let (status, body) = call(
            router.clone(),
            post_json(
                "/command",
                json!({"device_id": "esp01", "command_type": "set_fan_speed", "payload": {"speed": 70}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["pushed"], false);
        assert_eq!(body["command"]["delivered"], false);
        assert_eq!(body["command"]["payload"]["speed"], 70);

        let pending = state
            .commands
            .undelivered_for_device(&"esp01".parse().unwrap())
            .unwrap();
        assert_eq!(pending.len(), 1);

        let (status, body) = call(router, get("/commands/recent?device_id=esp01")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rows"][0]["command_type"], "set_fan_speed");
    }

    #[tokio::test]
    async fn command_validation() {
        let (_, router) = app();
        let (status, _) = call(
            router.clone(),
            post_json("/command", json!({"device_id": "", "command_type": "reboot"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(router.clone(), post_json("/command", json!({"device_id": "esp01"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "command_type is required");

        let (status, _) = call(router, get("/commands/recent")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let (_, router) = app();
        let resp = router.oneshot(get("/nonexistent")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn server_starts_on_random_port_and_shuts_down() {
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        };
        let handle = start(config, Database::in_memory().unwrap()).await.unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        handle.shutdown().await;
        assert!(reqwest::get(&url).await.is_err());
    }
}
