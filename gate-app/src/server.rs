//! gatekeep server and CLI runtime.
//!
//! Wires the store, vault, bridge connector, bot and admission engine together and
//! mounts the control API.

use crate::config::GatekeepConfig;
use crate::gateway::Gateway;
use crate::http_auth;
use crate::notifier::{ChatSender, TelegramNotifier};
use crate::routes;
use anyhow::Result;
use axum::Extension;
use axum::Router;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use gate_core::{
    AdmissionEngine, DelegateId, DelegatePool, Notifier, RateLimiter, RequestStatus,
    SqliteSettings, Store,
};
use gate_platform::{DelegateCredential, HttpBridgeConnector, PlatformConnector, TelegramBot};
use gate_vault::CredentialVault;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub engine: AdmissionEngine,
    pub started_at: Instant,
}

pub fn build_engine(
    cfg: &GatekeepConfig,
    store: Store,
    connector: Arc<dyn PlatformConnector>,
    notifier: Arc<dyn Notifier>,
) -> Result<AdmissionEngine> {
    let vault = CredentialVault::from_secret(&cfg.vault.encryption_key)
        .map_err(|e| anyhow::anyhow!("vault.encryption_key: {e}"))?;
    let pool = DelegatePool::new(
        store.clone(),
        vault,
        connector,
        notifier.clone(),
        cfg.pool_config(),
    );
    let limiter = RateLimiter::new(store.clone(), cfg.rate_limit_policy());
    let settings = Arc::new(SqliteSettings::new(store.clone()));
    Ok(AdmissionEngine::new(
        store,
        pool,
        limiter,
        settings,
        notifier,
        cfg.admission_config(),
    ))
}

pub async fn open_store(cfg: &GatekeepConfig) -> Result<Store> {
    let data_dir = cfg.data_dir_path()?;
    tokio::fs::create_dir_all(&data_dir)
        .await
        .map_err(|e| anyhow::anyhow!("create data dir {}: {e}", data_dir.display()))?;
    let path = cfg.database_path()?;
    Store::open(&path).map_err(|e| anyhow::anyhow!("open database {}: {e}", path.display()))
}

fn build_bot(cfg: &GatekeepConfig) -> Result<TelegramBot> {
    let bot = TelegramBot::new(&cfg.bot.token)?;
    match cfg.bot.api_base.as_deref() {
        Some(api_base) if !api_base.trim().is_empty() => bot.with_api_base(api_base),
        _ => Ok(bot),
    }
}

fn build_bridge(cfg: &GatekeepConfig) -> Result<HttpBridgeConnector> {
    HttpBridgeConnector::with_options(
        &cfg.bridge.base_url,
        cfg.bridge.auth_token.clone(),
        Duration::from_secs(cfg.bridge.call_timeout_secs),
    )
}

/// Engine for one-shot CLI commands; notices go through the configured bot.
async fn cli_engine(config_path: Option<PathBuf>) -> Result<AdmissionEngine> {
    let cfg = GatekeepConfig::load(config_path).await?;
    let store = open_store(&cfg).await?;
    let bot: Arc<dyn ChatSender> = Arc::new(build_bot(&cfg)?);
    let notifier = Arc::new(TelegramNotifier::new(bot, cfg.operator_ids()));
    build_engine(&cfg, store, Arc::new(build_bridge(&cfg)?), notifier)
}

pub fn build_router(state: Arc<AppState>, policy: http_auth::MutatingAuthPolicy) -> Router {
    routes::router()
        .layer(axum::middleware::from_fn(http_auth::require_mutating_auth))
        .layer(Extension(http_auth::MutatingAuthPolicyExt(policy)))
        .layer(Extension(state))
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = GatekeepConfig::load_with_path(config_path).await?;
    tracing::info!(
        config_path = %path.display(),
        spaces = cfg.spaces.len(),
        operators = cfg.bot.operator_ids.len(),
        data_dir = %cfg.runtime.data_dir,
        "config ok"
    );

    let mut failures = Vec::new();

    let store = open_store(&cfg).await?;
    let vault = CredentialVault::from_secret(&cfg.vault.encryption_key)
        .map_err(|e| anyhow::anyhow!("vault.encryption_key: {e}"))?;
    let delegates = store.list_delegates(false).await?;
    let mut unreadable = 0usize;
    for account in &delegates {
        if let Err(e) = vault.decrypt(&account.sealed_credential) {
            unreadable += 1;
            tracing::warn!(delegate_id = %account.id, error = %e, "delegate credential cannot be decrypted");
        }
    }
    let active = delegates.iter().filter(|account| account.active).count();
    tracing::info!(total = delegates.len(), active, unreadable, "delegate pool checked");
    if active == 0 {
        failures.push("no active delegate accounts".to_string());
    }
    if unreadable > 0 {
        failures.push(format!(
            "{unreadable} delegate credential(s) cannot be decrypted with the configured key"
        ));
    }

    let bridge = build_bridge(&cfg)?;
    match bridge.health().await {
        Ok(()) => tracing::info!(base_url = %bridge.base_url(), "bridge reachable"),
        Err(e) => failures.push(format!("bridge {}: {e}", bridge.base_url())),
    }

    match build_bot(&cfg)?.get_me().await {
        Ok(username) => tracing::info!(bot_username = %username, "bot token ok"),
        Err(e) => failures.push(format!("bot token: {e}")),
    }

    if failures.is_empty() {
        println!("gatekeep doctor: all checks passed");
        return Ok(());
    }
    for failure in &failures {
        println!("FAIL {failure}");
    }
    Err(anyhow::anyhow!("{} doctor check(s) failed", failures.len()))
}

pub async fn status(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = GatekeepConfig::load_with_path(config_path).await?;
    let store = open_store(&cfg).await?;
    let delegates = store.list_delegates(false).await?;
    let outstanding = store.list_requests(&RequestStatus::OUTSTANDING).await?;
    let settings = SqliteSettings::new(store.clone());
    let auto_admit = gate_core::Settings::get_bool(
        &settings,
        gate_core::AUTO_ADMIT_KEY,
        cfg.admission.auto_admit,
    )
    .await?;
    let blocked = RateLimiter::new(store, cfg.rate_limit_policy())
        .list_blocked()
        .await?;

    let summary = serde_json::json!({
        "config_path": path,
        "auto_admit": auto_admit,
        "delegates": {
            "total": delegates.len(),
            "active": delegates.iter().filter(|account| account.active).count(),
        },
        "outstanding_requests": outstanding.len(),
        "blocked_users": blocked.len(),
        "spaces": cfg.spaces.iter().map(|space| &space.name).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

pub async fn add_delegate(
    config_path: Option<PathBuf>,
    external_ref: &str,
    credential_file: Option<PathBuf>,
) -> Result<()> {
    let raw = match credential_file {
        Some(path) => tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read credential {}: {e}", path.display()))?,
        None => {
            let mut raw = String::new();
            tokio::io::AsyncReadExt::read_to_string(&mut tokio::io::stdin(), &mut raw).await?;
            raw
        }
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(anyhow::anyhow!("credential is empty"));
    }

    let engine = cli_engine(config_path).await?;
    let account = engine
        .pool()
        .register(external_ref, &DelegateCredential::new(raw))
        .await?;
    println!(
        "registered delegate #{} ({}), active={}",
        account.id, account.external_ref, account.active
    );
    Ok(())
}

pub async fn set_delegate_active(
    config_path: Option<PathBuf>,
    id: i64,
    active: bool,
) -> Result<()> {
    let engine = cli_engine(config_path).await?;
    let id = DelegateId::new(id);
    let changed = if active {
        engine.pool().reactivate(id).await?
    } else {
        engine.pool().deactivate(id).await?
    };
    let state = if active { "active" } else { "inactive" };
    if changed {
        println!("delegate #{id} is now {state}");
    } else {
        println!("delegate #{id} was already {state}");
    }
    Ok(())
}

pub async fn list_pending(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = GatekeepConfig::load(config_path).await?;
    let store = open_store(&cfg).await?;
    let outstanding = store.list_requests(&RequestStatus::OUTSTANDING).await?;
    if outstanding.is_empty() {
        println!("no outstanding requests");
        return Ok(());
    }
    for request in outstanding {
        println!(
            "#{}\t{}\tuser={}\tspace={}\t{}\t{}",
            request.id,
            request.status,
            request.user_id,
            request.space_id,
            request.created_at.to_rfc3339(),
            request
                .detail
                .map(|detail| detail.to_string())
                .unwrap_or_default()
        );
    }
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = GatekeepConfig::load_with_path(config_path).await?;
    let started_at = Instant::now();
    let addr = cfg.bind_addr()?;
    tracing::info!(
        config_path = %cfg_path.display(),
        bind_addr = %addr,
        data_dir = %cfg.runtime.data_dir,
        spaces = ?cfg.spaces.iter().map(|space| space.id).collect::<Vec<_>>(),
        operators = cfg.bot.operator_ids.len(),
        bridge_base_url = %cfg.bridge.base_url,
        bridge_call_timeout_secs = cfg.bridge.call_timeout_secs,
        pool_rotate_after_admissions = ?cfg.pool.rotate_after_admissions,
        pool_max_admissions_per_day = cfg.pool.max_admissions_per_day,
        rate_limit_max_requests = cfg.rate_limit.max_requests,
        rate_limit_window_secs = cfg.rate_limit.window_secs,
        rate_limit_auto_expire_after_secs = ?cfg.rate_limit.auto_expire_after_secs,
        duplicate_policy = ?cfg.admission.duplicate_policy,
        control_api_auth_configured = cfg.control_api_key().is_some(),
        http_timeout_seconds = cfg.runtime.http_timeout_seconds,
        http_max_in_flight = cfg.runtime.http_max_in_flight,
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let store = open_store(&cfg).await?;
    let bot = build_bot(&cfg)?;
    let sender: Arc<dyn ChatSender> = Arc::new(bot.clone());
    let notifier = Arc::new(TelegramNotifier::new(sender.clone(), cfg.operator_ids()));
    let engine = build_engine(&cfg, store, Arc::new(build_bridge(&cfg)?), notifier)?;

    match engine.recover().await {
        Ok(0) => tracing::info!("no unfinished requests to recover"),
        Ok(reported) => tracing::info!(reported, "startup recovery reported unfinished requests"),
        Err(e) => tracing::error!(error = %e, "startup recovery failed"),
    }

    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(256);
    let poll_handle = bot.start(inbound_tx);
    let gateway = Arc::new(Gateway::new(
        engine.clone(),
        sender,
        cfg.operator_ids(),
        inbound_rx,
    ));
    let shutdown = CancellationToken::new();
    let gateway_handle = gateway.start(shutdown.child_token());
    tracing::info!("gateway started");

    let state = Arc::new(AppState { engine, started_at });
    let policy = http_auth::MutatingAuthPolicy::from_config(&cfg);
    if cfg.control_api_key().is_none() && !policy.allow_insecure_mutating_requests {
        tracing::warn!(%addr, "no runtime.control_api_key; mutating control api routes are disabled");
    }

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = build_router(state, policy)
        .layer(GlobalConcurrencyLimitLayer::new(
            cfg.runtime.http_max_in_flight,
        ))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.runtime.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "gatekeep serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    poll_handle.abort();
    match gateway_handle.await {
        Ok(()) => tracing::info!("gateway shutdown completed"),
        Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
    }

    Ok(())
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
