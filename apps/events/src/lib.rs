#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::{
    config::Config,
    db::PostgresWebhookLedger,
    ledger::{InMemoryWebhookLedger, WebhookLedger},
    rate_limit::FixedWindowLimiter,
    registry::ConnectionRegistry,
    retry::RetryCoordinator,
    reward::{HttpRewardLedger, RewardLedger, StaticRewardLedger},
    router::EventRouter,
    server::{AppState, build_router},
    socket_auth::SocketAuthorizer,
};

pub mod config;
pub mod db;
pub mod ledger;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod reward;
pub mod router;
pub mod server;
pub mod signature;
pub mod socket_auth;
pub mod types;

pub async fn build_state(config: Config) -> Result<AppState> {
    let ledger: Arc<dyn WebhookLedger> = match config.db_url.clone() {
        Some(url) => Arc::new(PostgresWebhookLedger::connect(url.as_str()).await?),
        None => Arc::new(InMemoryWebhookLedger::new(config.ledger_memory_capacity)),
    };
    let rewards: Arc<dyn RewardLedger> = match config.reward_ledger_base_url.clone() {
        Some(base_url) => Arc::new(HttpRewardLedger::new(
            base_url,
            config.reward_ledger_auth_token.clone(),
            Duration::from_millis(config.reward_ledger_timeout_ms),
        )?),
        None => Arc::new(StaticRewardLedger),
    };

    let webhook_limiter = Arc::new(FixedWindowLimiter::new(
        config.webhook_rate_window_ms,
        config.webhook_rate_max,
    ));
    let api_limiter = Arc::new(FixedWindowLimiter::new(
        config.api_rate_window_ms,
        config.api_rate_max,
    ));
    let admin_limiter = Arc::new(FixedWindowLimiter::new(
        config.admin_rate_window_ms,
        config.admin_rate_max,
    ));

    let registry = Arc::new(ConnectionRegistry::new());
    let socket_auth = Arc::new(SocketAuthorizer::from_config(&config.socket_auth_config()));
    let router = Arc::new(EventRouter::new(
        webhook_limiter.clone(),
        ledger.clone(),
        rewards,
        registry.clone(),
        config.router_policy(),
    ));
    let retries = Arc::new(RetryCoordinator::new(ledger.clone(), router.clone()));

    Ok(AppState::new(
        config,
        router,
        retries,
        registry,
        ledger,
        socket_auth,
        webhook_limiter,
        api_limiter,
        admin_limiter,
    ))
}

/// The two periodic sweeps owned by the process: rate-limit window cleanup
/// and heartbeat liveness probing. Both stop through the same shutdown
/// channel so no timer outlives teardown.
pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

pub fn spawn_background_tasks(state: &AppState) -> BackgroundTasks {
    let (shutdown, _) = watch::channel(false);
    let mut handles = Vec::new();

    let limiters = state.rate_limiters();
    let sweep_interval = state.rate_sweep_interval();
    let mut sweep_shutdown = shutdown.subscribe();
    handles.push(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mut removed = 0usize;
                    for limiter in &limiters {
                        removed += limiter.sweep_expired().await;
                    }
                    if removed > 0 {
                        tracing::debug!(removed, "expired rate limit windows swept");
                    }
                }
                changed = sweep_shutdown.changed() => {
                    if changed.is_err() || *sweep_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }));

    let registry = state.registry();
    let heartbeat_interval = state.heartbeat_interval();
    let mut heartbeat_shutdown = shutdown.subscribe();
    handles.push(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = registry.sweep_heartbeats().await;
                    if evicted > 0 {
                        tracing::info!(evicted, "dead connections evicted by heartbeat sweep");
                    }
                }
                changed = heartbeat_shutdown.changed() => {
                    if changed.is_err() || *heartbeat_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }));

    BackgroundTasks { shutdown, handles }
}

pub async fn build_app(config: Config) -> Result<axum::Router> {
    Ok(build_router(build_state(config).await?))
}

pub async fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    let state = build_state(config.clone()).await?;
    let tasks = spawn_background_tasks(&state);
    info!(
        service = %config.service_name,
        bind_addr = %config.bind_addr,
        "events service listening"
    );
    axum::serve(listener, build_router(state)).await?;
    tasks.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::extract::ws::Message;
    use tokio::sync::mpsc;

    use super::{build_state, spawn_background_tasks};
    use crate::config::Config;

    #[tokio::test]
    async fn background_tasks_stop_on_shutdown() {
        let mut config = Config::for_tests();
        config.heartbeat_interval_ms = 100;
        config.rate_sweep_interval_ms = 100;
        let state = build_state(config).await.expect("state");

        let (tx, mut rx) = mpsc::unbounded_channel();
        state.registry().register("customer-a", tx).await;

        let tasks = spawn_background_tasks(&state);
        // Two sweep cycles with no pong: the heartbeat task evicts the socket.
        tokio::time::sleep(Duration::from_millis(350)).await;
        tasks.shutdown().await;

        let mut saw_close = false;
        while let Ok(message) = rx.try_recv() {
            if matches!(message, Message::Close(_)) {
                saw_close = true;
            }
        }
        assert!(saw_close);
        assert_eq!(state.registry().connection_counts().await, (0, 0));
    }
}
