use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::tether::{
    admin, config, logging, net,
    status::StatusResponder,
    telemetry,
    tunnel::{
        origin::{ControlClient, OriginOptions},
        registry::Registry,
        relay::{Relay, RelayOptions},
    },
    voice::{VoiceBridgeClient, VoiceClientOptions, VoiceRelay, VoiceRelayOptions},
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    let relay_enabled = cfg.relay.is_some();
    let origin_enabled = cfg.origin.is_some();

    tracing::info!(
        config = %resolved.path.display(),
        relay_enabled,
        origin_enabled,
        voice_enabled = cfg.voice.enabled,
        admin_addr = %cfg.admin_addr,
        "tether: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();
    let mut admin_state = admin::AdminState {
        prom: Some(prom),
        ..admin::AdminState::default()
    };

    // Relay role.
    if let Some(rc) = &cfg.relay {
        let responder = Arc::new(StatusResponder::new(&cfg.status));
        tracing::debug!(status = %responder.json(), "offline: status document");

        let registry = Arc::new(Registry::new(cfg.tunnel.max_pending));
        let relay = Arc::new(Relay::new(
            RelayOptions {
                auth_token: cfg.tunnel.auth_token.clone(),
                hello_timeout: cfg.tunnel.hello_timeout,
                pending_timeout: cfg.tunnel.pending_timeout,
            },
            registry.clone(),
            responder,
        ));
        admin_state.control = Some(relay.control());
        admin_state.registry = Some(registry);

        {
            let relay = relay.clone();
            let addr = rc.control_addr.clone();
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { relay.serve_control_with_shutdown(&addr, shutdown).await });
        }
        {
            let addr = rc.public_game_addr.clone();
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { relay.serve_public_with_shutdown(&addr, shutdown).await });
        }

        if cfg.relay_voice_enabled() {
            let voice = Arc::new(
                VoiceRelay::bind(
                    &rc.public_voice_addr,
                    VoiceRelayOptions {
                        max_record_bytes: cfg.voice.max_record_bytes,
                    },
                )
                .await?,
            );
            admin_state.voice_relay = Some(voice.clone());

            {
                let voice = voice.clone();
                let addr = rc.voice_bridge_addr.clone();
                let shutdown = shutdown_rx.clone();
                tasks.spawn(async move { voice.serve_bridge_with_shutdown(&addr, shutdown).await });
            }
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { voice.serve_public(shutdown).await });
        }
    }

    // Origin role.
    if let Some(oc) = &cfg.origin {
        let client = ControlClient::new(OriginOptions {
            relay_addr: oc.relay_control_addr(),
            local_addr: oc.local_game_addr(),
            auth_token: cfg.tunnel.auth_token.clone(),
            reconnect_delay: oc.reconnect_delay,
            dial_timeout: oc.dial_timeout,
        })?;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { client.run(shutdown).await });

        if cfg.voice.enabled {
            let voice = Arc::new(VoiceBridgeClient::new(VoiceClientOptions {
                relay_addr: oc.relay_voice_addr(),
                local_addr: oc.local_voice_addr(),
                reconnect_delay: oc.reconnect_delay,
                dial_timeout: oc.dial_timeout,
                max_sessions: cfg.voice.max_sessions,
                session_idle_timeout: cfg.voice.session_idle_timeout,
                max_record_bytes: cfg.voice.max_record_bytes,
            })?);
            admin_state.voice_client = Some(voice.clone());

            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { voice.run(shutdown).await });
        }
    }

    // Admin server.
    if !cfg.admin_addr.is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        res = shutdown_signal() => {
            res?;
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Drain tasks; only enforce a timeout if something hangs.
    let _ = shutdown_tx.send(true);
    let drain = async { while tasks.join_next().await.is_some() {} };

    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tracing::warn!(
            timeout = %humantime::format_duration(drain_timeout),
            "shutdown: tasks did not stop in time; aborting"
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).context("install SIGTERM handler")?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    Ok(())
}
