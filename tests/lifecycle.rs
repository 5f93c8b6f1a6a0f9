//! Server lifecycle integration tests.
//!
//! Covers:
//! - Local mode binding only the loopback interface
//! - Export mode creating the identity and serving TLS on the fixed port
//! - Export failures degrading to loopback-only
//! - Graceful stop, idempotent stop and rejected concurrent transitions

mod support;

use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::time::{Duration, Instant};

use axum::routing::get;
use axum::Router;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;
use tokio::sync::watch;

use homeport::http::{ExportOutcome, ListenerRole, ServerLifecycle, ServerSettings};
use homeport::identity::{CertificateStore, IdentityError};
use homeport::routes::Routers;
use homeport::{ServerError, ServerMode, ServerPhase, ServerState};

use support::{free_port, http_client, https_client};

struct Fixture {
    dir: TempDir,
    export_port: u16,
    lifecycle: ServerLifecycle,
}

impl Fixture {
    fn new(grace: Duration) -> Self {
        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    "late"
                }),
            );
        Self::with_router(app, grace)
    }

    fn with_router(app: Router, grace: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let export_port = free_port();
        let (state_tx, _state_rx) = watch::channel(ServerState::stopped(ServerMode::Local));
        let lifecycle = ServerLifecycle::new(
            ServerSettings {
                export_port,
                shutdown_grace: grace,
            },
            CertificateStore::new(dir.path().join("identity").join("cert.pfx"), "homeport"),
            Routers {
                loopback: app.clone(),
                export: app,
            },
            state_tx,
        );
        Self {
            dir,
            export_port,
            lifecycle,
        }
    }

    fn identity_path(&self) -> std::path::PathBuf {
        self.dir.path().join("identity").join("cert.pfx")
    }
}

fn port_is_free_on_all_interfaces(port: u16) -> bool {
    TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).is_ok()
}

#[tokio::test]
async fn local_mode_binds_loopback_only_and_signals_ready_once() {
    let fixture = Fixture::new(Duration::from_secs(1));
    let mut ready_calls = 0;
    let mut ready_addr = None;

    let report = fixture
        .lifecycle
        .start(ServerMode::Local, |report| {
            ready_calls += 1;
            ready_addr = Some(report.loopback_addr);
        })
        .await
        .unwrap();

    assert_eq!(ready_calls, 1);
    assert_eq!(ready_addr, Some(report.loopback_addr));
    assert!(report.loopback_addr.ip().is_loopback());
    assert!(report.loopback_addr.port() > 0);
    assert!(matches!(report.export, ExportOutcome::Disabled));

    let state = fixture.lifecycle.state();
    assert!(state.running());
    assert_eq!(state.loopback_addr, Some(report.loopback_addr));
    assert_eq!(state.export_addr, None);
    assert!(port_is_free_on_all_interfaces(fixture.export_port));
    assert!(!fixture.identity_path().exists());

    let body = http_client()
        .get(format!("{}health", report.loopback_url()))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "ok");

    fixture.lifecycle.stop().await.unwrap();
    assert_eq!(fixture.lifecycle.state(), ServerState::stopped(ServerMode::Local));
}

#[tokio::test]
async fn export_mode_creates_identity_and_serves_tls_on_fixed_port() {
    let fixture = Fixture::new(Duration::from_secs(1));
    assert!(!fixture.identity_path().exists());

    let report = fixture
        .lifecycle
        .start(ServerMode::LocalAndExported, |_| {})
        .await
        .unwrap();

    assert!(fixture.identity_path().exists());
    let (export_addr, fingerprint) = match &report.export {
        ExportOutcome::Listening {
            addr,
            identity,
            newly_generated,
        } => {
            assert!(*newly_generated);
            assert_eq!(identity.key_bits, 4096);
            (*addr, identity.fingerprint())
        }
        other => panic!("export not listening: {other:?}"),
    };
    assert_eq!(export_addr.port(), fixture.export_port);
    assert!(export_addr.ip().is_unspecified());
    assert_eq!(fixture.lifecycle.state().export_addr, Some(export_addr));

    let body = https_client()
        .get(format!("https://127.0.0.1:{}/health", fixture.export_port))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "ok");

    let body = http_client()
        .get(format!("{}health", report.loopback_url()))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "ok");

    // A restart reuses the persisted identity
    let report = fixture
        .lifecycle
        .restart(ServerMode::LocalAndExported, |_| {})
        .await
        .unwrap();
    match &report.export {
        ExportOutcome::Listening {
            identity,
            newly_generated,
            ..
        } => {
            assert!(!*newly_generated);
            assert_eq!(identity.fingerprint(), fingerprint);
        }
        other => panic!("export not listening after restart: {other:?}"),
    }

    fixture.lifecycle.stop().await.unwrap();
    assert!(port_is_free_on_all_interfaces(fixture.export_port));
}

#[tokio::test]
async fn busy_export_port_degrades_to_loopback_only() {
    let fixture = Fixture::new(Duration::from_secs(1));
    let _squatter =
        TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, fixture.export_port))).unwrap();

    let report = fixture
        .lifecycle
        .start(ServerMode::LocalAndExported, |_| {})
        .await
        .unwrap();

    match &report.export {
        ExportOutcome::Unavailable(ServerError::ListenerBindFailure { role, addr, .. }) => {
            assert_eq!(*role, ListenerRole::Export);
            assert_eq!(addr.port(), fixture.export_port);
        }
        other => panic!("expected export bind failure, got {other:?}"),
    }

    let state = fixture.lifecycle.state();
    assert!(state.running());
    assert_eq!(state.mode, ServerMode::LocalAndExported);
    assert_eq!(state.export_addr, None);

    let status = http_client()
        .get(format!("{}health", report.loopback_url()))
        .send()
        .await
        .unwrap()
        .status();
    assert!(status.is_success());

    fixture.lifecycle.stop().await.unwrap();
}

#[tokio::test]
async fn corrupt_identity_is_reported_and_kept() {
    let fixture = Fixture::new(Duration::from_secs(1));
    std::fs::create_dir_all(fixture.identity_path().parent().unwrap()).unwrap();
    std::fs::write(fixture.identity_path(), b"garbage").unwrap();

    let report = fixture
        .lifecycle
        .start(ServerMode::LocalAndExported, |_| {})
        .await
        .unwrap();

    assert!(matches!(
        report.export,
        ExportOutcome::Unavailable(ServerError::Identity(IdentityError::Corrupt { .. }))
    ));
    assert_eq!(std::fs::read(fixture.identity_path()).unwrap(), b"garbage");
    assert!(port_is_free_on_all_interfaces(fixture.export_port));

    fixture.lifecycle.stop().await.unwrap();
}

#[tokio::test]
async fn expired_identity_degrades_export_and_is_kept() {
    let fixture = Fixture::new(Duration::from_secs(1));
    let generated_on = Utc.with_ymd_and_hms(2015, 6, 1, 12, 0, 0).unwrap();
    CertificateStore::new(fixture.identity_path(), "homeport")
        .acquire_at(generated_on)
        .unwrap();
    let stored = std::fs::read(fixture.identity_path()).unwrap();

    let report = fixture
        .lifecycle
        .start(ServerMode::LocalAndExported, |_| {})
        .await
        .unwrap();

    match &report.export {
        ExportOutcome::Unavailable(ServerError::Identity(IdentityError::Expired {
            path,
            not_after,
        })) => {
            assert_eq!(path, &fixture.identity_path());
            assert!(*not_after < Utc::now());
        }
        other => panic!("expected expired identity, got {other:?}"),
    }
    assert!(port_is_free_on_all_interfaces(fixture.export_port));
    assert_eq!(std::fs::read(fixture.identity_path()).unwrap(), stored);
    assert!(fixture.lifecycle.state().running());

    fixture.lifecycle.stop().await.unwrap();
}

#[tokio::test]
async fn stop_before_start_and_repeated_stop_are_noops() {
    let fixture = Fixture::new(Duration::from_secs(1));
    fixture.lifecycle.stop().await.unwrap();
    fixture.lifecycle.stop().await.unwrap();
    assert_eq!(fixture.lifecycle.state().phase, ServerPhase::Stopped);

    fixture
        .lifecycle
        .start(ServerMode::Local, |_| {})
        .await
        .unwrap();
    fixture.lifecycle.stop().await.unwrap();
    fixture.lifecycle.stop().await.unwrap();
    assert_eq!(fixture.lifecycle.state().phase, ServerPhase::Stopped);
}

#[tokio::test]
async fn second_start_while_running_is_rejected() {
    let fixture = Fixture::new(Duration::from_secs(1));
    let report = fixture
        .lifecycle
        .start(ServerMode::Local, |_| {})
        .await
        .unwrap();

    let mut ready_called = false;
    let err = fixture
        .lifecycle
        .start(ServerMode::Local, |_| ready_called = true)
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::AlreadyRunning));
    assert!(!ready_called);
    assert_eq!(
        fixture.lifecycle.state().loopback_addr,
        Some(report.loopback_addr)
    );

    fixture.lifecycle.stop().await.unwrap();
}

#[tokio::test]
async fn transition_during_inflight_start_is_rejected() {
    let fixture = Fixture::new(Duration::from_secs(1));

    // The exported start awaits identity generation, leaving its transition open
    let (first, second, stop) = tokio::join!(
        fixture.lifecycle.start(ServerMode::LocalAndExported, |_| {}),
        fixture.lifecycle.start(ServerMode::Local, |_| {}),
        fixture.lifecycle.stop(),
    );

    first.unwrap();
    assert!(matches!(second, Err(ServerError::TransitionInProgress)));
    assert!(matches!(stop, Err(ServerError::TransitionInProgress)));
    assert_eq!(
        fixture.lifecycle.state().mode,
        ServerMode::LocalAndExported
    );

    fixture.lifecycle.stop().await.unwrap();
}

#[tokio::test]
async fn graceful_stop_closes_listener_and_cuts_overdue_requests() {
    let fixture = Fixture::new(Duration::from_millis(300));
    let report = fixture
        .lifecycle
        .start(ServerMode::Local, |_| {})
        .await
        .unwrap();
    let addr = report.loopback_addr;

    let slow = tokio::spawn({
        let url = format!("{}slow", report.loopback_url());
        async move { http_client().get(url).send().await }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    fixture.lifecycle.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    assert!(slow.await.unwrap().is_err());
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    assert_eq!(fixture.lifecycle.state().phase, ServerPhase::Stopped);
}

#[tokio::test]
async fn in_flight_request_within_grace_completes() {
    let app = Router::new().route(
        "/brief",
        get(|| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            "done"
        }),
    );
    let fixture = Fixture::with_router(app, Duration::from_secs(5));
    let report = fixture
        .lifecycle
        .start(ServerMode::Local, |_| {})
        .await
        .unwrap();

    let brief = tokio::spawn({
        let url = format!("{}brief", report.loopback_url());
        async move { http_client().get(url).send().await?.text().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    fixture.lifecycle.stop().await.unwrap();
    assert_eq!(brief.await.unwrap().unwrap(), "done");
}

#[tokio::test]
async fn mode_switch_rebinds_listeners() {
    let fixture = Fixture::new(Duration::from_secs(1));
    let local = fixture
        .lifecycle
        .start(ServerMode::Local, |_| {})
        .await
        .unwrap();

    let exported = fixture
        .lifecycle
        .restart(ServerMode::LocalAndExported, |_| {})
        .await
        .unwrap();
    assert!(matches!(exported.export, ExportOutcome::Listening { .. }));
    assert_eq!(local.mode, ServerMode::Local);
    assert_eq!(exported.mode, ServerMode::LocalAndExported);
    assert_eq!(
        fixture.lifecycle.state().loopback_addr,
        Some(exported.loopback_addr)
    );

    let back = fixture
        .lifecycle
        .restart(ServerMode::Local, |_| {})
        .await
        .unwrap();
    assert!(matches!(back.export, ExportOutcome::Disabled));
    assert!(port_is_free_on_all_interfaces(fixture.export_port));

    fixture.lifecycle.stop().await.unwrap();
}
