// Integration tests for the lifecycle coordinator and its HTTP surface

mod common;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::InstrumentedBackend;
use screen_recorder::config::RecordingConfig;
use screen_recorder::{
    create_router, AppState, CaptureGrant, Coordinator, CoordinatorEvent, CoordinatorHandle,
    PipelineState, RecorderStatus, StartOutcome,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tower::ServiceExt;

fn start_coordinator(
    temp_dir: &TempDir,
) -> (Arc<InstrumentedBackend>, CoordinatorHandle, tokio::task::JoinHandle<()>) {
    let backend = Arc::new(InstrumentedBackend::new(640, 360));
    let recording = RecordingConfig {
        output_path: temp_dir.path().join("coordinated.srec"),
        ..RecordingConfig::default()
    };
    let (coordinator, handle) = Coordinator::new(backend.clone(), recording);
    let task = tokio::spawn(coordinator.run());
    (backend, handle, task)
}

async fn next_event(
    events: &mut broadcast::Receiver<CoordinatorEvent>,
) -> Result<CoordinatorEvent> {
    let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .context("timed out waiting for a coordinator event")??;
    Ok(event)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_stop_lifecycle() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let (backend, handle, task) = start_coordinator(&temp_dir);
    let mut events = handle.subscribe();

    assert_eq!(handle.status(), RecorderStatus::default());

    let session_id = match handle.start(CaptureGrant::Granted).await? {
        StartOutcome::Started { session_id } => session_id,
        other => panic!("unexpected start outcome: {:?}", other),
    };
    assert!(matches!(
        next_event(&mut events).await?,
        CoordinatorEvent::Status(RecorderStatus {
            is_recording: true,
            is_paused: false
        })
    ));
    assert!(handle.status().is_recording);

    // A second start is a no-op
    assert_eq!(
        handle.start(CaptureGrant::Granted).await?,
        StartOutcome::AlreadyRecording {
            session_id: session_id.clone()
        }
    );

    handle.query_status().await?;
    assert!(matches!(
        next_event(&mut events).await?,
        CoordinatorEvent::Status(RecorderStatus {
            is_recording: true,
            ..
        })
    ));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(handle.stop().await?);

    // The session stays active until its teardown has finished
    let stats = match next_event(&mut events).await? {
        CoordinatorEvent::SessionEnded(stats) => stats,
        other => panic!("expected SessionEnded, got {:?}", other),
    };
    assert_eq!(stats.session_id, session_id);
    assert_eq!(stats.state, PipelineState::Closed);
    assert!(stats.output_path.is_some());
    backend.counters.assert_balanced();

    assert!(matches!(
        next_event(&mut events).await?,
        CoordinatorEvent::Status(RecorderStatus {
            is_recording: false,
            ..
        })
    ));
    assert!(!handle.status().is_recording);

    // Nothing left to stop
    assert!(!handle.stop().await?);

    drop(handle);
    task.await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_after_stop_waits_for_teardown() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let (backend, handle, task) = start_coordinator(&temp_dir);
    let mut events = handle.subscribe();

    let first = match handle.start(CaptureGrant::Granted).await? {
        StartOutcome::Started { session_id } => session_id,
        other => panic!("unexpected start outcome: {:?}", other),
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(handle.stop().await?);

    // Status and start agree for as long as the old session is held
    loop {
        let recording = handle.status().is_recording;
        let outcome = handle.start(CaptureGrant::Granted).await?;
        match outcome {
            StartOutcome::AlreadyRecording { session_id } => {
                assert!(recording, "start refused while status reported idle");
                assert_eq!(session_id, first);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            StartOutcome::Started { session_id } => {
                assert_ne!(session_id, first);
                break;
            }
            other => panic!("unexpected start outcome: {:?}", other),
        }
    }
    assert!(handle.status().is_recording);

    let ended = loop {
        if let CoordinatorEvent::SessionEnded(stats) = next_event(&mut events).await? {
            break stats;
        }
    };
    assert_eq!(ended.session_id, first);

    drop(handle);
    tokio::time::timeout(Duration::from_secs(10), task).await??;
    backend.counters.assert_balanced();
    Ok(())
}

#[tokio::test]
async fn test_denied_permission_is_reported() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let (backend, handle, task) = start_coordinator(&temp_dir);
    let mut events = handle.subscribe();

    assert_eq!(
        handle.start(CaptureGrant::Denied).await?,
        StartOutcome::PermissionDenied
    );
    assert!(matches!(
        next_event(&mut events).await?,
        CoordinatorEvent::PermissionDenied
    ));
    assert!(!handle.status().is_recording);
    assert_eq!(backend.counters.display.acquired(), 0);

    drop(handle);
    task.await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropping_every_handle_stops_the_session() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let (backend, handle, task) = start_coordinator(&temp_dir);

    assert!(matches!(
        handle.start(CaptureGrant::Granted).await?,
        StartOutcome::Started { .. }
    ));
    tokio::time::sleep(Duration::from_millis(300)).await;

    drop(handle);
    tokio::time::timeout(Duration::from_secs(10), task).await??;
    backend.counters.assert_balanced();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_http_routes() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let (_backend, handle, task) = start_coordinator(&temp_dir);
    let app = create_router(AppState::new(handle.clone()));

    let response = app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::post("/recording/start")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"permission_granted": false}"#))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .clone()
        .oneshot(Request::post("/recording/start").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    let json: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(json["result"], "started");

    let response = app
        .clone()
        .oneshot(Request::post("/recording/start").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .clone()
        .oneshot(Request::get("/recording/status").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    let status: RecorderStatus = serde_json::from_slice(&body)?;
    assert!(status.is_recording);
    assert!(!status.is_paused);

    let response = app
        .clone()
        .oneshot(Request::post("/recording/stop").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    let json: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(json["stopping"], true);

    // Reported as recording until teardown completes
    let mut idle = false;
    for _ in 0..200 {
        let response = app
            .clone()
            .oneshot(Request::get("/recording/status").body(Body::empty())?)
            .await?;
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        let status: RecorderStatus = serde_json::from_slice(&body)?;
        if !status.is_recording {
            idle = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(idle, "session never finished tearing down");

    let response = app
        .clone()
        .oneshot(Request::post("/recording/start").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    drop(app);
    drop(handle);
    tokio::time::timeout(Duration::from_secs(10), task).await??;
    Ok(())
}
