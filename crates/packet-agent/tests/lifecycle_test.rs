//! Lifecycle tests: initialize, start, stop and the state table as seen by a host
mod common;

use common::*;
use packet_agent::{Agent, AgentOptions, InitError, SessionState, StatusCode};
use packet_proto::ControlMessage;
use std::time::Duration;

#[tokio::test]
async fn test_start_before_initialize_is_rejected() {
    let agent = Agent::new();
    let recorder = EventRecorder::install(&agent);

    let err = agent.start().expect_err("start must fail before initialize");
    assert_eq!(err.state, SessionState::Uninitialized);
    assert_eq!(agent.state(), SessionState::Uninitialized);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(recorder.events().is_empty(), "{:?}", recorder.events());
}

#[tokio::test]
async fn test_initialize_validates_app_key() {
    let agent = Agent::new();

    assert_eq!(
        agent.initialize("", AgentOptions::default()),
        Err(InitError::EmptyAppKey)
    );
    assert_eq!(
        agent.initialize("has space", AgentOptions::default()),
        Err(InitError::InvalidAppKey)
    );
    assert_eq!(agent.state(), SessionState::Uninitialized);

    agent
        .initialize("valid-key", AgentOptions::default())
        .unwrap();
    assert_eq!(
        agent.initialize("valid-key", AgentOptions::default()),
        Err(InitError::AlreadyInitialized)
    );
}

#[tokio::test]
async fn test_initialize_rejects_bad_options() {
    let agent = Agent::new();
    let options = AgentOptions::builder()
        .connect_timeout(Duration::ZERO)
        .build();

    assert!(matches!(
        agent.initialize("valid-key", options),
        Err(InitError::InvalidOptions(_))
    ));
    assert_eq!(agent.state(), SessionState::Uninitialized);
}

#[tokio::test]
async fn test_start_run_stop() {
    let server = MockControlServer::start(Mode::Welcome).await;
    let (agent, recorder) = running_agent(&server).await;

    let hello = server
        .recv_matching(|m| matches!(m, ControlMessage::Hello { .. }))
        .await;
    match hello {
        ControlMessage::Hello {
            agent_id, app_key, ..
        } => {
            assert_eq!(app_key, "test-app-key");
            assert_eq!(agent_id, agent.agent_id());
        }
        other => panic!("unexpected {:?}", other),
    }

    recorder.wait_for(StatusCode::ControlConnected.code()).await;
    assert_eq!(agent.stats().live_connections, 1);

    agent.stop().await.unwrap();
    assert_eq!(agent.state(), SessionState::Stopped);

    // Graceful disconnect reached the server
    server
        .recv_matching(|m| matches!(m, ControlMessage::Disconnect { .. }))
        .await;

    recorder.wait_for(StatusCode::Stopped.code()).await;
    let lifecycle: Vec<i32> = recorder
        .codes()
        .into_iter()
        .filter(|c| (100..=150).contains(c))
        .collect();
    assert_eq!(lifecycle, vec![100, 110, 120, 130, 140]);

    assert!(agent.connections().is_empty());
    assert_eq!(agent.stats().live_connections, 0);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let server = MockControlServer::start(Mode::Welcome).await;
    let (agent, recorder) = running_agent(&server).await;

    agent.stop().await.unwrap();
    recorder.wait_for(StatusCode::Stopped.code()).await;

    agent.stop().await.unwrap();
    agent.stop().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(agent.state(), SessionState::Stopped);
    assert_eq!(recorder.count(StatusCode::Stopping.code()), 1);
    assert_eq!(recorder.count(StatusCode::Stopped.code()), 1);
}

#[tokio::test]
async fn test_start_while_running_is_rejected() {
    let server = MockControlServer::start(Mode::Welcome).await;
    let (agent, _recorder) = running_agent(&server).await;

    let err = agent.start().unwrap_err();
    assert_eq!(err.state, SessionState::Running);
    assert_eq!(agent.state(), SessionState::Running);
    assert_eq!(server.accepts(), 1);

    agent.stop().await.unwrap();
}

#[tokio::test]
async fn test_restart_after_stop() {
    let server = MockControlServer::start(Mode::Welcome).await;
    let (agent, recorder) = running_agent(&server).await;

    agent.stop().await.unwrap();
    agent.start().unwrap();
    wait_for_state(&agent, SessionState::Running).await;

    assert_eq!(server.accepts(), 2);
    recorder.wait_for_count(StatusCode::Running.code(), 2).await;

    agent.stop().await.unwrap();
    assert_eq!(agent.stats().live_connections, 0);
}

#[tokio::test]
async fn test_stop_while_starting() {
    // Nothing listens, so the agent stays in Starting between retries
    let agent = Agent::new();
    let mut options = test_options(&closed_port().await);
    options.reconnect.initial_backoff = Duration::from_secs(5);
    options.reconnect.max_backoff = Duration::from_secs(30);
    agent.initialize("test-app-key", options).unwrap();

    agent.start().unwrap();
    assert_eq!(agent.state(), SessionState::Starting);

    let started = std::time::Instant::now();
    agent.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(agent.state(), SessionState::Stopped);
}

#[tokio::test]
async fn test_listener_replacement_and_logging_toggle() {
    let server = MockControlServer::start(Mode::Welcome).await;
    let agent = Agent::new();
    let first = EventRecorder::install(&agent);

    agent
        .initialize("test-app-key", test_options(&server.addr))
        .unwrap();
    first.wait_for(StatusCode::Initialized.code()).await;

    let second = EventRecorder::install(&agent);
    agent.set_enable_logging(true);
    agent.start().unwrap();
    wait_for_state(&agent, SessionState::Running).await;
    second.wait_for(StatusCode::Running.code()).await;

    // Connect diagnostics are published once logging is on
    second.wait_for(StatusCode::Log.code()).await;
    assert_eq!(first.count(StatusCode::Running.code()), 0);

    agent.stop().await.unwrap();
}
