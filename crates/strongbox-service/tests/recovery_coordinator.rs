mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use strongbox_core::engine::ScanEvent;
use strongbox_core::error::{RecommendedAction, StrongboxError};
use strongbox_core::types::{BaseNodePeer, RecoveryProgress, RecoveryState};
use strongbox_service::{RecoveryCoordinator, RecoverySettings};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::{FakeEngine, PeerScript, peer};

fn settings(peers: Vec<BaseNodePeer>, max_attempts_per_peer: u32) -> RecoverySettings {
    RecoverySettings {
        peers,
        max_attempts_per_peer,
        connect_timeout: Duration::from_secs(5),
        scan_stall_timeout: Duration::from_millis(200),
    }
}

fn setup(settings: RecoverySettings) -> (TempDir, Arc<FakeEngine>, Arc<RecoveryCoordinator>) {
    common::init_tracing();
    let tmp = TempDir::new().unwrap();
    let engine = FakeEngine::new(tmp.path());
    let coordinator = Arc::new(RecoveryCoordinator::new(engine.clone(), settings));
    (tmp, engine, coordinator)
}

fn completed_scan() -> PeerScript {
    PeerScript::Events(vec![
        ScanEvent::ConnectingToBaseNode,
        ScanEvent::ConnectedToBaseNode,
        ScanEvent::Progress {
            current: 50,
            total: 100,
        },
        ScanEvent::Progress {
            current: 100,
            total: 100,
        },
        ScanEvent::Completed,
    ])
}

/// Collect every published state until a terminal one.
fn record(coordinator: &RecoveryCoordinator) -> tokio::task::JoinHandle<Vec<RecoveryState>> {
    let mut stream = coordinator.subscribe();
    tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(state) = stream.next().await {
            let done = state.is_terminal();
            seen.push(state);
            if done {
                break;
            }
        }
        seen
    })
}

#[tokio::test]
async fn every_peer_failing_takes_exactly_peers_times_attempts() -> anyhow::Result<()> {
    let peers = vec![peer(1), peer(2), peer(3)];
    let (_tmp, engine, coordinator) = setup(settings(peers.clone(), 2));
    engine.script(&peers[0], vec![PeerScript::Refuse]);
    engine.script(&peers[1], vec![PeerScript::Events(vec![ScanEvent::ConnectionFailed])]);
    engine.script(
        &peers[2],
        vec![PeerScript::Events(vec![
            ScanEvent::ConnectedToBaseNode,
            ScanEvent::ScanningRoundFailed,
        ])],
    );

    let err = coordinator.run(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(
        err,
        StrongboxError::ConnectionToBaseNodeFailed { attempts: 6 }
    ));
    assert_eq!(coordinator.attempts(), 6);
    let order: Vec<String> = peers
        .iter()
        .flat_map(|p| [p.address.clone(), p.address.clone()])
        .collect();
    assert_eq!(engine.started(), order);

    let RecoveryState::RecoveryFailed(cause) = coordinator.state() else {
        panic!("expected RecoveryFailed");
    };
    assert_eq!(cause.action, RecommendedAction::DeleteWalletAndRestart);
    Ok(())
}

#[tokio::test]
async fn failed_attempts_report_their_budget() -> anyhow::Result<()> {
    let peers = vec![peer(1)];
    let (_tmp, engine, coordinator) = setup(settings(peers.clone(), 3));
    engine.script(
        &peers[0],
        vec![
            PeerScript::Refuse,
            PeerScript::Events(vec![
                ScanEvent::ConnectedToBaseNode,
                ScanEvent::ScanningRoundFailed,
            ]),
            PeerScript::Refuse,
        ],
    );
    let recorder = record(&coordinator);

    assert!(coordinator.run(&CancellationToken::new()).await.is_err());
    let seen = recorder.await?;

    let failures: Vec<&RecoveryState> = seen
        .iter()
        .filter(|s| {
            matches!(
                s,
                RecoveryState::ConnectionFailed { .. } | RecoveryState::ScanningRoundFailed { .. }
            )
        })
        .collect();
    assert_eq!(
        failures,
        vec![
            &RecoveryState::ConnectionFailed { attempt: 1, limit: 3 },
            &RecoveryState::ScanningRoundFailed { attempt: 2, limit: 3 },
            &RecoveryState::ConnectionFailed { attempt: 3, limit: 3 },
        ]
    );
    assert!(matches!(seen.last(), Some(RecoveryState::RecoveryFailed(_))));
    Ok(())
}

#[tokio::test]
async fn fails_over_to_the_next_peer_in_order() -> anyhow::Result<()> {
    let peers = vec![peer(1), peer(2), peer(3)];
    let (_tmp, engine, coordinator) = setup(settings(peers.clone(), 2));
    engine.script(&peers[0], vec![PeerScript::Refuse]);
    engine.script(&peers[1], vec![completed_scan()]);
    engine.script(&peers[2], vec![completed_scan()]);
    let recorder = record(&coordinator);

    coordinator.run(&CancellationToken::new()).await?;

    assert_eq!(coordinator.state(), RecoveryState::Completed);
    assert_eq!(
        engine.started(),
        vec![
            peers[0].address.clone(),
            peers[0].address.clone(),
            peers[1].address.clone()
        ]
    );
    let seen = recorder.await?;
    assert!(seen.contains(&RecoveryState::ConnectedToBaseNode(peers[1].clone())));
    assert_eq!(seen.last(), Some(&RecoveryState::Completed));
    Ok(())
}

#[tokio::test]
async fn progress_never_moves_backwards_and_resets_on_failover() -> anyhow::Result<()> {
    let peers = vec![peer(1), peer(2)];
    let (_tmp, engine, coordinator) = setup(settings(peers.clone(), 1));
    engine.script(
        &peers[0],
        vec![PeerScript::Events(vec![
            ScanEvent::ConnectedToBaseNode,
            ScanEvent::Progress {
                current: 10,
                total: 100,
            },
            ScanEvent::Progress {
                current: 50,
                total: 100,
            },
            ScanEvent::Progress {
                current: 30,
                total: 100,
            },
            ScanEvent::ScanningRoundFailed,
        ])],
    );
    engine.script(
        &peers[1],
        vec![PeerScript::Events(vec![
            ScanEvent::Progress {
                current: 5,
                total: 100,
            },
            ScanEvent::Completed,
        ])],
    );
    let recorder = record(&coordinator);

    coordinator.run(&CancellationToken::new()).await?;

    let progress: Vec<RecoveryProgress> = recorder
        .await?
        .into_iter()
        .filter_map(|s| match s {
            RecoveryState::ScanningProgress(p) => Some(p),
            _ => None,
        })
        .collect();
    assert_eq!(
        progress,
        vec![
            RecoveryProgress::new(10, 100),
            RecoveryProgress::new(50, 100),
            RecoveryProgress::new(50, 100),
            RecoveryProgress::new(5, 100),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn stalled_scan_counts_as_a_failed_attempt() -> anyhow::Result<()> {
    let peers = vec![peer(1)];
    let (_tmp, engine, coordinator) = setup(settings(peers.clone(), 2));
    engine.script(&peers[0], vec![PeerScript::Silent]);

    let err = coordinator.run(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(
        err,
        StrongboxError::ConnectionToBaseNodeFailed { attempts: 2 }
    ));
    Ok(())
}

#[tokio::test]
async fn engine_failure_is_fatal() -> anyhow::Result<()> {
    let peers = vec![peer(1), peer(2)];
    let (_tmp, engine, coordinator) = setup(settings(peers.clone(), 3));
    engine.script(
        &peers[0],
        vec![PeerScript::Events(vec![ScanEvent::RecoveryFailed(
            "seed words do not match".to_string(),
        )])],
    );

    let err = coordinator.run(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, StrongboxError::RecoveryInternalError(_)));
    assert_eq!(coordinator.attempts(), 1);
    assert!(matches!(coordinator.state(), RecoveryState::RecoveryFailed(_)));
    Ok(())
}

#[tokio::test]
async fn empty_peer_list_fails_immediately() -> anyhow::Result<()> {
    let (_tmp, engine, coordinator) = setup(settings(vec![], 3));

    let err = coordinator.run(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(
        err,
        StrongboxError::ConnectionToBaseNodeFailed { attempts: 0 }
    ));
    assert!(engine.started().is_empty());
    assert!(matches!(coordinator.state(), RecoveryState::RecoveryFailed(_)));
    Ok(())
}

#[tokio::test]
async fn cancel_stops_peer_iteration() -> anyhow::Result<()> {
    let peers = vec![peer(1), peer(2)];
    let mut slow = settings(peers.clone(), 3);
    slow.scan_stall_timeout = Duration::from_secs(30);
    let (_tmp, engine, coordinator) = setup(slow);
    engine.script(&peers[0], vec![PeerScript::Silent]);

    let mut states = coordinator.subscribe();
    let cancel = CancellationToken::new();
    let run = {
        let coordinator = Arc::clone(&coordinator);
        let cancel = cancel.clone();
        tokio::spawn(async move { coordinator.run(&cancel).await })
    };
    states
        .wait_for(|s| matches!(s, RecoveryState::ConnectingToBaseNode(_)))
        .await;

    let second = coordinator.run(&CancellationToken::new()).await;
    assert!(matches!(second, Err(StrongboxError::RecoveryInternalError(_))));

    cancel.cancel();
    assert!(matches!(run.await?, Err(StrongboxError::Cancelled)));
    assert_eq!(coordinator.state(), RecoveryState::Cancelled);
    assert_eq!(engine.started(), vec![peers[0].address.clone()]);
    Ok(())
}

#[tokio::test]
async fn abandon_deletes_the_half_restored_wallet() -> anyhow::Result<()> {
    let peers = vec![peer(1)];
    let (_tmp, engine, coordinator) = setup(settings(peers.clone(), 1));

    assert!(coordinator.run(&CancellationToken::new()).await.is_err());
    assert!(!engine.deleted.load(Ordering::SeqCst));

    coordinator.abandon().await?;
    assert!(engine.deleted.load(Ordering::SeqCst));
    assert_eq!(coordinator.state(), RecoveryState::Idle);
    Ok(())
}

#[tokio::test]
async fn unreachable_network_on_start_moves_on() -> anyhow::Result<()> {
    let peers = vec![peer(1), peer(2)];
    let (_tmp, engine, coordinator) = setup(settings(peers.clone(), 1));
    engine.script(
        &peers[0],
        vec![PeerScript::Fail(|| {
            StrongboxError::NetworkUnavailable("no route to host".into())
        })],
    );
    engine.script(&peers[1], vec![completed_scan()]);

    coordinator.run(&CancellationToken::new()).await?;

    assert_eq!(coordinator.attempts(), 2);
    assert_eq!(coordinator.state(), RecoveryState::Completed);
    Ok(())
}

#[tokio::test]
async fn engine_error_on_start_is_fatal() -> anyhow::Result<()> {
    let peers = vec![peer(1), peer(2)];
    let (_tmp, engine, coordinator) = setup(settings(peers.clone(), 3));
    engine.script(
        &peers[0],
        vec![PeerScript::Fail(|| {
            StrongboxError::RecoveryInternalError("wallet database locked".into())
        })],
    );

    let err = coordinator.run(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, StrongboxError::RecoveryInternalError(_)));
    assert_eq!(engine.started(), vec![peers[0].address.clone()]);
    assert!(matches!(coordinator.state(), RecoveryState::RecoveryFailed(_)));
    Ok(())
}
