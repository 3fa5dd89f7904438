use std::sync::{Arc, Mutex};
use std::time::Duration;

use httpmock::prelude::*;
use blob_transfer_manager::config::{BackoffConfig, ManagerConfig};
use blob_transfer_manager::manager::TransferDelegate;
use blob_transfer_manager::model::{
    BlobTransfer, BlockTransfer, Direction, NewTransfer, TransferProperties, TransferRecord,
    TransferState,
};
use blob_transfer_manager::reachability::PollingReachabilityMonitor;
use blob_transfer_manager::store::file_store::FileSystemStore;
use blob_transfer_manager::store::PersistentStore;
use blob_transfer_manager::transport::{block_id_for, ReqwestTransport};
use blob_transfer_manager::manager::TransferManager;

#[derive(Default)]
struct RecordingDelegate {
    states: Mutex<Vec<(String, TransferState)>>,
}

impl TransferDelegate for RecordingDelegate {
    fn on_state_changed(&self, transfer_id: &str, state: TransferState) {
        self.states.lock().unwrap().push((transfer_id.to_string(), state));
    }
}

fn never_polling_monitor() -> Arc<PollingReachabilityMonitor> {
    Arc::new(PollingReachabilityMonitor::spawn(Duration::from_secs(3600), || true))
}

async fn build_manager(store_dir: &std::path::Path) -> (Arc<TransferManager>, Arc<RecordingDelegate>) {
    let store = Arc::new(FileSystemStore::open(store_dir).await.unwrap());
    let transport = Arc::new(ReqwestTransport::new(BackoffConfig::standard_operation()).unwrap());
    let reachability = never_polling_monitor();

    let config = ManagerConfig {
        max_concurrent: 2,
        chunk_size: 4,
        ..ManagerConfig::default()
    };

    let manager = TransferManager::new(store, transport, reachability, config)
        .await
        .unwrap();
    let delegate = Arc::new(RecordingDelegate::default());
    manager.set_delegate(delegate.clone() as Arc<dyn TransferDelegate>).await;
    (manager, delegate)
}

async fn wait_for_state(
    manager: &Arc<TransferManager>,
    id: &str,
    target: TransferState,
    timeout: Duration,
) -> TransferState {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let state = manager.get(id).await.map(|b| b.state);
        if state == Some(target) || tokio::time::Instant::now() >= deadline {
            return state.unwrap_or(TransferState::Pending);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn upload_splits_into_blocks_and_commits() {
    let server = MockServer::start();
    let tmp = tempfile::tempdir().unwrap();

    let source_path = tmp.path().join("payload.bin");
    tokio::fs::write(&source_path, b"hello world").await.unwrap();

    let block_mock = server.mock(|when, then| {
        when.method(PUT).query_param("comp", "block");
        then.status(201);
    });
    let commit_mock = server.mock(|when, then| {
        when.method(PUT).query_param("comp", "blocklist");
        then.status(201);
    });

    let (manager, delegate) = build_manager(tmp.path().join("store").as_path()).await;

    let destination = format!("{}/container/payload.bin", server.base_url());
    let id = manager
        .add(NewTransfer {
            direction: Direction::Upload,
            source: source_path.to_string_lossy().to_string(),
            destination,
            client_restoration_id: "test-upload".to_string(),
            properties: TransferProperties::default(),
        })
        .await
        .unwrap();

    let final_state = wait_for_state(&manager, &id, TransferState::Complete, Duration::from_secs(5)).await;
    assert_eq!(final_state, TransferState::Complete);

    // "hello world" is 11 bytes, chunk size 4 -> 3 blocks (4, 4, 3).
    assert!(block_mock.hits() >= 3);
    commit_mock.assert();

    let states = delegate.states.lock().unwrap();
    assert!(states.iter().any(|(tid, state)| tid == &id && *state == TransferState::Complete));
}

#[tokio::test]
async fn download_probes_then_fetches_ranges() {
    let server = MockServer::start();
    let tmp = tempfile::tempdir().unwrap();

    let contents = b"hello world";
    server.mock(|when, then| {
        when.method(HEAD);
        then.status(200).header("Content-Range", "bytes 0-0/11");
    });
    // chunk_size=4 over an 11-byte object splits into ranges [0,4), [4,8), [8,11).
    server.mock(|when, then| {
        when.method(GET).header("Range", "bytes=0-3");
        then.status(200).body(contents[0..4].to_vec());
    });
    server.mock(|when, then| {
        when.method(GET).header("Range", "bytes=4-7");
        then.status(200).body(contents[4..8].to_vec());
    });
    server.mock(|when, then| {
        when.method(GET).header("Range", "bytes=8-10");
        then.status(200).body(contents[8..11].to_vec());
    });

    let (manager, _delegate) = build_manager(tmp.path().join("store").as_path()).await;

    let destination_path = tmp.path().join("downloaded.bin");
    let id = manager
        .add(NewTransfer {
            direction: Direction::Download,
            source: format!("{}/container/payload.bin", server.base_url()),
            destination: destination_path.to_string_lossy().to_string(),
            client_restoration_id: "test-download".to_string(),
            properties: TransferProperties::default(),
        })
        .await
        .unwrap();

    let final_state = wait_for_state(&manager, &id, TransferState::Complete, Duration::from_secs(5)).await;
    assert_eq!(final_state, TransferState::Complete);

    let downloaded = tokio::fs::read(&destination_path).await.unwrap();
    assert_eq!(downloaded, contents);
}

#[tokio::test]
async fn pause_stops_further_block_commits() {
    let server = MockServer::start();
    let tmp = tempfile::tempdir().unwrap();

    let source_path = tmp.path().join("payload.bin");
    tokio::fs::write(&source_path, vec![0u8; 64]).await.unwrap();

    server.mock(|when, then| {
        when.method(PUT).query_param("comp", "block");
        then.status(201).delay(Duration::from_millis(50));
    });
    server.mock(|when, then| {
        when.method(PUT).query_param("comp", "blocklist");
        then.status(201);
    });

    let (manager, _delegate) = build_manager(tmp.path().join("store").as_path()).await;

    let destination = format!("{}/container/payload.bin", server.base_url());
    let id = manager
        .add(NewTransfer {
            direction: Direction::Upload,
            source: source_path.to_string_lossy().to_string(),
            destination,
            client_restoration_id: "test-pause".to_string(),
            properties: TransferProperties::default(),
        })
        .await
        .unwrap();

    manager.pause(&id).await.unwrap();
    let state = manager.get(&id).await.unwrap().state;
    assert_eq!(state, TransferState::Paused);
}

#[tokio::test]
async fn remove_deletes_record_from_store() {
    let tmp = tempfile::tempdir().unwrap();
    let source_path = tmp.path().join("payload.bin");
    tokio::fs::write(&source_path, b"x").await.unwrap();

    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(PUT);
        then.status(201);
    });

    let (manager, _delegate) = build_manager(tmp.path().join("store").as_path()).await;
    let destination = format!("{}/container/payload.bin", server.base_url());
    let id = manager
        .add(NewTransfer {
            direction: Direction::Upload,
            source: source_path.to_string_lossy().to_string(),
            destination,
            client_restoration_id: "test-remove".to_string(),
            properties: TransferProperties::default(),
        })
        .await
        .unwrap();

    manager.remove(&id).await.unwrap();
    assert!(manager.get(&id).await.is_none());
}

#[tokio::test]
async fn pause_and_cancel_are_idempotent() {
    let server = MockServer::start();
    let tmp = tempfile::tempdir().unwrap();
    let source_path = tmp.path().join("payload.bin");
    tokio::fs::write(&source_path, vec![0u8; 64]).await.unwrap();

    server.mock(|when, then| {
        when.method(PUT).query_param("comp", "block");
        then.status(201).delay(Duration::from_millis(50));
    });
    server.mock(|when, then| {
        when.method(PUT).query_param("comp", "blocklist");
        then.status(201);
    });

    let (manager, _delegate) = build_manager(tmp.path().join("store").as_path()).await;
    let destination = format!("{}/container/payload.bin", server.base_url());
    let id = manager
        .add(NewTransfer {
            direction: Direction::Upload,
            source: source_path.to_string_lossy().to_string(),
            destination,
            client_restoration_id: "test-idempotent".to_string(),
            properties: TransferProperties::default(),
        })
        .await
        .unwrap();

    manager.pause(&id).await.unwrap();
    manager.pause(&id).await.unwrap();
    assert_eq!(manager.get(&id).await.unwrap().state, TransferState::Paused);

    manager.cancel(&id).await.unwrap();
    manager.cancel(&id).await.unwrap();
    assert_eq!(manager.get(&id).await.unwrap().state, TransferState::Canceled);

    manager.remove(&id).await.unwrap();
    manager.remove(&id).await.unwrap();
    assert!(manager.get(&id).await.is_none());
}

struct NoRestorationDelegate;

impl TransferDelegate for NoRestorationDelegate {
    fn client_for_restoration(&self, _restoration_id: &str) -> Option<Arc<ReqwestTransport>> {
        None
    }
}

/// Scenario 6 (spec §8): resuming a transfer whose `client_restoration_id` the delegate can't
/// restore a client for transitions it to `failed` with `ClientRestorationFailure`, and leaves
/// other transfers alone.
#[tokio::test]
async fn resume_fails_transfer_when_client_cannot_be_restored() {
    let tmp = tempfile::tempdir().unwrap();
    let store_dir = tmp.path().join("store");
    let store = Arc::new(FileSystemStore::open(&store_dir).await.unwrap());

    let mut blob = BlobTransfer::new(
        Direction::Upload,
        "/nonexistent/source.bin",
        "https://example.invalid/container/blob.bin",
        "unknown-restoration-id",
        TransferProperties::default(),
    );
    blob.state = TransferState::Paused;
    let id = blob.id.clone();
    store.insert(TransferRecord::Blob(blob)).await.unwrap();

    let transport = Arc::new(ReqwestTransport::new(BackoffConfig::standard_operation()).unwrap());
    let reachability = never_polling_monitor();
    let manager = TransferManager::new(store, transport, reachability, ManagerConfig::default())
        .await
        .unwrap();
    manager
        .set_delegate(Arc::new(NoRestorationDelegate) as Arc<dyn TransferDelegate>)
        .await;

    manager.resume(&id).await.unwrap();

    let blob = manager.get(&id).await.unwrap();
    assert_eq!(blob.state, TransferState::Failed);
    assert!(blob.error.unwrap().contains("client-restoration-failure"));
}

struct RestoringDelegate {
    transport: Arc<ReqwestTransport>,
}

impl TransferDelegate for RestoringDelegate {
    fn client_for_restoration(&self, _restoration_id: &str) -> Option<Arc<ReqwestTransport>> {
        Some(Arc::clone(&self.transport))
    }
}

/// Scenario 5 (spec §8): resuming a transfer that crashed with some blocks already `Complete`
/// finishes without re-uploading those blocks, and still reaches the finalize/commit step —
/// the hang and the re-upload this guards against are exactly what review comments 2 and 3 fixed.
#[tokio::test]
async fn resume_completes_partially_complete_upload_without_redoing_finished_blocks() {
    let server = MockServer::start();
    let tmp = tempfile::tempdir().unwrap();

    let chunk_size = 4u64;
    let payload = vec![7u8; 20];
    let source_path = tmp.path().join("payload.bin");
    tokio::fs::write(&source_path, &payload).await.unwrap();

    let block_mock = server.mock(|when, then| {
        when.method(PUT).query_param("comp", "block");
        then.status(201);
    });
    let commit_mock = server.mock(|when, then| {
        when.method(PUT).query_param("comp", "blocklist");
        then.status(201);
    });

    let store_dir = tmp.path().join("store");
    let store = Arc::new(FileSystemStore::open(&store_dir).await.unwrap());

    let destination = format!("{}/container/payload.bin", server.base_url());
    let mut blob = BlobTransfer::new(
        Direction::Upload,
        source_path.to_string_lossy().to_string(),
        destination,
        "test-resume-complete",
        TransferProperties::default(),
    );
    blob.state = TransferState::Paused;
    blob.initial_call_complete = true;
    blob.total_blocks = 5;
    let blob_id = blob.id.clone();

    // 5 blocks of 4 bytes each; the first two are already `Complete` from a prior run, the
    // remaining three are still `Pending` and must be the only ones re-uploaded on resume.
    for index in 0..5u32 {
        let start = index as u64 * chunk_size;
        let end = (start + chunk_size).min(payload.len() as u64);
        let mut block = BlockTransfer::new(block_id_for(&blob_id, index), blob_id.clone(), start, end);
        block.state = if index < 2 {
            TransferState::Complete
        } else {
            TransferState::Pending
        };
        store.insert(TransferRecord::Block(block)).await.unwrap();
    }
    store.insert(TransferRecord::Blob(blob)).await.unwrap();

    let transport = Arc::new(ReqwestTransport::new(BackoffConfig::standard_operation()).unwrap());
    let reachability = never_polling_monitor();
    let config = ManagerConfig {
        max_concurrent: 2,
        chunk_size,
        ..ManagerConfig::default()
    };
    let manager = TransferManager::new(store, Arc::clone(&transport), reachability, config)
        .await
        .unwrap();
    manager
        .set_delegate(Arc::new(RestoringDelegate { transport }) as Arc<dyn TransferDelegate>)
        .await;

    manager.resume(&blob_id).await.unwrap();

    let final_state = wait_for_state(&manager, &blob_id, TransferState::Complete, Duration::from_secs(5)).await;
    assert_eq!(final_state, TransferState::Complete);

    // Only the 3 still-pending blocks should have triggered a PUT; the 2 already-`Complete`
    // blocks must not be re-uploaded.
    assert_eq!(block_mock.hits(), 3);
    commit_mock.assert();
}
