pub mod transfer_server;

use std::sync::Arc;
use std::time::Duration;

use bgxfer::bridge::CollectorBridge;
use bgxfer::config::EngineConfig;
use bgxfer::manager::TransferManager;
use bgxfer::paths::EnginePaths;
use bgxfer::store::TaskStore;

/// An engine wired to a temp directory tree, an in-memory store, and a
/// collecting bridge.
pub struct TestEngine {
    pub manager: TransferManager,
    pub bridge: Arc<CollectorBridge>,
    pub paths: EnginePaths,
    _root: tempfile::TempDir,
}

pub async fn start_engine(config: EngineConfig) -> TestEngine {
    let root = tempfile::tempdir().unwrap();
    let paths = EnginePaths::rooted_at(root.path());
    let store = TaskStore::open_in_memory().await.unwrap();
    let bridge = Arc::new(CollectorBridge::new());
    let manager = TransferManager::start(
        config,
        store,
        paths.clone(),
        bridge.clone() as Arc<dyn bgxfer::bridge::CallbackBridge>,
    )
    .await
    .unwrap();
    TestEngine {
        manager,
        bridge,
        paths,
        _root: root,
    }
}

/// Poll until `predicate` returns true or the timeout elapses; panics on
/// timeout with the given label.
pub async fn wait_for(label: &str, timeout: Duration, mut predicate: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !predicate() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {label}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
