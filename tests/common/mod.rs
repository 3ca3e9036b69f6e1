//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use pressline::cluster::LocalDelegate;
use pressline::config::Config;
use pressline::progress::MockHistoryStore;
use pressline::publish::{AllowAllGate, MockPublisher, StaticDirectory};
use pressline::queue::{DirtyQueue, SqliteQueueStore};
use pressline::{
    AttributeSet, ChannelId, DirtAction, ObjectRef, PublishDriver, RunController,
};

/// Full production-shaped stack over a temp-dir SQLite store.
pub struct TestStack {
    pub queue: Arc<DirtyQueue>,
    pub publisher: Arc<MockPublisher>,
    pub history: Arc<MockHistoryStore>,
    pub controller: Arc<RunController>,
    // keeps the database directory alive for the test's duration
    _tempdir: tempfile::TempDir,
}

impl TestStack {
    pub fn new(partitions: Vec<ChannelId>) -> Self {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(
            SqliteQueueStore::new(tempdir.path().join("queue.db")).expect("queue store"),
        );
        let config = Config::default();
        let queue = Arc::new(DirtyQueue::new(
            store,
            Arc::new(AllowAllGate),
            &config.queue,
        ));
        let publisher = Arc::new(MockPublisher::new());
        let history = Arc::new(MockHistoryStore::new());
        let driver = Arc::new(PublishDriver::new(
            queue.clone(),
            publisher.clone(),
            Arc::new(StaticDirectory::new(partitions)),
            history.clone(),
            &config,
        ));
        Self {
            queue,
            publisher,
            history,
            controller: Arc::new(RunController::new(driver)),
            _tempdir: tempdir,
        }
    }

    pub fn delegate(&self) -> LocalDelegate {
        LocalDelegate::new(self.controller.clone())
    }

    /// Mark `count` whole pages dirty in one partition.
    pub fn dirty_pages(&self, partition: ChannelId, ids: impl IntoIterator<Item = u64>) {
        for id in ids {
            self.queue
                .mark_dirty(
                    ObjectRef::page(id),
                    DirtAction::Modify,
                    partition,
                    AttributeSet::WholeObject,
                    false,
                )
                .expect("mark dirty");
        }
    }

    /// Run to completion and return the final report.
    pub async fn run_to_completion(&self) -> pressline::RunReport {
        self.controller.start(false).expect("start run");
        self.controller.join().await;
        self.controller
            .status()
            .last_report
            .expect("run produced a report")
    }
}
