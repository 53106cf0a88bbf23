//! Test helpers and utilities for integration tests

use courier_mqtt::session::{SessionConfig, SessionManager};
use courier_mqtt::store::temporary_database;
use courier_mqtt::testing::{MockAuthenticator, MockConnection, RecordingEventHandler};
use courier_mqtt::transport::ConnectOptions;
use std::sync::Arc;
use std::time::Duration;

/// Connect options pointing at a broker that never exists
#[allow(dead_code)]
pub fn test_options() -> ConnectOptions {
    ConnectOptions::new("broker.test", 1883, "test-client").with_credentials("user", "pass")
}

/// A session wired to mocks, plus handles to inspect them
#[allow(dead_code)]
pub struct Harness {
    pub session: SessionManager,
    pub connection: Arc<MockConnection>,
    pub auth: Arc<MockAuthenticator>,
    pub events: Arc<RecordingEventHandler>,
}

#[allow(dead_code)]
impl Harness {
    pub fn new(connection: MockConnection) -> Self {
        Self::with(connection, MockAuthenticator::new(test_options()), SessionConfig::default())
    }

    pub fn with(connection: MockConnection, auth: MockAuthenticator, config: SessionConfig) -> Self {
        let connection = Arc::new(connection);
        let auth = Arc::new(auth);
        let events = Arc::new(RecordingEventHandler::new());
        let db = temporary_database().expect("temporary database");

        let session = SessionManager::builder(auth.clone())
            .config(config)
            .database(db)
            .connection(connection.clone())
            .event_handler(events.clone())
            .build()
            .expect("session builds");

        Self {
            session,
            connection,
            auth,
            events,
        }
    }

    /// Process everything queued so far, including finished auth round-trips
    pub async fn settle(&self) {
        for _ in 0..3 {
            self.session.sync().await;
            tokio::task::yield_now().await;
        }
        self.session.sync().await;
    }
}

/// Poll `condition` until it holds or the attempts run out
#[allow(dead_code)]
pub async fn eventually<F>(condition: F) -> bool
where
    F: FnMut() -> bool,
{
    eventually_within(Duration::from_secs(1), condition).await
}

/// Like [`eventually`] with a caller-chosen budget, for real network round-trips
#[allow(dead_code)]
pub async fn eventually_within<F>(budget: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let step = Duration::from_millis(5);
    let attempts = (budget.as_millis() / step.as_millis()).max(1);
    for _ in 0..attempts {
        if condition() {
            return true;
        }
        tokio::time::sleep(step).await;
    }
    condition()
}
