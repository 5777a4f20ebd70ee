//! Database driver behaviour against an in-memory SQLite pool

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use vilnius_persist::{register_database_driver, DatabaseDriver, SqliteConfig, SqliteFailedJobStore};
use vilnius_queue::worker::StopReason;
use vilnius_queue::{
    to_payload, ConfigurationError, ConnectionConfig, Job, JobError, JobRegistry, Payload,
    QueueConfig, QueueDriver, QueueError, QueueManager, QueuedJob, Worker, WorkerConfig,
};

#[derive(Debug, Serialize, Deserialize)]
struct Greet {
    name: String,
    #[serde(default)]
    fail: bool,
    #[serde(default = "one")]
    tries: u32,
}

fn one() -> u32 {
    1
}

#[async_trait]
impl Job for Greet {
    fn job_type(&self) -> &str {
        "greet"
    }

    async fn handle(&mut self) -> Result<(), JobError> {
        if self.fail {
            Err(JobError::failed(format!("cannot greet {}", self.name)))
        } else {
            Ok(())
        }
    }

    fn payload(&self) -> Result<Payload, serde_json::Error> {
        to_payload(self)
    }

    fn max_attempts(&self) -> u32 {
        self.tries
    }
}

fn greet(name: &str) -> QueuedJob {
    greet_with_tries(name, 1)
}

fn greet_with_tries(name: &str, tries: u32) -> QueuedJob {
    QueuedJob::new(Greet {
        name: name.to_string(),
        fail: false,
        tries,
    })
}

fn registry() -> Arc<JobRegistry> {
    let mut registry = JobRegistry::new();
    registry.register::<Greet>("greet");
    Arc::new(registry)
}

async fn setup() -> (SqlitePool, DatabaseDriver) {
    let pool = SqliteConfig::memory().connect().await.unwrap();
    let driver = DatabaseDriver::new(pool.clone(), registry());
    driver.migrate().await.unwrap();
    (pool, driver)
}

#[tokio::test]
async fn test_jobs_come_out_in_push_order() {
    let (_pool, driver) = setup().await;
    let mut ids = Vec::new();
    for name in ["ana", "ben", "cleo"] {
        ids.push(driver.push(&mut greet(name)).await.unwrap());
    }

    for expected in &ids {
        let job = driver.pop("default").await.unwrap().unwrap();
        assert_eq!(job.id(), Some(expected));
        assert_eq!(job.job_type(), "greet");
        driver.acknowledge(&job).await.unwrap();
    }
    assert!(driver.pop("default").await.unwrap().is_none());
}

#[tokio::test]
async fn test_queues_are_isolated() {
    let (_pool, driver) = setup().await;
    driver
        .push(&mut greet("ana").on_queue("emails"))
        .await
        .unwrap();

    assert!(driver.pop("default").await.unwrap().is_none());
    let job = driver.pop("emails").await.unwrap().unwrap();
    assert_eq!(job.queue(), "emails");
}

#[tokio::test]
async fn test_delayed_job_becomes_visible_later() {
    let (_pool, driver) = setup().await;
    driver
        .later(&mut greet("ana"), Duration::from_secs(1))
        .await
        .unwrap();

    assert!(driver.pop("default").await.unwrap().is_none());
    assert_eq!(driver.size("default").await.unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(driver.pop("default").await.unwrap().is_some());
}

#[tokio::test]
async fn test_size_counts_reserved_jobs_until_acknowledged() {
    let (_pool, driver) = setup().await;
    driver.push(&mut greet("ana")).await.unwrap();
    driver.push(&mut greet("ben")).await.unwrap();

    let job = driver.pop("default").await.unwrap().unwrap();
    assert_eq!(driver.size("default").await.unwrap(), 2);

    driver.acknowledge(&job).await.unwrap();
    assert_eq!(driver.size("default").await.unwrap(), 1);

    // Acknowledging twice is harmless
    driver.acknowledge(&job).await.unwrap();
    assert_eq!(driver.size("default").await.unwrap(), 1);
}

#[tokio::test]
async fn test_reserved_job_is_not_handed_out_twice() {
    let (_pool, driver) = setup().await;
    driver.push(&mut greet("ana")).await.unwrap();

    assert!(driver.pop("default").await.unwrap().is_some());
    assert!(driver.pop("default").await.unwrap().is_none());
}

#[tokio::test]
async fn test_stale_reservation_is_reclaimed_as_a_failed_attempt() {
    let (_pool, driver) = setup().await;
    let driver = driver.with_retry_after(Duration::ZERO);
    let id = driver.push(&mut greet_with_tries("ana", 3)).await.unwrap();

    let first = driver.pop("default").await.unwrap().unwrap();
    let again = driver.pop("default").await.unwrap().unwrap();
    assert_eq!(first.id(), Some(&id));
    assert_eq!(first.attempts(), 0);
    assert_eq!(again.id(), Some(&id));
    assert_eq!(again.attempts(), 1);
}

#[tokio::test]
async fn test_job_reclaimed_past_max_attempts_is_removed() {
    let (_pool, driver) = setup().await;
    let driver = driver.with_retry_after(Duration::ZERO);
    let id = driver.push(&mut greet_with_tries("ana", 2)).await.unwrap();

    // every pop below simulates a worker that died holding the job
    let mut deliveries = 0;
    let abandoned = loop {
        match driver.pop("default").await {
            Ok(Some(_)) => deliveries += 1,
            Ok(None) => panic!("job vanished without being abandoned"),
            Err(err) => break err,
        }
        assert!(deliveries <= 2, "job delivered more than max_attempts times");
    };

    assert_eq!(deliveries, 2);
    match abandoned {
        QueueError::AttemptsExhausted {
            id: abandoned_id,
            job_type,
            queue,
            attempts,
        } => {
            assert_eq!(abandoned_id, id);
            assert_eq!(job_type, "greet");
            assert_eq!(queue, "default");
            assert_eq!(attempts, 2);
        }
        other => panic!("expected an abandoned job, got {other:?}"),
    }
    assert_eq!(driver.size("default").await.unwrap(), 0);
    assert!(driver.pop("default").await.unwrap().is_none());
}

#[tokio::test]
async fn test_released_job_stays_hidden_until_its_delay() {
    let (_pool, driver) = setup().await;
    driver.push(&mut greet_with_tries("ana", 3)).await.unwrap();

    let mut job = driver.pop("default").await.unwrap().unwrap();
    job.record_failed_attempt();
    driver.release(&job, Duration::from_secs(1)).await.unwrap();

    assert!(driver.pop("default").await.unwrap().is_none());
    assert_eq!(driver.size("default").await.unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let job = driver.pop("default").await.unwrap().unwrap();
    assert_eq!(job.attempts(), 1);
}

#[tokio::test]
async fn test_release_persists_attempts() {
    let (_pool, driver) = setup().await;
    driver.push(&mut greet_with_tries("ana", 3)).await.unwrap();

    let mut job = driver.pop("default").await.unwrap().unwrap();
    assert_eq!(job.attempts(), 0);
    assert!(!job.max_attempts_exceeded());
    job.record_failed_attempt();
    driver.release(&job, Duration::ZERO).await.unwrap();

    let job = driver.pop("default").await.unwrap().unwrap();
    assert_eq!(job.attempts(), 1);
    assert_eq!(driver.size("default").await.unwrap(), 1);
}

#[tokio::test]
async fn test_undecodable_row_is_removed() {
    let (pool, driver) = setup().await;
    sqlx::query(
        "INSERT INTO jobs (id, queue, payload, attempts, available_at, created_at) \
         VALUES ('broken', 'default', 'not json', 0, 0, 0)",
    )
    .execute(&pool)
    .await
    .unwrap();

    match driver.pop("default").await {
        Err(QueueError::Undecodable { id, .. }) => assert_eq!(id.as_str(), "broken"),
        other => panic!("expected undecodable job, got {other:?}"),
    }
    assert_eq!(driver.size("default").await.unwrap(), 0);
}

#[tokio::test]
async fn test_clear_only_touches_one_queue() {
    let (_pool, driver) = setup().await;
    driver.push(&mut greet("ana")).await.unwrap();
    driver.push(&mut greet("ben")).await.unwrap();
    driver
        .push(&mut greet("cleo").on_queue("emails"))
        .await
        .unwrap();

    driver.clear("default").await.unwrap();
    assert_eq!(driver.size("default").await.unwrap(), 0);
    assert_eq!(driver.size("emails").await.unwrap(), 1);
}

#[tokio::test]
async fn test_custom_table_name() {
    let pool = SqliteConfig::memory().connect().await.unwrap();
    let driver = DatabaseDriver::new(pool, registry())
        .with_table("queue_jobs")
        .unwrap();
    driver.migrate().await.unwrap();

    driver.push(&mut greet("ana")).await.unwrap();
    assert_eq!(driver.table(), "queue_jobs");
    assert_eq!(driver.size("default").await.unwrap(), 1);
}

fn database_config(connection: ConnectionConfig) -> QueueConfig {
    QueueConfig {
        default: "db".to_string(),
        connections: HashMap::from([("db".to_string(), connection)]),
    }
}

#[tokio::test]
async fn test_manager_builds_database_driver_from_config() {
    let connection = ConnectionConfig {
        url: Some("sqlite::memory:".to_string()),
        queue: Some("reports".to_string()),
        ..ConnectionConfig::new("database")
    };
    let mut manager = QueueManager::new(Some(database_config(connection)), registry());
    register_database_driver(&mut manager);

    let driver = manager.driver().await.unwrap();
    assert_eq!(driver.name(), "database");
    assert_eq!(manager.default_queue(None), "reports");

    manager
        .push(&mut greet("ana").on_queue("reports"))
        .await
        .unwrap();
    assert_eq!(manager.size("reports").await.unwrap(), 1);
}

#[tokio::test]
async fn test_database_connection_without_url_is_rejected() {
    let mut manager = QueueManager::new(
        Some(database_config(ConnectionConfig::new("database"))),
        registry(),
    );
    register_database_driver(&mut manager);

    match manager.driver().await {
        Err(QueueError::Configuration(ConfigurationError::MissingParameter {
            connection,
            parameter,
        })) => {
            assert_eq!(connection, "db");
            assert_eq!(parameter, "url");
        }
        other => panic!("expected missing url, got {:?}", other.map(|d| d.name())),
    }
}

#[tokio::test]
async fn test_worker_drains_database_queue() {
    let (_pool, driver) = setup().await;
    let driver = Arc::new(driver);
    for name in ["ana", "ben", "cleo", "dan", "eve"] {
        driver.push(&mut greet(name)).await.unwrap();
    }

    let config = WorkerConfig {
        max_jobs: 2,
        ..WorkerConfig::default()
    };
    let mut worker = Worker::new(driver.clone(), "default", config).with_memory_probe(|| None);
    let report = worker.run().await.unwrap();

    assert_eq!(report.processed, 2);
    assert_eq!(report.reason, StopReason::MaxJobs);
    assert_eq!(driver.size("default").await.unwrap(), 3);
}

#[tokio::test]
async fn test_exhausted_job_lands_in_failed_store() {
    let (pool, driver) = setup().await;
    let driver = Arc::new(driver);
    let failed = SqliteFailedJobStore::new(pool);
    failed.migrate().await.unwrap();

    driver
        .push(&mut QueuedJob::new(Greet {
            name: "ana".to_string(),
            fail: true,
            tries: 1,
        }))
        .await
        .unwrap();

    let config = WorkerConfig {
        max_jobs: 1,
        ..WorkerConfig::default()
    };
    let mut worker = Worker::new(driver.clone(), "default", config)
        .with_failure_log(Arc::new(failed.clone()))
        .with_memory_probe(|| None);
    worker.run().await.unwrap();

    assert_eq!(driver.size("default").await.unwrap(), 0);
    let records = failed.list(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].job, "greet");
    assert_eq!(records[0].attempts, 1);
    assert_eq!(records[0].error, "cannot greet ana");
}

#[tokio::test]
async fn test_worker_timeout_must_end_before_reservation_lapses() {
    let (_pool, driver) = setup().await;
    let driver = Arc::new(driver);
    assert_eq!(driver.retry_after(), Duration::from_secs(90));
    assert_eq!(driver.reservation_timeout(), Some(Duration::from_secs(90)));
    driver.push(&mut greet("ana")).await.unwrap();

    for timeout in [Duration::from_secs(120), Duration::from_secs(90), Duration::ZERO] {
        let config = WorkerConfig {
            max_jobs: 1,
            timeout,
            ..WorkerConfig::default()
        };
        let mut worker = Worker::new(driver.clone(), "default", config).with_memory_probe(|| None);

        match worker.run().await {
            Err(QueueError::Configuration(ConfigurationError::TimeoutNotBelowReservation {
                driver: name,
                retry_after,
                ..
            })) => {
                assert_eq!(name, "database");
                assert_eq!(retry_after, Duration::from_secs(90));
            }
            other => panic!("expected timeout to be rejected, got {other:?}"),
        }
    }

    // nothing was claimed
    assert!(driver.pop("default").await.unwrap().is_some());
}
