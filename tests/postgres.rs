#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]

use claims::assert_some;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use stoker::{BackgroundJob, PgStorage, Runner};
use testcontainers_modules::postgres::Postgres;
use testcontainers_modules::testcontainers::ContainerAsync;
use testcontainers_modules::testcontainers::runners::AsyncRunner;
use tokio::sync::Barrier;
use tokio::time::{Instant, sleep};

/// Test utilities and common setup
mod test_utils {
    use super::*;

    /// Set up a test database with `TestContainers` and return the storage
    /// and container.
    pub(super) async fn setup_test_storage()
    -> anyhow::Result<(PgStorage, PgPool, ContainerAsync<Postgres>)> {
        let container = Postgres::default().start().await?;
        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&url).await?;
        let storage = PgStorage::new(pool.clone());
        storage.migrate().await?;

        Ok((storage, pool, container))
    }

    pub(super) async fn wait_until(
        deadline: Duration,
        condition: impl AsyncFn() -> bool,
    ) -> bool {
        let started = Instant::now();
        while started.elapsed() < deadline {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(25)).await;
        }
        condition().await
    }
}

async fn job_state(pool: &PgPool, job_id: i64) -> Option<String> {
    sqlx::query_scalar("SELECT state FROM jobs WHERE id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await
        .unwrap()
}

async fn queue_entries(pool: &PgPool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM job_queue")
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn jobs_run_to_completion_and_journal_their_states() -> anyhow::Result<()> {
    #[derive(Clone)]
    struct TestContext {
        runs: Arc<AtomicUsize>,
    }

    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl BackgroundJob for TestJob {
        const JOB_NAME: &'static str = "test";
        type Context = TestContext;

        async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
            ctx.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let (storage, pool, _container) = test_utils::setup_test_storage().await?;
    let context = TestContext {
        runs: Arc::new(AtomicUsize::new(0)),
    };

    let runner = Runner::new(storage, context.clone())
        .num_workers(2)
        .poll_interval(Duration::from_millis(100))
        .register_job_type::<TestJob>();
    let client = runner.client();
    let handle = runner.start();

    let job_id = client.enqueue(&TestJob).await?;

    assert!(
        test_utils::wait_until(Duration::from_secs(10), async || {
            job_state(&pool, job_id).await.as_deref() == Some("Succeeded")
        })
        .await
    );
    handle.shutdown().await;

    assert_eq!(context.runs.load(Ordering::SeqCst), 1);
    assert_eq!(queue_entries(&pool).await, 0);

    let states: Vec<String> =
        sqlx::query_scalar("SELECT name FROM job_states WHERE job_id = $1 ORDER BY id")
            .bind(job_id)
            .fetch_all(&pool)
            .await?;
    assert_eq!(states, ["Scheduled", "Processing", "Succeeded"]);

    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn claimed_jobs_are_locked_against_other_workers() -> anyhow::Result<()> {
    #[derive(Clone)]
    struct TestContext {
        job_started_barrier: Arc<Barrier>,
        assertions_finished_barrier: Arc<Barrier>,
    }

    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl BackgroundJob for TestJob {
        const JOB_NAME: &'static str = "test";
        type Context = TestContext;

        async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
            ctx.job_started_barrier.wait().await;
            ctx.assertions_finished_barrier.wait().await;
            Ok(())
        }
    }

    let (storage, pool, _container) = test_utils::setup_test_storage().await?;
    let context = TestContext {
        job_started_barrier: Arc::new(Barrier::new(2)),
        assertions_finished_barrier: Arc::new(Barrier::new(2)),
    };

    let runner = Runner::new(storage.clone(), context.clone())
        .num_workers(1)
        .poll_interval(Duration::from_millis(100))
        .register_job_type::<TestJob>();
    let client = runner.client();
    let handle = runner.start();

    let job_id = client.enqueue(&TestJob).await?;
    context.job_started_barrier.wait().await;

    // The queue row is locked by the claim transaction, so no other fetch
    // may see it while the job is running.
    let lockable: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM job_queue WHERE job_id = $1 FOR UPDATE SKIP LOCKED",
    )
    .bind(job_id)
    .fetch_optional(&pool)
    .await?;
    assert!(lockable.is_none());

    // The claim is not yet acknowledged, so the job row still reads as
    // scheduled for the outside world.
    assert_eq!(job_state(&pool, job_id).await.as_deref(), Some("Scheduled"));

    context.assertions_finished_barrier.wait().await;

    assert!(
        test_utils::wait_until(Duration::from_secs(10), async || {
            job_state(&pool, job_id).await.as_deref() == Some("Succeeded")
        })
        .await
    );
    handle.shutdown().await;

    assert_eq!(queue_entries(&pool).await, 0);
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn recurring_templates_emit_jobs_with_their_data() -> anyhow::Result<()> {
    #[derive(Clone)]
    struct TestContext {
        runs: Arc<AtomicUsize>,
    }

    #[derive(Serialize, Deserialize)]
    struct TickJob {
        label: String,
    }

    impl BackgroundJob for TickJob {
        const JOB_NAME: &'static str = "tick";
        type Context = TestContext;

        async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
            assert_eq!(self.label, "nightly");
            ctx.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let (storage, pool, _container) = test_utils::setup_test_storage().await?;
    let context = TestContext {
        runs: Arc::new(AtomicUsize::new(0)),
    };

    let runner = Runner::new(storage, context.clone())
        .num_workers(1)
        .poll_interval(Duration::from_millis(100))
        .register_job_type::<TickJob>();
    let client = runner.client();
    let handle = runner.start();

    client
        .add_or_update_cron(
            "tick",
            "* * * * * *",
            &TickJob {
                label: "nightly".to_owned(),
            },
        )
        .await?;

    assert!(
        test_utils::wait_until(Duration::from_secs(10), async || {
            context.runs.load(Ordering::SeqCst) >= 1
        })
        .await
    );
    handle.shutdown().await;

    let last_run: Option<chrono::DateTime<chrono::Utc>> =
        sqlx::query_scalar("SELECT last_run FROM cron_jobs WHERE name = $1")
            .bind("tick")
            .fetch_optional(&pool)
            .await?;
    assert_some!(last_run);

    Ok(())
}
