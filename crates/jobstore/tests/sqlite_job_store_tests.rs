use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use scheduler_core::config::models::DatabaseConfig;
use scheduler_core::JobStoreConfig;
use scheduler_domain::{
    CompletedExecutionInstruction, GroupMatcher, LockRepository, LockType, TriggerStatus,
};
use scheduler_infrastructure::DatabaseManager;
use scheduler_jobstore::{ChannelSignaler, JobStore, SignalEvent};
use scheduler_testing_utils::{init_test_logging, JobDetailBuilder, TriggerBuilder};
use std::sync::Arc;
use std::time::Duration;

async fn sqlite_store(instance_id: &str) -> Result<(DatabaseManager, JobStore)> {
    let manager = DatabaseManager::new(&DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        ..DatabaseConfig::default()
    })
    .await?;
    manager.migrate().await?;
    let config = JobStoreConfig {
        lock_retry_interval_ms: 5,
        ..JobStoreConfig::with_instance("sqlite-cluster", instance_id)
    };
    let store = JobStore::new(config, manager.repositories("sqlite-cluster"))?;
    Ok((manager, store))
}

#[tokio::test]
async fn test_sqlite_full_fire_cycle() -> Result<()> {
    init_test_logging();
    let (manager, store) = sqlite_store("node-1").await?;
    let (signaler, mut events) = ChannelSignaler::new();
    store.initialize(Arc::new(signaler))?;
    store.scheduler_started().await?;

    let job = JobDetailBuilder::new("sync")
        .non_concurrent()
        .persist_job_data()
        .build();
    let trigger = TriggerBuilder::new("twice", &job.key)
        .repeat_every(Duration::from_secs(1), 1)
        .build();
    store.store_job_and_trigger(&job, &trigger).await?;
    assert!(matches!(
        events.try_recv(),
        Ok(SignalEvent::SchedulingChange(Some(_)))
    ));

    let acquired = store
        .acquire_next_triggers(Utc::now() + ChronoDuration::seconds(5), 5, ChronoDuration::zero())
        .await?;
    assert_eq!(acquired.len(), 1);

    let mut bundle = store.triggers_fired(&acquired).await?.remove(0)?.unwrap();
    assert_eq!(store.trigger_state(&trigger.key).await?, TriggerStatus::Blocked);

    bundle.job.job_data.put("last_result", "ok");
    store
        .triggered_job_complete(&bundle.trigger, &bundle.job, CompletedExecutionInstruction::Noop)
        .await?;
    assert_eq!(store.trigger_state(&trigger.key).await?, TriggerStatus::Normal);

    let stored_job = store.retrieve_job(&job.key).await?.unwrap();
    assert_eq!(stored_job.job_data.get_str("last_result"), Some("ok"));

    let stored_trigger = store.retrieve_trigger(&trigger.key).await?.unwrap();
    let millis = |t: Option<chrono::DateTime<Utc>>| t.map(|t| t.timestamp_millis());
    assert_eq!(
        millis(stored_trigger.previous_fire_time),
        millis(trigger.next_fire_time)
    );
    assert_eq!(
        millis(stored_trigger.next_fire_time),
        millis(bundle.next_fire_time)
    );

    let locks = manager.repositories("sqlite-cluster").locks;
    assert!(locks.find(LockType::TriggerAccess).await?.is_none());

    store.shutdown().await?;
    manager.close().await;
    Ok(())
}

#[tokio::test]
async fn test_sqlite_pause_resume_and_queries() -> Result<()> {
    let (manager, store) = sqlite_store("node-1").await?;
    let job = JobDetailBuilder::new("report").with_group("reports").durable().build();
    store.store_job(&job, false).await?;
    for name in ["daily", "weekly"] {
        let trigger = TriggerBuilder::new(name, &job.key).with_group("reports").build();
        store.store_trigger(&trigger, false).await?;
    }

    assert_eq!(store.job_group_names().await?, vec!["reports".to_string()]);
    assert_eq!(
        store
            .trigger_keys(&GroupMatcher::StartsWith("rep".to_string()))
            .await?
            .len(),
        2
    );
    assert_eq!(store.triggers_for_job(&job.key).await?.len(), 2);

    let paused = store.pause_jobs(&GroupMatcher::group_equals("reports")).await?;
    assert_eq!(paused, vec!["reports".to_string()]);
    for trigger in store.triggers_for_job(&job.key).await? {
        assert_eq!(store.trigger_state(&trigger.key).await?, TriggerStatus::Paused);
    }

    let resumed = store.resume_jobs(&GroupMatcher::Anything).await?;
    assert_eq!(resumed, vec!["reports".to_string()]);
    for trigger in store.triggers_for_job(&job.key).await? {
        assert_eq!(store.trigger_state(&trigger.key).await?, TriggerStatus::Normal);
    }

    manager.close().await;
    Ok(())
}
