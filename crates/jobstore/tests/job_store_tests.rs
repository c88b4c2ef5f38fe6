use anyhow::Result;
use chrono::{Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use scheduler_core::JobStoreConfig;
use scheduler_domain::{
    Calendar, CompletedExecutionInstruction, FiredTriggerState, GroupMatcher, JobKey,
    JobRepository, LockRecord, LockRepository, LockType, MisfireInstruction, SchedulerError,
    SchedulerInstanceRepository, Schedule, TriggerKey, TriggerRepository, TriggerState,
    TriggerStatus, ALL_GROUPS_PAUSED, RECOVERING_JOBS_GROUP, REPEAT_INDEFINITELY,
};
use scheduler_jobstore::recovery::FAILED_JOB_ORIGINAL_TRIGGER_NAME;
use scheduler_jobstore::{ChannelSignaler, JobStore, LoggingSignaler, SignalEvent, TriggerFactory};
use scheduler_testing_utils::{
    init_test_logging, JobDetailBuilder, MockRepositories, TriggerBuilder,
};
use std::sync::Arc;
use std::time::Duration;

fn config(instance_id: &str) -> JobStoreConfig {
    JobStoreConfig {
        lock_retry_interval_ms: 5,
        ..JobStoreConfig::with_instance("cluster", instance_id)
    }
}

fn new_store(repos: &MockRepositories, instance_id: &str) -> JobStore {
    JobStore::new(config(instance_id), repos.store_repositories()).unwrap()
}

fn soon() -> chrono::DateTime<Utc> {
    Utc::now() + ChronoDuration::seconds(5)
}

fn drain(events: &mut tokio::sync::mpsc::UnboundedReceiver<SignalEvent>) -> Vec<SignalEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

#[tokio::test]
async fn test_acquire_fire_complete_cycle() -> Result<()> {
    init_test_logging();
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");

    let job = JobDetailBuilder::new("report").build();
    let trigger = TriggerBuilder::new("every-second", &job.key).build();
    store.store_job_and_trigger(&job, &trigger).await?;
    assert_eq!(store.number_of_jobs().await?, 1);
    assert_eq!(store.number_of_triggers().await?, 1);

    let acquired = store
        .acquire_next_triggers(soon(), 10, ChronoDuration::zero())
        .await?;
    assert_eq!(acquired.len(), 1);
    assert!(acquired[0].fire_instance_id.is_some());
    assert_eq!(
        repos.triggers.get_all_triggers()[0].state,
        TriggerState::Acquired
    );
    let records = repos.fired_triggers.get_all_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, FiredTriggerState::Acquired);
    assert_eq!(records[0].instance_id, "node-1");

    let results = store.triggers_fired(&acquired).await?;
    assert_eq!(results.len(), 1);
    let bundle = results.into_iter().next().unwrap()?.expect("触发成功");
    assert!(!bundle.job_is_recovering);
    assert_eq!(bundle.scheduled_fire_time, trigger.next_fire_time);
    assert!(bundle.next_fire_time > trigger.next_fire_time);

    let stored = repos.triggers.get_all_triggers();
    assert_eq!(stored[0].state, TriggerState::Waiting);
    assert_eq!(stored[0].next_fire_time, bundle.next_fire_time);
    assert_eq!(
        repos.fired_triggers.get_all_records()[0].state,
        FiredTriggerState::Executing
    );

    store
        .triggered_job_complete(&bundle.trigger, &bundle.job, CompletedExecutionInstruction::Noop)
        .await?;
    assert!(repos.fired_triggers.get_all_records().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_trigger_fired_twice_is_ignored() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    let job = JobDetailBuilder::new("report").build();
    store
        .store_job_and_trigger(&job, &TriggerBuilder::new("t", &job.key).build())
        .await?;

    let acquired = store
        .acquire_next_triggers(soon(), 1, ChronoDuration::zero())
        .await?;
    let first = store.triggers_fired(&acquired).await?;
    assert!(first[0].as_ref().unwrap().is_some());

    let second = store.triggers_fired(&acquired).await?;
    assert!(second[0].as_ref().unwrap().is_none());
    Ok(())
}

#[tokio::test]
async fn test_released_trigger_can_be_acquired_again() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    let job = JobDetailBuilder::new("report").build();
    store
        .store_job_and_trigger(&job, &TriggerBuilder::new("t", &job.key).build())
        .await?;

    let acquired = store
        .acquire_next_triggers(soon(), 1, ChronoDuration::zero())
        .await?;
    store.release_acquired_trigger(&acquired[0]).await?;
    assert_eq!(
        repos.triggers.get_all_triggers()[0].state,
        TriggerState::Waiting
    );
    assert!(repos.fired_triggers.get_all_records().is_empty());

    let again = store
        .acquire_next_triggers(soon(), 1, ChronoDuration::zero())
        .await?;
    assert_eq!(again.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_acquire_orders_by_time_then_priority() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    let job = JobDetailBuilder::new("report").durable().build();
    store.store_job(&job, false).await?;

    let start = Utc::now();
    for (name, priority) in [("low", 1), ("high", 9), ("mid", 5)] {
        let trigger = TriggerBuilder::new(name, &job.key)
            .starting_at(start)
            .with_priority(priority)
            .build();
        store.store_trigger(&trigger, false).await?;
    }

    let acquired = store
        .acquire_next_triggers(soon(), 10, ChronoDuration::zero())
        .await?;
    let names: Vec<&str> = acquired.iter().map(|t| t.key.name.as_str()).collect();
    assert_eq!(names, vec!["high", "mid", "low"]);
    Ok(())
}

#[tokio::test]
async fn test_non_concurrent_job_acquires_one_trigger_per_batch() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    let job = JobDetailBuilder::new("exclusive").non_concurrent().build();
    store.store_job(&job, false).await?;
    for name in ["t1", "t2"] {
        store
            .store_trigger(&TriggerBuilder::new(name, &job.key).build(), false)
            .await?;
    }

    let acquired = store
        .acquire_next_triggers(soon(), 10, ChronoDuration::zero())
        .await?;
    assert_eq!(acquired.len(), 1);

    let bundle = store.triggers_fired(&acquired).await?.remove(0)?.unwrap();
    for record in repos.triggers.get_all_triggers() {
        assert_eq!(record.state, TriggerState::Blocked, "{}", record.key);
    }

    store
        .triggered_job_complete(&bundle.trigger, &bundle.job, CompletedExecutionInstruction::Noop)
        .await?;
    for record in repos.triggers.get_all_triggers() {
        assert_eq!(record.state, TriggerState::Waiting, "{}", record.key);
    }
    Ok(())
}

#[tokio::test]
async fn test_acquired_trigger_is_not_acquired_again_before_release() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    let job = JobDetailBuilder::new("j1").non_concurrent().build();
    let trigger = TriggerBuilder::new("every-second", &job.key)
        .repeat_every(Duration::from_secs(1), scheduler_domain::REPEAT_INDEFINITELY)
        .build();
    store.store_job_and_trigger(&job, &trigger).await?;

    let first = store
        .acquire_next_triggers(soon(), 10, ChronoDuration::zero())
        .await?;
    assert_eq!(first.len(), 1);
    let second = store
        .acquire_next_triggers(soon(), 10, ChronoDuration::zero())
        .await?;
    assert!(second.is_empty());
    assert_eq!(
        repos.triggers.get_all_triggers()[0].state,
        TriggerState::Acquired
    );
    Ok(())
}

#[tokio::test]
async fn test_completing_trigger_unblocks_sibling_triggers() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    let job = JobDetailBuilder::new("exclusive").non_concurrent().build();
    store.store_job(&job, false).await?;
    for name in ["first", "second"] {
        store
            .store_trigger(&TriggerBuilder::new(name, &job.key).build(), false)
            .await?;
    }

    let acquired = store
        .acquire_next_triggers(soon(), 10, ChronoDuration::zero())
        .await?;
    let bundle = store.triggers_fired(&acquired).await?.remove(0)?.unwrap();
    let fired_key = bundle.trigger.key.clone();
    let other_key = repos
        .triggers
        .get_all_triggers()
        .into_iter()
        .map(|record| record.key)
        .find(|key| *key != fired_key)
        .unwrap();
    assert_eq!(store.trigger_state(&other_key).await?, TriggerStatus::Blocked);

    store
        .triggered_job_complete(
            &bundle.trigger,
            &bundle.job,
            CompletedExecutionInstruction::SetTriggerComplete,
        )
        .await?;
    assert_eq!(store.trigger_state(&fired_key).await?, TriggerStatus::Complete);
    assert_eq!(store.trigger_state(&other_key).await?, TriggerStatus::Normal);
    Ok(())
}

#[tokio::test]
async fn test_trigger_claimed_by_only_one_instance() -> Result<()> {
    init_test_logging();
    let repos = MockRepositories::new();
    let node_a = new_store(&repos, "node-a");
    let node_b = new_store(&repos, "node-b");

    let job = JobDetailBuilder::new("shared").build();
    node_a
        .store_job_and_trigger(&job, &TriggerBuilder::new("t", &job.key).build())
        .await?;

    let (a, b) = tokio::join!(
        node_a.acquire_next_triggers(soon(), 10, ChronoDuration::zero()),
        node_b.acquire_next_triggers(soon(), 10, ChronoDuration::zero()),
    );
    let (a, b) = (a?, b?);
    assert_eq!(a.len() + b.len(), 1);

    let records = repos.fired_triggers.get_all_records();
    assert_eq!(records.len(), 1);
    let winner = if a.is_empty() { "node-b" } else { "node-a" };
    assert_eq!(records[0].instance_id, winner);
    Ok(())
}

#[tokio::test]
async fn test_store_existing_objects_is_rejected() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    let job = JobDetailBuilder::new("report").build();
    let trigger = TriggerBuilder::new("t", &job.key).build();
    store.store_job_and_trigger(&job, &trigger).await?;

    let err = store.store_job(&job, false).await.unwrap_err();
    assert!(matches!(err, SchedulerError::ObjectAlreadyExists { .. }));
    let err = store.store_trigger(&trigger, false).await.unwrap_err();
    assert!(matches!(err, SchedulerError::ObjectAlreadyExists { .. }));

    store.store_job(&job, true).await?;
    store.store_trigger(&trigger, true).await?;
    assert_eq!(store.number_of_triggers().await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_batch_store_without_replace_is_all_or_nothing() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    let existing = JobDetailBuilder::new("existing").durable().build();
    store.store_job(&existing, false).await?;

    let fresh = JobDetailBuilder::new("fresh").build();
    let batch = vec![
        (fresh.clone(), vec![TriggerBuilder::new("t", &fresh.key).build()]),
        (existing.clone(), vec![]),
    ];
    let err = store.store_jobs_and_triggers(&batch, false).await.unwrap_err();
    assert!(matches!(err, SchedulerError::ObjectAlreadyExists { .. }));
    assert!(!store.check_job_exists(&fresh.key).await?);
    assert_eq!(store.number_of_triggers().await?, 0);

    store.store_jobs_and_triggers(&batch, true).await?;
    assert!(store.check_job_exists(&fresh.key).await?);
    assert_eq!(store.number_of_triggers().await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_trigger_without_job_is_rejected() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    let missing = JobKey::new("missing", "DEFAULT");
    let err = store
        .store_trigger(&TriggerBuilder::new("t", &missing).build(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::JobNotFound { .. }));
    Ok(())
}

#[tokio::test]
async fn test_removing_last_trigger_deletes_non_durable_job() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    let (signaler, mut events) = ChannelSignaler::new();
    store.initialize(Arc::new(signaler))?;

    let job = JobDetailBuilder::new("temp").build();
    let trigger = TriggerBuilder::new("t", &job.key).build();
    store.store_job_and_trigger(&job, &trigger).await?;

    assert!(store.remove_trigger(&trigger.key).await?);
    assert!(!store.check_job_exists(&job.key).await?);
    assert!(drain(&mut events).contains(&SignalEvent::JobDeleted(job.key.clone())));

    let durable = JobDetailBuilder::new("keep").durable().build();
    let trigger = TriggerBuilder::new("t2", &durable.key).build();
    store.store_job_and_trigger(&durable, &trigger).await?;
    assert!(store.remove_trigger(&trigger.key).await?);
    assert!(store.check_job_exists(&durable.key).await?);

    assert!(!store.remove_trigger(&trigger.key).await?);
    Ok(())
}

#[tokio::test]
async fn test_remove_job_deletes_its_triggers() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    let job = JobDetailBuilder::new("report").build();
    store.store_job(&job, false).await?;
    for name in ["t1", "t2"] {
        store
            .store_trigger(&TriggerBuilder::new(name, &job.key).build(), false)
            .await?;
    }

    assert!(store.remove_job(&job.key).await?);
    assert_eq!(store.number_of_triggers().await?, 0);
    assert!(store.retrieve_job(&job.key).await?.is_none());

    let missing = JobKey::new("missing", "DEFAULT");
    assert!(!store.remove_jobs(&[missing]).await?);
    Ok(())
}

#[tokio::test]
async fn test_replace_trigger_requires_same_job() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    let job = JobDetailBuilder::new("report").build();
    let old = TriggerBuilder::new("old", &job.key).build();
    store.store_job_and_trigger(&job, &old).await?;

    let new = TriggerBuilder::new("new", &job.key).build();
    assert!(store.replace_trigger(&old.key, &new).await?);
    assert!(!store.check_trigger_exists(&old.key).await?);
    assert!(store.check_trigger_exists(&new.key).await?);
    assert!(store.check_job_exists(&job.key).await?);

    let other = JobKey::new("other", "DEFAULT");
    let foreign = TriggerBuilder::new("foreign", &other).build();
    let err = store.replace_trigger(&new.key, &foreign).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Persistence { .. }));

    assert!(!store
        .replace_trigger(&TriggerKey::new("absent", "DEFAULT"), &new)
        .await?);
    Ok(())
}

#[tokio::test]
async fn test_pause_and_resume_trigger_group() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    let job = JobDetailBuilder::new("report").durable().build();
    store.store_job(&job, false).await?;
    let first = TriggerBuilder::new("t1", &job.key).with_group("g1").build();
    store.store_trigger(&first, false).await?;

    let paused = store
        .pause_triggers(&GroupMatcher::group_equals("g1"))
        .await?;
    assert_eq!(paused, vec!["g1".to_string()]);
    assert_eq!(store.trigger_state(&first.key).await?, TriggerStatus::Paused);

    // 已暂停分组中新加入的触发器直接暂停
    let second = TriggerBuilder::new("t2", &job.key).with_group("g1").build();
    store.store_trigger(&second, false).await?;
    assert_eq!(store.trigger_state(&second.key).await?, TriggerStatus::Paused);

    let paused = store
        .pause_triggers(&GroupMatcher::group_equals("empty"))
        .await?;
    assert_eq!(paused, vec!["empty".to_string()]);
    let groups = store.paused_trigger_groups().await?;
    assert!(groups.contains("g1") && groups.contains("empty"));

    let resumed = store
        .resume_triggers(&GroupMatcher::group_equals("g1"))
        .await?;
    assert_eq!(resumed, vec!["g1".to_string()]);
    assert_eq!(store.trigger_state(&first.key).await?, TriggerStatus::Normal);
    assert_eq!(store.trigger_state(&second.key).await?, TriggerStatus::Normal);
    assert!(!store.paused_trigger_groups().await?.contains("g1"));
    Ok(())
}

#[tokio::test]
async fn test_pause_job_pauses_all_its_triggers() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    let job = JobDetailBuilder::new("report").build();
    store.store_job(&job, false).await?;
    for name in ["t1", "t2"] {
        store
            .store_trigger(&TriggerBuilder::new(name, &job.key).build(), false)
            .await?;
    }

    store.pause_job(&job.key).await?;
    for record in repos.triggers.get_all_triggers() {
        assert_eq!(record.state, TriggerState::Paused);
    }
    let acquired = store
        .acquire_next_triggers(soon(), 10, ChronoDuration::zero())
        .await?;
    assert!(acquired.is_empty());

    store.resume_job(&job.key).await?;
    for record in repos.triggers.get_all_triggers() {
        assert_eq!(record.state, TriggerState::Waiting);
    }
    Ok(())
}

#[tokio::test]
async fn test_pause_all_covers_groups_created_later() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    let job = JobDetailBuilder::new("report").durable().build();
    store.store_job(&job, false).await?;
    store
        .store_trigger(&TriggerBuilder::new("t1", &job.key).with_group("a").build(), false)
        .await?;

    store.pause_all().await?;
    assert!(store.paused_trigger_groups().await?.contains(ALL_GROUPS_PAUSED));

    let late = TriggerBuilder::new("t2", &job.key).with_group("late").build();
    store.store_trigger(&late, false).await?;
    assert_eq!(store.trigger_state(&late.key).await?, TriggerStatus::Paused);
    assert!(store.paused_trigger_groups().await?.contains("late"));

    store.resume_all().await?;
    assert!(store.paused_trigger_groups().await?.is_empty());
    for record in repos.triggers.get_all_triggers() {
        assert_eq!(record.state, TriggerState::Waiting);
    }
    Ok(())
}

#[tokio::test]
async fn test_calendar_rules() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    let holiday = NaiveDate::from_ymd_opt(2099, 1, 1).unwrap();
    let calendar = Calendar::holiday([holiday]);
    store.store_calendar("holidays", &calendar, false, false).await?;

    let err = store
        .store_calendar("holidays", &calendar, false, false)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::ObjectAlreadyExists { .. }));

    let job = JobDetailBuilder::new("report").durable().build();
    store.store_job(&job, false).await?;

    let orphan = TriggerBuilder::new("orphan", &job.key)
        .modified_by_calendar("missing")
        .build();
    let err = store.store_trigger(&orphan, false).await.unwrap_err();
    assert!(matches!(err, SchedulerError::CalendarNotFound { .. }));

    // 唯一一次触发落在排除日期上，永远不会触发
    let never = TriggerBuilder::new("never", &job.key)
        .once()
        .starting_at(Utc.from_utc_datetime(&holiday.and_hms_opt(12, 0, 0).unwrap()))
        .modified_by_calendar("holidays")
        .build()
        .with_next_fire_time(None);
    let err = store.store_trigger(&never, false).await.unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidSchedule(_)));

    let trigger = TriggerBuilder::new("t", &job.key)
        .modified_by_calendar("holidays")
        .build();
    store.store_trigger(&trigger, false).await?;
    let err = store.remove_calendar("holidays").await.unwrap_err();
    assert!(matches!(err, SchedulerError::Persistence { .. }));

    store.remove_trigger(&trigger.key).await?;
    assert!(store.remove_calendar("holidays").await?);
    assert_eq!(store.number_of_calendars().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_replacing_calendar_updates_triggers() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    store
        .store_calendar("blackout", &Calendar::holiday(Vec::<NaiveDate>::new()), false, false)
        .await?;

    let job = JobDetailBuilder::new("hourly").build();
    let trigger = TriggerBuilder::new("t", &job.key)
        .repeat_every(Duration::from_secs(3600), -1)
        .modified_by_calendar("blackout")
        .build();
    store.store_job_and_trigger(&job, &trigger).await?;

    let today = Utc::now().date_naive();
    store
        .store_calendar("blackout", &Calendar::holiday([today]), true, true)
        .await?;

    let stored = store.retrieve_trigger(&trigger.key).await?.unwrap();
    let next = stored.next_fire_time.unwrap();
    assert!(next.date_naive() > today);
    assert_eq!(store.trigger_state(&trigger.key).await?, TriggerStatus::Normal);
    Ok(())
}

#[tokio::test]
async fn test_delete_trigger_instruction_removes_finished_trigger() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    let (signaler, mut events) = ChannelSignaler::new();
    store.initialize(Arc::new(signaler))?;

    let job = JobDetailBuilder::new("once").build();
    store
        .store_job_and_trigger(&job, &TriggerBuilder::new("t", &job.key).once().build())
        .await?;

    let acquired = store
        .acquire_next_triggers(soon(), 1, ChronoDuration::zero())
        .await?;
    let bundle = store.triggers_fired(&acquired).await?.remove(0)?.unwrap();
    assert!(bundle.next_fire_time.is_none());
    assert_eq!(
        repos.triggers.get_all_triggers()[0].state,
        TriggerState::Complete
    );
    drain(&mut events);

    store
        .triggered_job_complete(
            &bundle.trigger,
            &bundle.job,
            CompletedExecutionInstruction::DeleteTrigger,
        )
        .await?;
    assert_eq!(store.number_of_triggers().await?, 0);
    assert_eq!(store.number_of_jobs().await?, 0);
    assert!(drain(&mut events).contains(&SignalEvent::JobDeleted(job.key.clone())));
    Ok(())
}

#[tokio::test]
async fn test_set_trigger_complete_and_error_instructions() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    let (signaler, mut events) = ChannelSignaler::new();
    store.initialize(Arc::new(signaler))?;

    let job = JobDetailBuilder::new("report").durable().build();
    store.store_job(&job, false).await?;
    let done = TriggerBuilder::new("done", &job.key).build();
    let broken = TriggerBuilder::new("broken", &job.key).build();
    store.store_trigger(&done, false).await?;
    store.store_trigger(&broken, false).await?;

    store
        .triggered_job_complete(&done, &job, CompletedExecutionInstruction::SetTriggerComplete)
        .await?;
    assert_eq!(store.trigger_state(&done.key).await?, TriggerStatus::Complete);
    let drained = drain(&mut events);
    assert!(drained
        .iter()
        .any(|e| matches!(e, SignalEvent::TriggerFinalized(t) if t.key == done.key)));
    assert!(drained.contains(&SignalEvent::SchedulingChange(None)));

    store
        .triggered_job_complete(&broken, &job, CompletedExecutionInstruction::SetTriggerError)
        .await?;
    assert_eq!(store.trigger_state(&broken.key).await?, TriggerStatus::Error);

    store.reset_trigger_from_error_state(&broken.key).await?;
    assert_eq!(store.trigger_state(&broken.key).await?, TriggerStatus::Normal);

    store
        .triggered_job_complete(
            &broken,
            &job,
            CompletedExecutionInstruction::SetAllJobTriggersError,
        )
        .await?;
    assert_eq!(store.trigger_state(&done.key).await?, TriggerStatus::Error);
    assert_eq!(store.trigger_state(&broken.key).await?, TriggerStatus::Error);
    Ok(())
}

#[tokio::test]
async fn test_job_data_persisted_after_execution() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    let job = JobDetailBuilder::new("counter")
        .persist_job_data()
        .with_data("runs", 0)
        .build();
    store
        .store_job_and_trigger(&job, &TriggerBuilder::new("t", &job.key).build())
        .await?;

    let acquired = store
        .acquire_next_triggers(soon(), 1, ChronoDuration::zero())
        .await?;
    let bundle = store.triggers_fired(&acquired).await?.remove(0)?.unwrap();
    assert!(!bundle.job.job_data.is_dirty());

    let mut executed = bundle.job.clone();
    executed.job_data.put("runs", 1);
    store
        .triggered_job_complete(&bundle.trigger, &executed, CompletedExecutionInstruction::Noop)
        .await?;

    let stored = store.retrieve_job(&job.key).await?.unwrap();
    assert_eq!(stored.job_data.get("runs"), Some(&serde_json::json!(1)));
    Ok(())
}

#[tokio::test]
async fn test_recovery_after_crash_creates_recovery_trigger() -> Result<()> {
    init_test_logging();
    let repos = MockRepositories::new();
    let job = JobDetailBuilder::new("etl").requests_recovery().build();
    let trigger = TriggerBuilder::new("nightly", &job.key)
        .repeat_every(Duration::from_secs(3600), -1)
        .build();

    {
        let crashed = new_store(&repos, "node-1");
        crashed.store_job_and_trigger(&job, &trigger).await?;
        let acquired = crashed
            .acquire_next_triggers(soon(), 1, ChronoDuration::zero())
            .await?;
        crashed.triggers_fired(&acquired).await?.remove(0)?.unwrap();
        let records = repos.fired_triggers.get_all_records();
        assert!(records[0].requests_recovery);
    }

    let restarted = new_store(&repos, "node-1");
    let report = restarted.scheduler_started().await?;
    assert_eq!(report.recovery_triggers, 1);
    assert_eq!(report.fired_records_deleted, 1);
    assert!(repos.fired_triggers.get_all_records().is_empty());

    let recovery_keys = restarted
        .trigger_keys(&GroupMatcher::group_equals(RECOVERING_JOBS_GROUP))
        .await?;
    assert_eq!(recovery_keys.len(), 1);
    let recovery = restarted
        .retrieve_trigger(&recovery_keys[0])
        .await?
        .unwrap();
    assert_eq!(
        recovery.job_data.get_str(FAILED_JOB_ORIGINAL_TRIGGER_NAME),
        Some("nightly")
    );

    let acquired = restarted
        .acquire_next_triggers(soon(), 10, ChronoDuration::zero())
        .await?;
    assert_eq!(acquired.len(), 1);
    assert_eq!(acquired[0].key, recovery_keys[0]);
    let bundle = restarted
        .triggers_fired(&acquired)
        .await?
        .remove(0)?
        .unwrap();
    assert!(bundle.job_is_recovering);

    restarted.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_startup_resets_leftover_trigger_states() -> Result<()> {
    let repos = MockRepositories::new();
    let job = JobDetailBuilder::new("report").build();
    {
        let crashed = new_store(&repos, "node-1");
        crashed
            .store_job_and_trigger(&job, &TriggerBuilder::new("t", &job.key).build())
            .await?;
        crashed
            .acquire_next_triggers(soon(), 1, ChronoDuration::zero())
            .await?;
    }
    assert_eq!(
        repos.triggers.get_all_triggers()[0].state,
        TriggerState::Acquired
    );

    let restarted = new_store(&repos, "node-1");
    let report = restarted.scheduler_started().await?;
    assert_eq!(report.reset_triggers, 1);
    assert_eq!(report.recovery_triggers, 0);
    assert_eq!(
        repos.triggers.get_all_triggers()[0].state,
        TriggerState::Waiting
    );
    restarted.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_lifecycle_registers_and_removes_instance() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    let (signaler, _events) = ChannelSignaler::new();
    store.initialize(Arc::new(signaler))?;
    let err = store.initialize(Arc::new(LoggingSignaler)).unwrap_err();
    assert!(matches!(err, SchedulerError::Configuration(_)));

    assert!(store.supports_persistence());
    assert!(store.is_clustered());
    assert_eq!(store.instance_id(), "node-1");
    assert_eq!(store.instance_name(), "cluster");

    store.scheduler_started().await?;
    let instances = repos.instances.find_all().await?;
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].instance_id, "node-1");

    store.scheduler_paused().await?;
    store.scheduler_resumed().await?;

    store.shutdown().await?;
    assert!(repos.instances.find_all().await?.is_empty());
    store.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_group_pause_queries_are_not_supported() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    assert!(matches!(
        store.is_job_group_paused("g").await,
        Err(SchedulerError::NotSupported(_))
    ));
    assert!(matches!(
        store.is_trigger_group_paused("g").await,
        Err(SchedulerError::NotSupported(_))
    ));
    assert_eq!(
        store
            .trigger_state(&TriggerKey::new("absent", "DEFAULT"))
            .await?,
        TriggerStatus::None
    );
    Ok(())
}

#[tokio::test]
async fn test_clear_all_scheduling_data() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    let job = JobDetailBuilder::new("report").build();
    store
        .store_job_and_trigger(&job, &TriggerBuilder::new("t", &job.key).build())
        .await?;
    store
        .store_calendar("c", &Calendar::holiday(Vec::<NaiveDate>::new()), false, false)
        .await?;
    store.pause_all().await?;
    store
        .acquire_next_triggers(soon(), 1, ChronoDuration::zero())
        .await?;

    store.clear_all_scheduling_data().await?;
    assert_eq!(store.number_of_jobs().await?, 0);
    assert_eq!(store.number_of_triggers().await?, 0);
    assert_eq!(store.number_of_calendars().await?, 0);
    assert!(store.paused_trigger_groups().await?.is_empty());
    assert!(repos.fired_triggers.get_all_records().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_failing_repository_releases_lock() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    let job = JobDetailBuilder::new("report").durable().build();
    store.store_job(&job, false).await?;

    repos.triggers.set_failing(true);
    let err = store
        .store_trigger(&TriggerBuilder::new("t", &job.key).build(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Persistence { .. }));
    assert!(repos
        .locks
        .holder(scheduler_domain::LockType::TriggerAccess)
        .is_none());

    repos.triggers.set_failing(false);
    store
        .store_trigger(&TriggerBuilder::new("t", &job.key).build(), false)
        .await?;
    let schedule = store.retrieve_trigger(&TriggerKey::new("t", "DEFAULT")).await?;
    assert!(matches!(
        schedule.map(|t| t.schedule),
        Some(Schedule::Simple(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_one_shot_trigger_of_non_concurrent_job_completes_after_execution() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    let (signaler, mut events) = ChannelSignaler::new();
    store.initialize(Arc::new(signaler))?;

    let job = JobDetailBuilder::new("exclusive").non_concurrent().durable().build();
    let trigger = TriggerBuilder::new("once", &job.key).once().build();
    store.store_job_and_trigger(&job, &trigger).await?;

    let acquired = store
        .acquire_next_triggers(soon(), 1, ChronoDuration::zero())
        .await?;
    let bundle = store.triggers_fired(&acquired).await?.remove(0)?.unwrap();
    assert!(bundle.next_fire_time.is_none());
    assert_eq!(store.trigger_state(&trigger.key).await?, TriggerStatus::Blocked);
    drain(&mut events);

    store
        .triggered_job_complete(&bundle.trigger, &bundle.job, CompletedExecutionInstruction::Noop)
        .await?;
    assert_eq!(store.trigger_state(&trigger.key).await?, TriggerStatus::Complete);
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, SignalEvent::TriggerFinalized(t) if t.key == trigger.key)));
    Ok(())
}

#[tokio::test]
async fn test_resuming_overdue_trigger_repairs_misfire() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    let (signaler, mut events) = ChannelSignaler::new();
    store.initialize(Arc::new(signaler))?;
    store.scheduler_started().await?;

    store
        .pause_triggers(&GroupMatcher::group_equals("g"))
        .await?;
    let job = JobDetailBuilder::new("report").build();
    let trigger = TriggerBuilder::new("hourly", &job.key)
        .with_group("g")
        .repeat_every(Duration::from_secs(3600), REPEAT_INDEFINITELY)
        .starting_at(Utc::now() - ChronoDuration::minutes(150))
        .build();
    store.store_job_and_trigger(&job, &trigger).await?;
    assert_eq!(store.trigger_state(&trigger.key).await?, TriggerStatus::Paused);
    drain(&mut events);

    let before = Utc::now();
    store.resume_trigger(&trigger.key).await?;
    assert_eq!(store.trigger_state(&trigger.key).await?, TriggerStatus::Normal);
    let resumed = store.retrieve_trigger(&trigger.key).await?.unwrap();
    assert!(resumed.next_fire_time.is_some_and(|next| next >= before));
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, SignalEvent::TriggerMisfired(t) if t.key == trigger.key)));

    store.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_misfire_without_future_fire_time_completes_trigger() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    let (signaler, mut events) = ChannelSignaler::new();
    store.initialize(Arc::new(signaler))?;
    store.scheduler_started().await?;

    store
        .pause_triggers(&GroupMatcher::group_equals("g"))
        .await?;
    let job = JobDetailBuilder::new("report").durable().build();
    let trigger = TriggerBuilder::new("once", &job.key)
        .with_group("g")
        .once()
        .with_misfire_instruction(MisfireInstruction::DoNothing)
        .starting_at(Utc::now() - ChronoDuration::hours(2))
        .build();
    store.store_job_and_trigger(&job, &trigger).await?;
    drain(&mut events);

    store.resume_trigger(&trigger.key).await?;
    assert_eq!(store.trigger_state(&trigger.key).await?, TriggerStatus::Complete);
    let drained = drain(&mut events);
    assert!(drained
        .iter()
        .any(|e| matches!(e, SignalEvent::TriggerMisfired(t) if t.key == trigger.key)));
    assert!(drained
        .iter()
        .any(|e| matches!(e, SignalEvent::TriggerFinalized(t) if t.key == trigger.key)));

    store.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_startup_deletes_completed_triggers() -> Result<()> {
    let repos = MockRepositories::new();
    let job = JobDetailBuilder::new("report").build();
    let trigger = TriggerBuilder::new("t", &job.key).build();
    {
        let previous = new_store(&repos, "node-1");
        previous.store_job_and_trigger(&job, &trigger).await?;
        previous
            .triggered_job_complete(&trigger, &job, CompletedExecutionInstruction::SetTriggerComplete)
            .await?;
        assert_eq!(previous.trigger_state(&trigger.key).await?, TriggerStatus::Complete);
    }

    let restarted = new_store(&repos, "node-1");
    let report = restarted.scheduler_started().await?;
    assert_eq!(report.completed_triggers_removed, 1);
    assert!(!restarted.check_trigger_exists(&trigger.key).await?);
    assert!(!restarted.check_job_exists(&job.key).await?);
    restarted.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_batch_remove_continues_after_failure() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    let job = JobDetailBuilder::new("report").durable().build();
    store.store_job(&job, false).await?;
    let bad = TriggerBuilder::new("bad", &job.key).build();
    let good = TriggerBuilder::new("good", &job.key).build();
    store.store_trigger(&bad, false).await?;
    store.store_trigger(&good, false).await?;

    repos.triggers.fail_delete_of(&bad.key);
    let err = store
        .remove_triggers(&[bad.key.clone(), good.key.clone()])
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Persistence { .. }));
    assert!(store.check_trigger_exists(&bad.key).await?);
    assert!(!store.check_trigger_exists(&good.key).await?);

    let stuck = JobDetailBuilder::new("stuck").durable().build();
    let stuck_trigger = TriggerBuilder::new("stuck-t", &stuck.key).build();
    store.store_job_and_trigger(&stuck, &stuck_trigger).await?;
    repos.triggers.fail_delete_of(&stuck_trigger.key);
    let free = JobDetailBuilder::new("free").durable().build();
    store.store_job(&free, false).await?;

    let err = store
        .remove_jobs(&[stuck.key.clone(), free.key.clone()])
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Persistence { .. }));
    assert!(!store.check_job_exists(&free.key).await?);
    assert!(repos.locks.holder(LockType::TriggerAccess).is_none());
    Ok(())
}

#[tokio::test]
async fn test_lock_release_failure_keeps_successful_result() -> Result<()> {
    let repos = MockRepositories::new();
    let store = new_store(&repos, "node-1");
    let (signaler, mut events) = ChannelSignaler::new();
    store.initialize(Arc::new(signaler))?;

    let job = JobDetailBuilder::new("report").build();
    let trigger = TriggerBuilder::new("t", &job.key).build();
    repos.locks.set_delete_failing(true);
    store.store_job_and_trigger(&job, &trigger).await?;
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, SignalEvent::SchedulingChange(Some(_)))));
    assert_eq!(
        repos.locks.holder(LockType::TriggerAccess).as_deref(),
        Some("node-1")
    );

    // 本实例遗留的锁记录在下次加锁时被清理
    repos.locks.set_delete_failing(false);
    store.pause_trigger(&trigger.key).await?;
    assert_eq!(store.trigger_state(&trigger.key).await?, TriggerStatus::Paused);
    assert!(repos.locks.holder(LockType::TriggerAccess).is_none());
    Ok(())
}

#[tokio::test]
async fn test_shutdown_while_misfire_pass_waits_for_foreign_lock() -> Result<()> {
    let repos = MockRepositories::new();
    let store = JobStore::new(
        JobStoreConfig {
            misfire_threshold_ms: 100,
            ..config("node-1")
        },
        repos.store_repositories(),
    )?;
    store.scheduler_started().await?;

    let job = JobDetailBuilder::new("report").build();
    let trigger = TriggerBuilder::new("late", &job.key)
        .starting_at(Utc::now() - ChronoDuration::hours(2))
        .build();
    repos.jobs.insert(&job).await?;
    repos
        .triggers
        .insert(&TriggerFactory::to_record(&trigger, TriggerState::Waiting, "cluster"))
        .await?;
    repos
        .locks
        .try_insert(&LockRecord {
            instance_name: "cluster".to_string(),
            lock_type: LockType::TriggerAccess,
            owner_instance_id: "node-2".to_string(),
            acquired_at: Utc::now(),
        })
        .await?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    tokio::time::timeout(Duration::from_secs(3), store.shutdown()).await??;
    assert!(repos.instances.find_all().await?.is_empty());
    assert_eq!(
        repos.locks.holder(LockType::TriggerAccess).as_deref(),
        Some("node-2")
    );
    Ok(())
}
