use anyhow::Result;
use chrono::{Duration, TimeZone, Utc};
use scheduler_core::config::models::DatabaseConfig;
use scheduler_domain::{
    Calendar, CronTriggerRecord, FiredTriggerRecord, FiredTriggerState, GroupMatcher,
    JobDataMap, JobDetail, JobKey, LockRecord, LockType, MisfireInstruction, ScheduleRecord,
    SchedulerError, SchedulerInstanceRecord, SchedulerInstanceState, SimpleTriggerRecord,
    StoreRepositories, TriggerKey, TriggerRecord, TriggerState,
};
use scheduler_infrastructure::DatabaseManager;

async fn setup(instance_name: &str) -> Result<(DatabaseManager, StoreRepositories)> {
    let config = DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        ..DatabaseConfig::default()
    };
    let manager = DatabaseManager::new(&config).await?;
    manager.migrate().await?;
    let repos = manager.repositories(instance_name);
    Ok((manager, repos))
}

fn trigger_record(name: &str, group: &str, job: &JobKey, next_fire_offset_secs: i64) -> TriggerRecord {
    let now = Utc::now();
    TriggerRecord {
        scheduler_name: "TestScheduler".to_string(),
        key: TriggerKey::new(name, group),
        job_key: job.clone(),
        description: None,
        state: TriggerState::Waiting,
        priority: 5,
        next_fire_time: Some(now + Duration::seconds(next_fire_offset_secs)),
        previous_fire_time: None,
        start_time: now,
        end_time: None,
        calendar_name: None,
        misfire_instruction: MisfireInstruction::Smart,
        job_data: JobDataMap::new(),
        schedule: ScheduleRecord::Simple(SimpleTriggerRecord {
            repeat_count: -1,
            repeat_interval_ms: 1000,
            times_triggered: 0,
        }),
    }
}

#[tokio::test]
async fn test_job_repository_crud() -> Result<()> {
    let (_manager, repos) = setup("TestScheduler").await?;
    let key = JobKey::new("report", "nightly");
    let mut data = JobDataMap::new();
    data.put("target", "warehouse");
    let job = JobDetail::new(key.clone(), "ReportJob")
        .durable(true)
        .with_job_data(data);

    repos.jobs.insert(&job).await?;
    assert!(repos.jobs.exists(&key).await?);
    assert_eq!(repos.jobs.find(&key).await?, Some(job.clone()));

    let duplicate = repos.jobs.insert(&job).await;
    assert!(matches!(
        duplicate,
        Err(SchedulerError::ObjectAlreadyExists { .. })
    ));

    let mut updated = JobDataMap::new();
    updated.put("target", "lake");
    assert!(repos.jobs.update_job_data(&key, &updated).await?);
    let found = repos.jobs.find(&key).await?.expect("job exists");
    assert_eq!(found.job_data.get_str("target"), Some("lake"));

    assert_eq!(repos.jobs.count().await?, 1);
    assert_eq!(repos.jobs.group_names().await?, vec!["nightly".to_string()]);
    assert!(repos.jobs.delete(&key).await?);
    assert!(!repos.jobs.delete(&key).await?);
    assert_eq!(repos.jobs.find(&key).await?, None);
    Ok(())
}

#[tokio::test]
async fn test_job_keys_with_group_matcher() -> Result<()> {
    let (_manager, repos) = setup("TestScheduler").await?;
    for (name, group) in [("a", "reports_daily"), ("b", "reports_weekly"), ("c", "billing")] {
        repos
            .jobs
            .insert(&JobDetail::new(JobKey::new(name, group), "Job"))
            .await?;
    }

    let keys = repos
        .jobs
        .keys(&GroupMatcher::StartsWith("reports".to_string()))
        .await?;
    assert_eq!(keys.len(), 2);
    let keys = repos.jobs.keys(&GroupMatcher::group_equals("billing")).await?;
    assert_eq!(keys, vec![JobKey::new("c", "billing")]);
    assert_eq!(repos.jobs.keys(&GroupMatcher::Anything).await?.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_trigger_repository_round_trip_and_state_updates() -> Result<()> {
    let (_manager, repos) = setup("TestScheduler").await?;
    let job = JobKey::new("j", "g");
    let mut record = trigger_record("t", "g", &job, 30);
    record.schedule = ScheduleRecord::Cron(CronTriggerRecord {
        cron_expression: "0 0/5 * * * *".to_string(),
        time_zone_id: "UTC".to_string(),
    });
    // 数据库只保存毫秒精度
    record.next_fire_time = Some(Utc.timestamp_millis_opt(1_700_000_000_123).unwrap());
    record.start_time = Utc.timestamp_millis_opt(1_699_999_000_000).unwrap();

    repos.triggers.insert(&record).await?;
    assert_eq!(repos.triggers.find(&record.key).await?, Some(record.clone()));
    assert_eq!(
        repos.triggers.state(&record.key).await?,
        Some(TriggerState::Waiting)
    );

    let claimed = repos
        .triggers
        .update_state_from(&record.key, TriggerState::Acquired, &[TriggerState::Waiting])
        .await?;
    assert_eq!(claimed, 1);
    let claimed_again = repos
        .triggers
        .update_state_from(&record.key, TriggerState::Acquired, &[TriggerState::Waiting])
        .await?;
    assert_eq!(claimed_again, 0);

    assert_eq!(
        repos
            .triggers
            .find_keys_in_states(&[TriggerState::Acquired])
            .await?,
        vec![record.key.clone()]
    );
    assert_eq!(repos.triggers.find_by_job(&job).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_find_to_acquire_orders_by_fire_time_then_priority() -> Result<()> {
    let (_manager, repos) = setup("TestScheduler").await?;
    let job = JobKey::new("j", "g");

    let mut low = trigger_record("low", "g", &job, 5);
    low.priority = 1;
    let mut high = trigger_record("high", "g", &job, 5);
    high.priority = 10;
    high.next_fire_time = low.next_fire_time;
    let early = trigger_record("early", "g", &job, 1);
    let late = trigger_record("late", "g", &job, 3600);
    let mut paused = trigger_record("paused", "g", &job, 1);
    paused.state = TriggerState::Paused;

    for record in [&low, &high, &early, &late, &paused] {
        repos.triggers.insert(record).await?;
    }

    let now = Utc::now();
    let candidates = repos
        .triggers
        .find_to_acquire(now + Duration::seconds(60), now - Duration::seconds(60), 10)
        .await?;
    let names: Vec<_> = candidates.iter().map(|r| r.key.name.as_str()).collect();
    assert_eq!(names, vec!["early", "high", "low"]);

    let limited = repos
        .triggers
        .find_to_acquire(now + Duration::seconds(60), now - Duration::seconds(60), 1)
        .await?;
    assert_eq!(limited.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_misfired_queries() -> Result<()> {
    let (_manager, repos) = setup("TestScheduler").await?;
    let job = JobKey::new("j", "g");

    let missed = trigger_record("missed", "g", &job, -7200);
    let mut ignored = trigger_record("ignored", "g", &job, -7200);
    ignored.misfire_instruction = MisfireInstruction::IgnoreMisfires;
    let on_time = trigger_record("on_time", "g", &job, 10);
    for record in [&missed, &ignored, &on_time] {
        repos.triggers.insert(record).await?;
    }

    let threshold = Utc::now() - Duration::seconds(60);
    assert_eq!(repos.triggers.count_misfired(threshold).await?, 1);
    let found = repos.triggers.find_misfired(threshold, Some(10)).await?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].key.name, "missed");
    Ok(())
}

#[tokio::test]
async fn test_group_state_updates() -> Result<()> {
    let (_manager, repos) = setup("TestScheduler").await?;
    let job = JobKey::new("j", "g");
    let mut blocked = trigger_record("blocked", "reports", &job, 10);
    blocked.state = TriggerState::Blocked;
    let waiting = trigger_record("waiting", "reports", &job, 10);
    let other = trigger_record("other", "billing", &job, 10);
    for record in [&blocked, &waiting, &other] {
        repos.triggers.insert(record).await?;
    }

    let changed = repos
        .triggers
        .update_states_in_group_from(
            &GroupMatcher::group_equals("reports"),
            TriggerState::Paused,
            &[TriggerState::Waiting],
        )
        .await?;
    assert_eq!(changed, 1);
    assert_eq!(
        repos.triggers.state(&waiting.key).await?,
        Some(TriggerState::Paused)
    );
    assert_eq!(
        repos.triggers.state(&other.key).await?,
        Some(TriggerState::Waiting)
    );

    let reset = repos
        .triggers
        .update_states_from(TriggerState::Waiting, &[TriggerState::Blocked])
        .await?;
    assert_eq!(reset, 1);
    Ok(())
}

#[tokio::test]
async fn test_repositories_are_scoped_by_scheduler_name() -> Result<()> {
    let (manager, repos) = setup("SchedulerA").await?;
    let other = manager.repositories("SchedulerB");

    repos
        .jobs
        .insert(&JobDetail::new(JobKey::new("j", "g"), "Job"))
        .await?;
    assert_eq!(repos.jobs.count().await?, 1);
    assert_eq!(other.jobs.count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_fired_trigger_repository() -> Result<()> {
    let (_manager, repos) = setup("TestScheduler").await?;
    let record = FiredTriggerRecord {
        entry_id: "node-1_1".to_string(),
        trigger_key: TriggerKey::new("t", "g"),
        job_key: JobKey::new("j", "g"),
        instance_id: "node-1".to_string(),
        fired_at: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        scheduled_at: Some(Utc.timestamp_millis_opt(1_700_000_000_500).unwrap()),
        priority: 5,
        state: FiredTriggerState::Acquired,
        concurrent_execution_disallowed: true,
        requests_recovery: true,
    };
    repos.fired_triggers.insert(&record).await?;

    let mut executing = record.clone();
    executing.state = FiredTriggerState::Executing;
    assert!(repos.fired_triggers.update(&executing).await?);

    assert_eq!(
        repos.fired_triggers.find_by_instance("node-1").await?,
        vec![executing.clone()]
    );
    assert_eq!(
        repos.fired_triggers.find_by_job(&record.job_key).await?.len(),
        1
    );
    assert_eq!(repos.fired_triggers.delete_by_instance("node-1").await?, 1);
    assert!(repos
        .fired_triggers
        .find_by_trigger(&record.trigger_key)
        .await?
        .is_empty());
    Ok(())
}

#[tokio::test]
async fn test_calendar_repository_round_trip() -> Result<()> {
    let (_manager, repos) = setup("TestScheduler").await?;
    let calendar = Calendar::weekly([6, 7]).with_description("工作日");

    repos.calendars.insert("weekdays", &calendar).await?;
    assert_eq!(repos.calendars.find("weekdays").await?, Some(calendar.clone()));
    assert!(repos.calendars.exists("weekdays").await?);
    assert_eq!(repos.calendars.names().await?, vec!["weekdays".to_string()]);

    let duplicate = repos.calendars.insert("weekdays", &calendar).await;
    assert!(matches!(
        duplicate,
        Err(SchedulerError::ObjectAlreadyExists { .. })
    ));
    assert!(repos.calendars.delete("weekdays").await?);
    assert_eq!(repos.calendars.count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_paused_group_insert_is_idempotent() -> Result<()> {
    let (_manager, repos) = setup("TestScheduler").await?;
    repos.paused_groups.insert("reports").await?;
    repos.paused_groups.insert("reports").await?;
    assert!(repos.paused_groups.exists("reports").await?);
    assert_eq!(repos.paused_groups.all().await?, vec!["reports".to_string()]);
    assert!(repos.paused_groups.delete("reports").await?);
    assert!(!repos.paused_groups.exists("reports").await?);
    Ok(())
}

#[tokio::test]
async fn test_instance_repository_upsert() -> Result<()> {
    let (_manager, repos) = setup("TestScheduler").await?;
    let mut record = SchedulerInstanceRecord {
        instance_name: "TestScheduler".to_string(),
        instance_id: "node-1".to_string(),
        state: SchedulerInstanceState::Started,
        last_checkin_time: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        checkin_interval_ms: 7500,
    };
    repos.instances.upsert(&record).await?;
    record.state = SchedulerInstanceState::Paused;
    repos.instances.upsert(&record).await?;

    assert_eq!(repos.instances.find_all().await?, vec![record.clone()]);
    assert!(repos
        .instances
        .update_state("node-1", SchedulerInstanceState::Resumed)
        .await?);
    assert!(repos.instances.update_checkin("node-1", Utc::now()).await?);
    assert!(repos.instances.delete("node-1").await?);
    assert!(repos.instances.find_all().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_lock_repository_insert_as_claim() -> Result<()> {
    let (_manager, repos) = setup("TestScheduler").await?;
    let lock = |owner: &str| LockRecord {
        instance_name: "TestScheduler".to_string(),
        lock_type: LockType::TriggerAccess,
        owner_instance_id: owner.to_string(),
        acquired_at: Utc::now(),
    };

    assert!(repos.locks.try_insert(&lock("node-1")).await?);
    assert!(!repos.locks.try_insert(&lock("node-2")).await?);

    // 其他实例不能释放不属于自己的锁
    assert!(!repos.locks.delete(LockType::TriggerAccess, "node-2").await?);
    let held = repos.locks.find(LockType::TriggerAccess).await?.expect("lock held");
    assert_eq!(held.owner_instance_id, "node-1");

    // 不同类型的锁互不影响
    let mut state_lock = lock("node-2");
    state_lock.lock_type = LockType::StateAccess;
    assert!(repos.locks.try_insert(&state_lock).await?);

    assert!(repos.locks.delete(LockType::TriggerAccess, "node-1").await?);
    assert!(repos.locks.try_insert(&lock("node-2")).await?);
    Ok(())
}

#[tokio::test]
async fn test_lock_repository_deletes_stale_locks() -> Result<()> {
    let (_manager, repos) = setup("TestScheduler").await?;
    let stale = LockRecord {
        instance_name: "TestScheduler".to_string(),
        lock_type: LockType::TriggerAccess,
        owner_instance_id: "crashed".to_string(),
        acquired_at: Utc::now() - Duration::minutes(30),
    };
    repos.locks.try_insert(&stale).await?;

    let cutoff = Utc::now() - Duration::minutes(60);
    assert!(!repos.locks.delete_stale(LockType::TriggerAccess, cutoff).await?);
    let cutoff = Utc::now() - Duration::minutes(10);
    assert!(repos.locks.delete_stale(LockType::TriggerAccess, cutoff).await?);
    assert!(repos.locks.find(LockType::TriggerAccess).await?.is_none());
    Ok(())
}
