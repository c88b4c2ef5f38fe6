//! 集群作业存储
//!
//! 在共享存储之上实现作业、触发器和日历的持久化，以及多实例之间的
//! 触发器获取、触发、完成、错过触发修正和启动恢复。实例之间通过
//! 数据库锁行互斥，存储访问通过 `scheduler_domain` 中的仓储抽象完成。

mod context;
pub mod id_generator;
pub mod job_store;
pub mod lock_manager;
pub mod misfire_handler;
pub mod recovery;
pub mod signaler;
pub mod trigger_factory;

pub use context::MisfireRecoveryOutcome;
pub use id_generator::FireInstanceIdGenerator;
pub use job_store::JobStore;
pub use lock_manager::{LockGuard, LockManager};
pub use misfire_handler::MisfireHandler;
pub use recovery::RecoveryReport;
pub use signaler::{ChannelSignaler, LoggingSignaler, PendingSignals, SchedulerSignaler, SignalEvent};
pub use trigger_factory::TriggerFactory;
