//! 作业存储领域模型
//!
//! 包含作业、触发器、日历等实体，四种调度类型的触发时间计算，
//! 以及作业存储依赖的仓储抽象。

pub mod calendar;
pub mod entities;
pub mod repositories;
pub mod trigger;
pub mod value_objects;

pub use calendar::*;
pub use entities::*;
pub use repositories::*;
pub use scheduler_errors::{SchedulerError, SchedulerResult};
pub use trigger::*;
pub use value_objects::*;
