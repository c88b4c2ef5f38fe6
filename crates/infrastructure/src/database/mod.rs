pub mod mapping;
pub mod sqlite;

pub use mapping::MappingHelpers;
pub use sqlite::{
    DatabaseManager, DbPool, SqliteCalendarRepository, SqliteFiredTriggerRepository,
    SqliteInstanceRepository, SqliteJobRepository, SqliteLockRepository,
    SqlitePausedGroupRepository, SqliteTriggerRepository,
};
