pub mod attendance;
pub mod backup_exchange;
pub mod core;
pub mod grade_types;
pub mod grades;
pub mod homework;
pub mod roster;
pub mod sections;
