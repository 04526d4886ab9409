pub mod locks;
pub mod retention_task;

pub mod starboard;
pub mod starboard_manager;
