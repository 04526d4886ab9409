pub mod starboard_entry;
pub mod starboard_message;
