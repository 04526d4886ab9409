use std::sync::Arc;

use crate::helpers::locks::EntryLocks;
use crate::helpers::starboard::StarboardStore;

pub struct Data {
    pub store: Arc<dyn StarboardStore>,
    pub locks: Arc<EntryLocks>,
}

pub type Error = Box<dyn std::error::Error + Send + Sync>;

pub type Context<'a> = poise::Context<'a, Data, Error>;
