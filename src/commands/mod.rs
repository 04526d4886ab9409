pub mod starboard;

use crate::types::{Data, Error};
use poise::Command;

pub fn all_commands() -> Vec<Command<Data, Error>> {
    let mut commands = Vec::new();

    commands.extend(starboard::all_commands());

    commands
}
