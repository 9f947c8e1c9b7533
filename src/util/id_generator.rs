use std::sync::atomic::{AtomicU32, Ordering};

use crate::command::CommandId;

/// Hands out command ids for one transport stack. Ids start at 1 and skip 0 on wrap-around,
///  since 0 marks commands without an id.
pub struct CommandIdGenerator {
    next: AtomicU32,
}

impl Default for CommandIdGenerator {
    fn default() -> Self {
        CommandIdGenerator::starting_at(1)
    }
}

impl CommandIdGenerator {
    pub fn starting_at(first: CommandId) -> CommandIdGenerator {
        CommandIdGenerator {
            next: AtomicU32::new(first),
        }
    }

    pub fn next_id(&self) -> CommandId {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}
