//! The global entity id counter.
//!
//! On the host an [`IdAssigner`] is the single authority: every id is handed
//! out under its lock, and client guesses are checked against it. Clients
//! keep their own copy for guessing and overwrite it with every counter
//! update from the host.

use std::sync::{Mutex, MutexGuard, PoisonError};

use strata_world::ObjectId;

/// Outcome of checking a client's guessed id against the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdClaim {
    Accepted(ObjectId),
    Corrected { guessed: ObjectId, assigned: ObjectId },
}

impl IdClaim {
    /// The id the entity ends up with.
    pub fn id(&self) -> ObjectId {
        match *self {
            IdClaim::Accepted(id) => id,
            IdClaim::Corrected { assigned, .. } => assigned,
        }
    }
}

/// Monotonic id counter. `current` is the id the next entity will get.
#[derive(Debug)]
pub struct IdAssigner {
    current: Mutex<i32>,
}

impl IdAssigner {
    /// First id handed out in a new world.
    pub const FIRST_ID: i32 = 1;

    pub fn new(current: i32) -> Self {
        Self {
            current: Mutex::new(current),
        }
    }

    fn lock(&self) -> MutexGuard<'_, i32> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current(&self) -> i32 {
        *self.lock()
    }

    /// Hands out the current id and advances.
    pub fn allocate(&self) -> ObjectId {
        let mut current = self.lock();
        let id = ObjectId(*current);
        *current += 1;
        id
    }

    /// Host side: a client created an entity under `guess`. The guess stands
    /// only if it equals the current value; otherwise the entity gets the
    /// current value. Either way the counter advances by one.
    pub fn claim(&self, guess: ObjectId) -> IdClaim {
        let mut current = self.lock();
        let assigned = ObjectId(*current);
        *current += 1;
        if guess == assigned {
            IdClaim::Accepted(assigned)
        } else {
            IdClaim::Corrected { guessed: guess, assigned }
        }
    }

    /// Client side: adopt the host's value.
    pub fn observe(&self, current: i32) {
        *self.lock() = current;
    }
}

impl Default for IdAssigner {
    fn default() -> Self {
        Self::new(Self::FIRST_ID)
    }
}
