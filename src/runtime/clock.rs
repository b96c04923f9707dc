use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};

/// Source of wall-clock time for every reconciler.
///
/// `Manual` only moves when told to, which makes time-triggered transitions testable.
#[derive(Clone, Debug, Default)]
pub enum Clock {
    #[default]
    System,
    Manual(Arc<RwLock<DateTime<Utc>>>),
}

impl Clock {
    pub fn manual(start: DateTime<Utc>) -> Self {
        Clock::Manual(Arc::new(RwLock::new(start)))
    }

    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Manual(t) => *t.read().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// No-op on the system clock
    pub fn advance(&self, by: chrono::Duration) {
        if let Clock::Manual(t) = self {
            let mut t = t.write().unwrap_or_else(PoisonError::into_inner);
            *t += by;
        }
    }

    /// No-op on the system clock
    pub fn set(&self, to: DateTime<Utc>) {
        if let Clock::Manual(t) = self {
            *t.write().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    /// Time left until `deadline`, zero if it has passed
    pub fn until(&self, deadline: DateTime<Utc>) -> std::time::Duration {
        (deadline - self.now()).to_std().unwrap_or_default()
    }
}
