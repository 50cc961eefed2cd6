use crate::prelude::*;

use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Push,
    Poll,
}

/// The most recent register map pushed by a logger, shared between the
/// push server (writer) and the refresh cycle (reader). Maps are swapped
/// in and out whole.
#[derive(Clone, Debug, Default)]
pub struct PushSlot(Arc<Mutex<Option<RegisterMap>>>);

impl PushSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces whatever is waiting; only the newest push matters.
    pub fn store(&self, regs: RegisterMap) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(regs);
    }

    pub fn take(&self) -> Option<RegisterMap> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn is_empty(&self) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

#[derive(Clone, Debug, Default)]
pub struct DataArbiter {
    slot: PushSlot,
}

impl DataArbiter {
    pub fn new(slot: PushSlot) -> Self {
        Self { slot }
    }

    pub fn slot(&self) -> &PushSlot {
        &self.slot
    }

    pub fn take_pushed(&self) -> Option<RegisterMap> {
        self.slot.take()
    }

    /// Pushed data wins and is consumed; `poll` only runs when nothing was
    /// pushed since the last cycle. The two are never merged.
    pub async fn next<F, Fut>(&self, poll: F) -> Result<(RegisterMap, Source)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RegisterMap>>,
    {
        if let Some(regs) = self.take_pushed() {
            debug!("using {} registers from push server", regs.len());
            return Ok((regs, Source::Push));
        }

        Ok((poll().await?, Source::Poll))
    }
}
