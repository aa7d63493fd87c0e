use crate::dap::protocol::InternalEvent;
use crate::dap::PROCESS_THREAD_ID;
use crate::debugger::{EventHook, StopReason};
use std::sync::{Arc, Mutex};

/// Events waiting to be sent to the client. Shared between the request loop, the
/// debugger hooks and [`crate::dap::logger::DapLogger`].
#[derive(Debug, Clone, Default)]
pub struct EventQueue(Arc<Mutex<Vec<InternalEvent>>>);

impl EventQueue {
    pub fn push(&self, event: InternalEvent) {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }

    /// Remove and return all queued events in order.
    pub fn take(&self) -> Vec<InternalEvent> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

/// Debugger hooks turning stops and termination into DAP events.
pub struct DapHook {
    events: EventQueue,
}

impl DapHook {
    pub fn new(events: EventQueue) -> Self {
        Self { events }
    }
}

impl EventHook for DapHook {
    fn on_stopped(&self, reason: StopReason, description: &str) -> anyhow::Result<()> {
        self.events.push(InternalEvent::Stopped {
            reason: reason.to_string(),
            thread_id: Some(PROCESS_THREAD_ID),
            description: Some(description.to_string()),
        });
        Ok(())
    }

    fn on_terminated(&self) {
        self.events.push(InternalEvent::Terminated);
    }
}
