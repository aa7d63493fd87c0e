use crate::dap::hook::EventQueue;
use crate::dap::protocol::InternalEvent;
use log::{LevelFilter, Log, Metadata, Record};

/// Logger forwarding records to the client as `console` output events.
pub struct DapLogger {
    events: EventQueue,
    level: LevelFilter,
}

impl DapLogger {
    pub fn new(events: EventQueue, level: LevelFilter) -> Self {
        Self { events, level }
    }
}

impl Log for DapLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.events.push(InternalEvent::Output {
            category: "console",
            output: format!("[{} {}] {}\n", record.level(), record.target(), record.args()),
        });
    }

    fn flush(&self) {}
}
