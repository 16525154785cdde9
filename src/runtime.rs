//! Composition root and event loop.
//!
//! The runtime owns the client, the clock and every service. All work happens on
//! the loop thread, in reaction to an expired timer or an inbound push message.
//! Push messages may be produced elsewhere; they are only consumed here.

use crate::client::{FeederApi, FeederClientError};
use crate::clock::Clock;
use crate::models::feeder::{HistoryData, Schedule, ScheduleId, Settings};
use crate::notify::Channel;
use crate::services::history::HistoryIngestor;
use crate::services::next_feed::{NextFeed, NextFeedCalculator};
use crate::services::schedules::{ScheduleStore, SyncError};
use crate::services::settings::SettingsStore;
use crate::services::status::{PollingConfig, StatusSynchronizer};
use log::{info, warn};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

/// Wait used when no timer is pending.
const IDLE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Error,
}

/// One-shot user-facing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    fn info(message: impl Into<String>) -> Self {
        Notice {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Notice {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

pub struct Runtime<A: FeederApi> {
    api: A,
    clock: Rc<dyn Clock>,
    status: StatusSynchronizer,
    schedules: ScheduleStore,
    settings: SettingsStore,
    history: HistoryIngestor,
    next_feed: Rc<RefCell<NextFeedCalculator>>,
    next_feed_channel: Rc<Channel<Option<NextFeed>>>,
    notices: Channel<Notice>,
}

impl<A: FeederApi> Runtime<A> {
    pub fn new(api: A, clock: Rc<dyn Clock>, polling: PollingConfig) -> Self {
        let runtime = Runtime {
            api,
            clock,
            status: StatusSynchronizer::new(polling),
            schedules: ScheduleStore::new(),
            settings: SettingsStore::new(),
            history: HistoryIngestor::new(),
            next_feed: Rc::new(RefCell::new(NextFeedCalculator::new())),
            next_feed_channel: Rc::new(Channel::replaying("next_feed")),
            notices: Channel::new("notices"),
        };
        runtime.wire_next_feed();
        runtime
    }

    fn wire_next_feed(&self) {
        let (calc, out, clock) = (
            Rc::clone(&self.next_feed),
            Rc::clone(&self.next_feed_channel),
            Rc::clone(&self.clock),
        );
        self.schedules.channel().subscribe(move |schedules: &Vec<Schedule>| {
            let next = calc.borrow_mut().on_schedules(schedules, clock.utc_now());
            out.publish(next);
        });

        let (calc, out, clock) = (
            Rc::clone(&self.next_feed),
            Rc::clone(&self.next_feed_channel),
            Rc::clone(&self.clock),
        );
        self.history.delta().subscribe(move |delta: &HistoryData| {
            if let Some(next) = calc.borrow_mut().on_history_delta(delta, clock.utc_now()) {
                out.publish(next);
            }
        });
    }

    pub fn status(&self) -> &StatusSynchronizer {
        &self.status
    }

    pub fn schedules(&self) -> &ScheduleStore {
        &self.schedules
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn history(&self) -> &HistoryIngestor {
        &self.history
    }

    pub fn next_feed(&self) -> &Channel<Option<NextFeed>> {
        &self.next_feed_channel
    }

    pub fn notices(&self) -> &Channel<Notice> {
        &self.notices
    }

    /// Initial fetches, then start polling. Failures are reported, not fatal.
    pub fn bootstrap(&mut self) {
        if let Err(e) = self.schedules.fetch_all(&self.api) {
            warn!("Initial schedule fetch failed: {}", e);
            self.note_transport(e.is_transport());
        }
        if let Err(e) = self.settings.fetch(&self.api) {
            self.note_transport(e.is_transport());
        }
        self.status.start(self.clock.now());
    }

    /// Fire every timer that has expired.
    pub fn tick(&mut self) {
        let now = self.clock.now();
        self.status.on_timer(&self.api, now);
    }

    /// Time left until the next timer expires.
    pub fn time_to_next_deadline(&self) -> Duration {
        match self.status.next_deadline() {
            Some(deadline) => deadline.saturating_duration_since(self.clock.now()),
            None => IDLE_WAIT,
        }
    }

    pub fn handle_push(&mut self, text: &str) {
        let Ok(outcome) = self.history.ingest_text(text) else {
            return;
        };
        if let Some(status) = outcome.status {
            self.status.relay(status);
        }
    }

    fn note_transport(&self, transport: bool) {
        if transport {
            self.status.mark_disconnected();
        }
    }

    fn report<T>(&self, result: Result<T, SyncError>, success: impl FnOnce(&T) -> String, failure: &str) -> Result<T, SyncError> {
        match &result {
            Ok(value) => self.notices.publish(Notice::info(success(value))),
            Err(SyncError::Validation(msg)) => {
                self.notices.publish(Notice::error(format!("Please fill in all required fields: {}", msg)))
            }
            Err(e) => {
                self.note_transport(e.is_transport());
                self.notices.publish(Notice::error(format!("{}: {}", failure, e)));
            }
        }
        result
    }

    pub fn save_schedule(&mut self, schedule: Schedule) -> Result<ScheduleId, SyncError> {
        let name = schedule.name.clone();
        let result = self.schedules.upsert(&self.api, schedule);
        self.report(result, |_| format!("Saved '{}'", name), "Saving the schedule failed")
    }

    pub fn toggle_schedule(&mut self, schedule: &Schedule, active: bool) -> Result<(), SyncError> {
        let result = self.schedules.toggle_active(&self.api, schedule, active);
        let verb = if active { "activated" } else { "paused" };
        self.report(
            result,
            |_| format!("'{}' {}", schedule.name, verb),
            "Changing the schedule failed",
        )
    }

    pub fn delete_schedule(&mut self, schedule: &Schedule) -> Result<(), SyncError> {
        let result = self.schedules.delete(&self.api, schedule);
        self.report(result, |_| format!("Deleted '{}'", schedule.name), "Deleting the schedule failed")
    }

    pub fn save_settings(&mut self, settings: Settings) -> Result<(), FeederClientError> {
        let result = self.settings.save(&self.api, settings);
        self.report_client(result, "Settings saved", "Saving the settings failed")
    }

    pub fn start_feed(&mut self) -> Result<(), FeederClientError> {
        let result = self.status.start_feed(&self.api);
        self.report_client(result, "Feeding started", "Starting the feeding failed")
    }

    pub fn stop_feed(&mut self) -> Result<(), FeederClientError> {
        let result = self.status.stop_feed(&self.api);
        self.report_client(result, "Feeding stopped", "Stopping the feeding failed")
    }

    fn report_client(
        &self,
        result: Result<(), FeederClientError>,
        success: &str,
        failure: &str,
    ) -> Result<(), FeederClientError> {
        match &result {
            Ok(()) => self.notices.publish(Notice::info(success)),
            Err(e) => {
                self.note_transport(e.is_transport());
                self.notices.publish(Notice::error(format!("{}: {}", failure, e)));
            }
        }
        result
    }

    /// Run forever, waiting on `inbox` until the next timer deadline.
    pub fn run(&mut self, inbox: Receiver<String>) {
        info!("Event loop started");
        let mut inbox_open = true;
        loop {
            self.tick();
            let wait = self.time_to_next_deadline();
            if !inbox_open {
                self.clock.sleep(wait);
                continue;
            }
            match inbox.recv_timeout(wait) {
                Ok(message) => self.handle_push(&message),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!("Push channel closed; continuing with polling only");
                    inbox_open = false;
                }
            }
        }
    }
}
