//! In-memory feeder for offline runs and tests.
//!
//! Scale readings drift slightly between polls and now and then show a feeding
//! (container drops, plate fills). Schedules and settings live in memory and
//! follow the device's rules: POST assigns IDs, activation selects one schedule.
//! Failures can be queued to exercise the error paths.

use crate::client::{FeederApi, FeederClientError};
use crate::models::feeder::*;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

const CONTAINER_CAPACITY_G: f64 = 1000.0;
const PLATE_CAPACITY_G: f64 = 100.0;
const FEEDING_CHANCE: f64 = 0.08;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Behave as if the device were offline.
    Unreachable,
    /// Answer with this HTTP status.
    Rejected(u16),
}

pub struct MockFeeder {
    rng: RefCell<SmallRng>,
    status: RefCell<MachineStatus>,
    scripted: RefCell<VecDeque<MachineStatus>>,
    repeat_last: Cell<bool>,
    schedules: RefCell<Vec<Schedule>>,
    next_id: Cell<i64>,
    settings: RefCell<Settings>,
    failures: RefCell<VecDeque<MockFailure>>,
    calls: Cell<usize>,
}

impl MockFeeder {
    pub fn new(seed: u64) -> Self {
        MockFeeder {
            rng: RefCell::new(SmallRng::seed_from_u64(seed)),
            status: RefCell::new(MachineStatus {
                container_load: 800.0,
                plate_load: 5.0,
                open: false,
                motor_operation: true,
                sd_card_connection: true,
                automatic_feeding: Some(true),
                manual_feeding: Some(false),
            }),
            scripted: RefCell::new(VecDeque::new()),
            repeat_last: Cell::new(false),
            schedules: RefCell::new(Vec::new()),
            next_id: Cell::new(1),
            settings: RefCell::new(Settings {
                pet_name: Some("Tiger".to_string()),
                plate_tar: Some(0.0),
                plate_filling: Some(50.0),
                ..Settings::default()
            }),
            failures: RefCell::new(VecDeque::new()),
            calls: Cell::new(0),
        }
    }

    /// A feeder with one selected fixed-daytime schedule and one max-times schedule.
    pub fn with_demo_data(seed: u64) -> Self {
        let feeder = Self::new(seed);
        feeder.seed_schedule(Schedule {
            name: "Weekdays".to_string(),
            selected: true,
            active: true,
            mode: ScheduleMode::FixedDaytime,
            daytimes: vec![21_600_000, 45_000_000, 70_200_000],
            ..Schedule::default()
        });
        feeder.seed_schedule(Schedule {
            name: "Diet".to_string(),
            mode: ScheduleMode::MaxTimes,
            max_times: 3,
            max_times_start_time: Some(25_200_000),
            only_when_empty: true,
            ..Schedule::default()
        });
        feeder
    }

    /// Store a schedule as if it had been saved earlier; returns its ID.
    pub fn seed_schedule(&self, mut schedule: Schedule) -> ScheduleId {
        let id = self.take_id();
        schedule.id = Some(id);
        self.schedules.borrow_mut().push(schedule);
        id
    }

    pub fn set_next_id(&self, id: i64) {
        self.next_id.set(id);
    }

    /// Serve these readings in order, then keep repeating the last one.
    pub fn script_status(&self, readings: impl IntoIterator<Item = MachineStatus>) {
        self.scripted.borrow_mut().extend(readings);
        self.repeat_last.set(true);
    }

    pub fn fail_next(&self, failure: MockFailure) {
        self.failures.borrow_mut().push_back(failure);
    }

    pub fn call_count(&self) -> usize {
        self.calls.get()
    }

    pub fn gate_open(&self) -> bool {
        self.status.borrow().open
    }

    fn take_id(&self) -> ScheduleId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        ScheduleId(id)
    }

    /// Count the call and pop a queued failure, if any.
    fn request(&self) -> Result<(), FeederClientError> {
        self.calls.set(self.calls.get() + 1);
        match self.failures.borrow_mut().pop_front() {
            None => Ok(()),
            Some(MockFailure::Unreachable) => Err(FeederClientError::Transport("connection refused".to_string())),
            Some(MockFailure::Rejected(status)) => Err(FeederClientError::Http {
                status,
                message: "mock rejection".to_string(),
            }),
        }
    }

    fn not_found(id: ScheduleId) -> FeederClientError {
        FeederClientError::Http {
            status: 404,
            message: format!("schedule {} not found", id.0),
        }
    }

    fn next_reading(&self) -> MachineStatus {
        let mut scripted = self.scripted.borrow_mut();
        if let Some(next) = scripted.pop_front() {
            *self.status.borrow_mut() = next.clone();
            return next;
        }
        drop(scripted);
        if self.repeat_last.get() {
            return self.status.borrow().clone();
        }

        let mut rng = self.rng.borrow_mut();
        let mut status = self.status.borrow_mut();
        if rng.random_bool(FEEDING_CHANCE) {
            let portion = rng.random_range(5.0..=20.0);
            status.container_load -= portion;
            status.plate_load += portion;
        } else {
            status.container_load += rng.random_range(-0.4..=0.4);
            // the pet eats a little
            status.plate_load -= rng.random_range(0.0..=0.6);
        }
        status.container_load = status.container_load.clamp(0.0, CONTAINER_CAPACITY_G);
        status.plate_load = status.plate_load.clamp(0.0, PLATE_CAPACITY_G);
        status.container_load = (status.container_load * 100.0).floor() / 100.0;
        status.plate_load = (status.plate_load * 100.0).floor() / 100.0;
        status.clone()
    }
}

impl FeederApi for MockFeeder {
    fn get_status(&self) -> Result<MachineStatus, FeederClientError> {
        self.request()?;
        Ok(self.next_reading())
    }

    fn get_schedules(&self) -> Result<Vec<Schedule>, FeederClientError> {
        self.request()?;
        Ok(self.schedules.borrow().clone())
    }

    fn create_schedule(&self, schedule: &Schedule) -> Result<ScheduleId, FeederClientError> {
        self.request()?;
        let mut stored = schedule.clone();
        let id = self.take_id();
        stored.id = Some(id);
        self.schedules.borrow_mut().push(stored);
        Ok(id)
    }

    fn update_schedule(&self, schedule: &Schedule) -> Result<(), FeederClientError> {
        self.request()?;
        let id = schedule.id.ok_or_else(|| FeederClientError::Http {
            status: 400,
            message: "missing ID".to_string(),
        })?;
        let mut schedules = self.schedules.borrow_mut();
        let existing = schedules
            .iter_mut()
            .find(|s| s.id == Some(id))
            .ok_or_else(|| Self::not_found(id))?;
        *existing = schedule.clone();
        Ok(())
    }

    fn delete_schedule(&self, id: ScheduleId) -> Result<(), FeederClientError> {
        self.request()?;
        let mut schedules = self.schedules.borrow_mut();
        let before = schedules.len();
        schedules.retain(|s| s.id != Some(id));
        if schedules.len() == before {
            return Err(Self::not_found(id));
        }
        Ok(())
    }

    fn activate_schedule(&self, id: ScheduleId, active: bool) -> Result<(), FeederClientError> {
        self.request()?;
        let mut schedules = self.schedules.borrow_mut();
        if !schedules.iter().any(|s| s.id == Some(id)) {
            return Err(Self::not_found(id));
        }
        for s in schedules.iter_mut() {
            let target = s.id == Some(id);
            s.selected = target;
            s.active = target && active;
        }
        Ok(())
    }

    fn get_settings(&self) -> Result<Settings, FeederClientError> {
        self.request()?;
        Ok(self.settings.borrow().clone())
    }

    fn update_settings(&self, settings: &Settings) -> Result<(), FeederClientError> {
        self.request()?;
        *self.settings.borrow_mut() = settings.clone();
        Ok(())
    }

    fn open_food(&self) -> Result<(), FeederClientError> {
        self.request()?;
        self.status.borrow_mut().open = true;
        Ok(())
    }

    fn close_food(&self) -> Result<(), FeederClientError> {
        self.request()?;
        self.status.borrow_mut().open = false;
        Ok(())
    }
}
