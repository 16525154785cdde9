//! Local schedule cache, mutated only after the device confirms a change.
//!
//! Each operation runs as `prepare -> dispatch -> confirm`. Nothing local changes
//! before `confirm` sees a successful [`Confirmation`]; a failed confirmation
//! leaves the collection exactly as it was. Confirmations are applied in the order
//! they are handed in, which is not necessarily the order the requests were made.
//! Selection flags change only through [`ScheduleStore::toggle_active`]; upserts
//! keep the cached flags (or clear them for a new schedule).

use crate::client::{FeederApi, FeederClientError};
use crate::clock::{ClockError, parse_time_of_day_input};
use crate::models::feeder::{Schedule, ScheduleId};
use crate::notify::Channel;
use chrono::{DateTime, TimeZone, Utc};
use core::fmt;
use log::{info, warn};
use std::error::Error;

#[derive(Debug)]
pub enum SyncError {
    /// The remote call failed or was rejected
    Api(FeederClientError),
    /// Required fields missing; nothing was sent
    Validation(String),
    /// The schedule has never been saved, so it has no ID to address it by
    NotPersisted,
    /// No local schedule carries this ID
    UnknownSchedule(ScheduleId),
    /// The device answered in a way that does not fit the request
    Protocol(String),
}

impl SyncError {
    pub fn is_transport(&self) -> bool {
        matches!(self, SyncError::Api(e) if e.is_transport())
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Api(e) => write!(f, "api error: {}", e),
            SyncError::Validation(msg) => write!(f, "invalid schedule: {}", msg),
            SyncError::NotPersisted => write!(f, "schedule has not been saved yet"),
            SyncError::UnknownSchedule(id) => write!(f, "schedule {} not found", id.0),
            SyncError::Protocol(msg) => write!(f, "unexpected device answer: {}", msg),
        }
    }
}

impl Error for SyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SyncError::Api(e) => Some(e),
            _ => None,
        }
    }
}

impl From<FeederClientError> for SyncError {
    fn from(value: FeederClientError) -> Self {
        SyncError::Api(value)
    }
}

/// A requested change that is waiting for the device's answer.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Create(Schedule),
    Update(Schedule),
    Toggle { id: ScheduleId, active: bool },
    Delete(ScheduleId),
}

/// A successful answer from the device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Created(ScheduleId),
    Accepted,
}

pub struct ScheduleStore {
    schedules: Vec<Schedule>,
    channel: Channel<Vec<Schedule>>,
    fetching: Channel<bool>,
}

impl Default for ScheduleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduleStore {
    pub fn new() -> Self {
        ScheduleStore {
            schedules: Vec::new(),
            channel: Channel::replaying("schedules"),
            fetching: Channel::with_initial("schedules.fetching", false),
        }
    }

    pub fn schedules(&self) -> &[Schedule] {
        &self.schedules
    }

    /// Full collection after every confirmed change or fetch.
    pub fn channel(&self) -> &Channel<Vec<Schedule>> {
        &self.channel
    }

    pub fn fetching(&self) -> &Channel<bool> {
        &self.fetching
    }

    pub fn get(&self, id: ScheduleId) -> Option<&Schedule> {
        self.schedules.iter().find(|s| s.id == Some(id))
    }

    /// The schedule shown as current on the dashboard.
    pub fn selected(&self) -> Option<&Schedule> {
        self.schedules.iter().find(|s| s.selected)
    }

    fn notify(&self) {
        self.channel.publish(self.schedules.clone());
    }

    /// Replace the whole collection with the device's list.
    pub fn fetch_all(&mut self, api: &dyn FeederApi) -> Result<usize, SyncError> {
        self.fetching.publish(true);
        let result = api.get_schedules();
        self.fetching.publish(false);

        let mut schedules = result?;
        for s in schedules.iter_mut() {
            s.normalize_daytimes();
        }
        info!("Fetched {} schedule(s)", schedules.len());
        self.schedules = schedules;
        self.notify();
        Ok(self.schedules.len())
    }

    /// Create (no ID) or update (ID present) a schedule.
    pub fn upsert(&mut self, api: &dyn FeederApi, schedule: Schedule) -> Result<ScheduleId, SyncError> {
        let mutation = self.prepare_upsert(schedule)?;
        let result = Self::dispatch(api, &mutation);
        self.confirm(mutation, result)?
            .ok_or_else(|| SyncError::Protocol("upsert confirmed without an ID".to_string()))
    }

    /// Select `schedule` and set its activity; every other selected schedule is
    /// deselected and deactivated once the device confirms.
    pub fn toggle_active(&mut self, api: &dyn FeederApi, schedule: &Schedule, active: bool) -> Result<(), SyncError> {
        let id = self.persisted_id(schedule)?;
        let mutation = Mutation::Toggle { id, active };
        let result = Self::dispatch(api, &mutation);
        self.confirm(mutation, result).map(|_| ())
    }

    pub fn delete(&mut self, api: &dyn FeederApi, schedule: &Schedule) -> Result<(), SyncError> {
        let id = self.persisted_id(schedule)?;
        let mutation = Mutation::Delete(id);
        let result = Self::dispatch(api, &mutation);
        self.confirm(mutation, result).map(|_| ())
    }

    fn persisted_id(&self, schedule: &Schedule) -> Result<ScheduleId, SyncError> {
        let id = schedule.id.ok_or(SyncError::NotPersisted)?;
        if self.get(id).is_none() {
            return Err(SyncError::UnknownSchedule(id));
        }
        Ok(id)
    }

    /// Validate and normalize a schedule before it is sent. The selection flags
    /// are taken from the cache, so an upsert never changes which schedule is current.
    pub fn prepare_upsert(&self, mut schedule: Schedule) -> Result<Mutation, SyncError> {
        schedule.normalize_daytimes();
        schedule.validate().map_err(SyncError::Validation)?;
        self.carry_selection(&mut schedule);
        Ok(match schedule.id {
            Some(_) => Mutation::Update(schedule),
            None => Mutation::Create(schedule),
        })
    }

    /// Perform the remote half of a mutation.
    pub fn dispatch(api: &dyn FeederApi, mutation: &Mutation) -> Result<Confirmation, FeederClientError> {
        match mutation {
            Mutation::Create(s) => api.create_schedule(s).map(Confirmation::Created),
            Mutation::Update(s) => api.update_schedule(s).map(|_| Confirmation::Accepted),
            Mutation::Toggle { id, active } => api.activate_schedule(*id, *active).map(|_| Confirmation::Accepted),
            Mutation::Delete(id) => api.delete_schedule(*id).map(|_| Confirmation::Accepted),
        }
    }

    /// Apply the device's answer to a dispatched mutation.
    ///
    /// Returns the affected schedule's ID for creates and updates.
    pub fn confirm(
        &mut self,
        mutation: Mutation,
        result: Result<Confirmation, FeederClientError>,
    ) -> Result<Option<ScheduleId>, SyncError> {
        let confirmation = match result {
            Ok(c) => c,
            Err(e) => {
                warn!("Schedule change rejected ({}): {}", mutation_label(&mutation), e);
                return Err(SyncError::Api(e));
            }
        };

        let affected = match (mutation, confirmation) {
            (Mutation::Create(mut schedule), Confirmation::Created(id)) => {
                schedule.id = Some(id);
                info!("Schedule '{}' created with id {}", schedule.name, id.0);
                self.put(schedule);
                Some(id)
            }
            (Mutation::Update(schedule), _) => {
                let id = schedule.id;
                info!("Schedule '{}' updated", schedule.name);
                self.put(schedule);
                id
            }
            (Mutation::Toggle { id, active }, _) => {
                self.apply_toggle(id, active)?;
                Some(id)
            }
            (Mutation::Delete(id), _) => {
                let before = self.schedules.len();
                self.schedules.retain(|s| s.id != Some(id));
                if self.schedules.len() == before {
                    warn!("Deleted schedule {} was not cached locally", id.0);
                }
                None
            }
            (Mutation::Create(schedule), Confirmation::Accepted) => {
                return Err(SyncError::Protocol(format!(
                    "device accepted '{}' without assigning an id",
                    schedule.name
                )));
            }
        };

        self.notify();
        Ok(affected)
    }

    /// Copy `Selected`/`Active` from the cached entry with the same ID; a schedule
    /// the cache does not know starts out neither selected nor active.
    fn carry_selection(&self, schedule: &mut Schedule) {
        let cached = schedule.id.and_then(|id| self.get(id));
        schedule.selected = cached.is_some_and(|c| c.selected);
        schedule.active = cached.is_some_and(|c| c.active);
    }

    /// Replace the entry with the same ID, or append it.
    fn put(&mut self, mut schedule: Schedule) {
        self.carry_selection(&mut schedule);
        match self.schedules.iter_mut().find(|s| s.id.is_some() && s.id == schedule.id) {
            Some(existing) => *existing = schedule,
            None => self.schedules.push(schedule),
        }
    }

    fn apply_toggle(&mut self, id: ScheduleId, active: bool) -> Result<(), SyncError> {
        if self.get(id).is_none() {
            warn!("Activation confirmed for schedule {} which is no longer cached", id.0);
            return Err(SyncError::UnknownSchedule(id));
        }
        for s in self.schedules.iter_mut() {
            if s.id == Some(id) {
                s.selected = true;
                s.active = active;
            } else if s.selected {
                s.selected = false;
                s.active = false;
            }
        }
        info!("Schedule {} selected (active={})", id.0, active);
        Ok(())
    }
}

fn mutation_label(mutation: &Mutation) -> String {
    match mutation {
        Mutation::Create(s) => format!("create '{}'", s.name),
        Mutation::Update(s) => format!("update '{}'", s.name),
        Mutation::Toggle { id, active } => format!("activate {}={}", id.0, active),
        Mutation::Delete(id) => format!("delete {}", id.0),
    }
}

/// Add a daytime typed as `HH:MM[:SS]`; returns `false` if it was already present.
pub fn add_daytime_input<Tz: TimeZone>(
    schedule: &mut Schedule,
    tz: &Tz,
    text: &str,
    now: DateTime<Utc>,
) -> Result<bool, ClockError> {
    let daytime = parse_time_of_day_input(tz, text, now)?;
    if schedule.daytimes.contains(&daytime) {
        return Ok(false);
    }
    schedule.daytimes.push(daytime);
    schedule.normalize_daytimes();
    Ok(true)
}

pub fn remove_daytime(schedule: &mut Schedule, daytime: i64) -> bool {
    let before = schedule.daytimes.len();
    schedule.daytimes.retain(|d| *d != daytime);
    schedule.daytimes.len() != before
}

/// Set the start of the max-times window from `HH:MM[:SS]` input.
pub fn set_max_times_start_input<Tz: TimeZone>(
    schedule: &mut Schedule,
    tz: &Tz,
    text: &str,
    now: DateTime<Utc>,
) -> Result<(), ClockError> {
    schedule.max_times_start_time = Some(parse_time_of_day_input(tz, text, now)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::feeder::ScheduleMode;
    use crate::services::mock::{MockFailure, MockFeeder};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn daytime_schedule(name: &str, daytimes: &[i64]) -> Schedule {
        Schedule {
            name: name.to_string(),
            daytimes: daytimes.to_vec(),
            ..Schedule::default()
        }
    }

    fn seeded() -> (MockFeeder, ScheduleStore) {
        let api = MockFeeder::new(1);
        let mut weekdays = daytime_schedule("Weekdays", &[21_600_000]);
        weekdays.selected = true;
        weekdays.active = true;
        api.seed_schedule(weekdays);
        api.seed_schedule(daytime_schedule("Weekend", &[32_400_000]));
        api.seed_schedule(daytime_schedule("Holiday", &[36_000_000]));

        let mut store = ScheduleStore::new();
        store.fetch_all(&api).expect("fetch");
        (api, store)
    }

    fn current_count(store: &ScheduleStore) -> usize {
        store.schedules().iter().filter(|s| s.is_current()).count()
    }

    #[test]
    fn create_appends_with_assigned_id_once() {
        let api = MockFeeder::new(1);
        api.set_next_id(7);
        let mut store = ScheduleStore::new();

        let id = store
            .upsert(&api, daytime_schedule("Night", &[79_200_000]))
            .expect("create");

        assert_eq!(id, ScheduleId(7));
        assert_eq!(store.schedules().len(), 1);
        assert_eq!(store.schedules()[0].id, Some(ScheduleId(7)));
        assert!(store.schedules().iter().all(|s| s.id.is_some()));
    }

    #[test]
    fn create_confirmed_after_refetch_does_not_duplicate() {
        let api = MockFeeder::new(1);
        api.set_next_id(7);
        let mut store = ScheduleStore::new();

        let mutation = store.prepare_upsert(daytime_schedule("Night", &[1])).expect("valid");
        let result = ScheduleStore::dispatch(&api, &mutation);
        // the echo of the new schedule arrives through a full fetch first
        store.fetch_all(&api).expect("fetch");
        store.confirm(mutation, result).expect("confirm");

        assert_eq!(store.schedules().len(), 1);
        assert_eq!(store.schedules()[0].id, Some(ScheduleId(7)));
    }

    #[test]
    fn failed_create_changes_nothing() {
        let (api, mut store) = seeded();
        let before = store.schedules().to_vec();
        api.fail_next(MockFailure::Rejected(500));

        let err = store
            .upsert(&api, daytime_schedule("Broken", &[1]))
            .expect_err("rejected");
        assert!(matches!(err, SyncError::Api(FeederClientError::Http { status: 500, .. })));
        assert_eq!(store.schedules(), &before[..]);
    }

    #[test]
    fn invalid_schedule_is_not_sent() {
        let (api, mut store) = seeded();
        let calls = api.call_count();
        let err = store
            .upsert(
                &api,
                Schedule {
                    name: "Diet".into(),
                    mode: ScheduleMode::MaxTimes,
                    ..Schedule::default()
                },
            )
            .expect_err("invalid");
        assert!(matches!(err, SyncError::Validation(_)));
        assert_eq!(api.call_count(), calls);
    }

    #[test]
    fn update_replaces_by_id_and_normalizes_daytimes() {
        let (api, mut store) = seeded();
        let mut edited = store.schedules()[1].clone();
        edited.daytimes = vec![50_000, 10_000, 50_000];

        store.upsert(&api, edited.clone()).expect("update");

        let stored = store.get(edited.id.expect("id")).expect("present");
        assert_eq!(stored.daytimes, vec![10_000, 50_000]);
        assert_eq!(store.schedules().len(), 3);
    }

    #[test]
    fn upserts_never_add_a_second_current_schedule() {
        let (api, mut store) = seeded();
        let weekdays = store.schedules()[0].clone();
        assert!(weekdays.is_current());

        // a copy of the current schedule saved as new
        let copy = Schedule {
            id: None,
            name: "Weekdays copy".into(),
            ..weekdays.clone()
        };
        let copy_id = store.upsert(&api, copy).expect("create");
        let stored = store.get(copy_id).expect("cached");
        assert!(!stored.selected && !stored.active);
        assert_eq!(current_count(&store), 1);

        // an edit made while "Weekend" was still the current schedule
        let mut stale = store.schedules()[1].clone();
        stale.selected = true;
        stale.active = true;
        stale.name = "Weekend (edited)".into();
        store.upsert(&api, stale).expect("update");
        assert_eq!(current_count(&store), 1);
        assert_eq!(store.selected().map(|s| s.name.as_str()), Some("Weekdays"));

        // the pause state of the current schedule survives an edit that lost it
        store.toggle_active(&api, &weekdays, false).expect("pause");
        store.upsert(&api, weekdays.clone()).expect("update");
        let paused = store.get(weekdays.id.expect("id")).expect("cached");
        assert!(paused.selected && !paused.active);
        assert_eq!(current_count(&store), 0);
    }

    #[test]
    fn create_confirmed_without_id_is_a_protocol_error() {
        let (_api, mut store) = seeded();
        let before = store.schedules().to_vec();
        let mutation = store.prepare_upsert(daytime_schedule("Night", &[1])).expect("valid");

        let err = store.confirm(mutation, Ok(Confirmation::Accepted)).expect_err("no id");
        assert!(matches!(err, SyncError::Protocol(_)));
        assert_eq!(store.schedules(), &before[..]);
    }

    #[test]
    fn toggle_keeps_single_current_schedule() {
        let (api, mut store) = seeded();
        let ids: Vec<ScheduleId> = store.schedules().iter().filter_map(|s| s.id).collect();

        for (i, id) in ids.iter().cycle().take(7).enumerate() {
            let target = store.get(*id).cloned().expect("cached");
            if i == 4 {
                api.fail_next(MockFailure::Unreachable);
                assert!(store.toggle_active(&api, &target, true).is_err());
            } else {
                store.toggle_active(&api, &target, i % 3 != 2).expect("toggle");
            }
            assert!(current_count(&store) <= 1);
            assert!(store.schedules().iter().filter(|s| s.selected).count() <= 1);
        }
    }

    #[test]
    fn toggle_deselects_previous_schedule() {
        let (api, mut store) = seeded();
        let weekend = store.schedules()[1].clone();

        store.toggle_active(&api, &weekend, true).expect("toggle");

        let weekdays = &store.schedules()[0];
        assert!(!weekdays.selected && !weekdays.active);
        assert_eq!(store.selected().map(|s| s.name.as_str()), Some("Weekend"));
        assert_eq!(current_count(&store), 1);
    }

    #[test]
    fn failed_toggle_leaves_selection() {
        let (api, mut store) = seeded();
        let before = store.schedules().to_vec();
        let weekend = store.schedules()[1].clone();
        api.fail_next(MockFailure::Rejected(409));

        assert!(store.toggle_active(&api, &weekend, true).is_err());
        assert_eq!(store.schedules(), &before[..]);
    }

    #[test]
    fn unsaved_schedule_cannot_be_toggled_or_deleted() {
        let (api, mut store) = seeded();
        let draft = daytime_schedule("Draft", &[1]);
        assert!(matches!(store.toggle_active(&api, &draft, true), Err(SyncError::NotPersisted)));
        assert!(matches!(store.delete(&api, &draft), Err(SyncError::NotPersisted)));
    }

    #[test]
    fn failed_delete_keeps_schedule() {
        let (api, mut store) = seeded();
        let before = store.schedules().to_vec();
        let target = before[2].clone();
        api.fail_next(MockFailure::Unreachable);

        let err = store.delete(&api, &target).expect_err("offline");
        assert!(err.is_transport());
        assert_eq!(store.schedules(), &before[..]);
        assert!(store.get(target.id.expect("id")).is_some());
    }

    #[test]
    fn confirmed_delete_removes_schedule() {
        let (api, mut store) = seeded();
        let target = store.schedules()[2].clone();
        store.delete(&api, &target).expect("delete");
        assert_eq!(store.schedules().len(), 2);
        assert!(store.get(target.id.expect("id")).is_none());
    }

    #[test]
    fn fetch_all_is_idempotent() {
        let (api, mut store) = seeded();
        let first = serde_json::to_vec(store.schedules()).expect("json");
        store.fetch_all(&api).expect("fetch");
        let second = serde_json::to_vec(store.schedules()).expect("json");
        assert_eq!(first, second);
    }

    #[test]
    fn failed_fetch_keeps_previous_collection() {
        let (api, mut store) = seeded();
        let before = store.schedules().to_vec();
        api.fail_next(MockFailure::Rejected(503));
        assert!(store.fetch_all(&api).is_err());
        assert_eq!(store.schedules(), &before[..]);
        assert_eq!(store.fetching().latest(), Some(false));
    }

    #[test]
    fn every_confirmed_change_is_published() {
        let (api, mut store) = seeded();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        store.channel().subscribe(move |s: &Vec<Schedule>| sink.borrow_mut().push(s.len()));

        let target = store.schedules()[0].clone();
        store.upsert(&api, daytime_schedule("Extra", &[5])).expect("create");
        store.toggle_active(&api, &target, false).expect("toggle");
        store.delete(&api, &target).expect("delete");
        api.fail_next(MockFailure::Rejected(500));
        let remaining = store.schedules()[0].clone();
        assert!(store.delete(&api, &remaining).is_err());

        // replayed fetch, create, toggle, delete; the failure publishes nothing
        assert_eq!(*seen.borrow(), vec![3, 4, 4, 3]);
    }

    #[test]
    fn out_of_order_confirmations_apply_in_arrival_order() {
        let (api, mut store) = seeded();
        let mut first = store.schedules()[1].clone();
        first.name = "First edit".into();
        let mut second = first.clone();
        second.name = "Second edit".into();

        let m1 = store.prepare_upsert(first).expect("valid");
        let m2 = store.prepare_upsert(second).expect("valid");
        let r1 = ScheduleStore::dispatch(&api, &m1);
        let r2 = ScheduleStore::dispatch(&api, &m2);
        store.confirm(m2, r2).expect("second");
        store.confirm(m1, r1).expect("first");

        assert_eq!(store.schedules()[1].name, "First edit");
    }

    #[test]
    fn daytime_editing_keeps_order_and_uniqueness() {
        let now = Utc::now();
        let mut s = daytime_schedule("Edit", &[]);
        assert_eq!(add_daytime_input(&mut s, &Utc, "19:30", now), Ok(true));
        assert_eq!(add_daytime_input(&mut s, &Utc, "06:00", now), Ok(true));
        assert_eq!(add_daytime_input(&mut s, &Utc, "19:30", now), Ok(false));
        assert!(add_daytime_input(&mut s, &Utc, "noon", now).is_err());
        assert_eq!(s.daytimes, vec![21_600_000, 70_200_000]);

        assert!(remove_daytime(&mut s, 21_600_000));
        assert!(!remove_daytime(&mut s, 21_600_000));
        assert_eq!(s.daytimes, vec![70_200_000]);

        set_max_times_start_input(&mut s, &Utc, "07:00", now).expect("valid");
        assert_eq!(s.max_times_start_time, Some(25_200_000));
    }
}
