//! Adaptive status polling.
//!
//! Two fetch intervals exist, Normal and Fast; exactly one is active and owns the
//! only live repeating timer. A reading whose container or plate load moved by more
//! than the change threshold switches to Fast. Once Fast readings stay quiet, a
//! one-shot grace timer is armed and switches back to Normal when it expires. A
//! large change during the grace period cancels it.
//!
//! Timers are plain deadlines; the event loop asks for [`StatusSynchronizer::next_deadline`]
//! and calls [`StatusSynchronizer::on_timer`] once it has passed.

use crate::client::{FeederApi, FeederClientError};
use crate::models::feeder::MachineStatus;
use crate::notify::Channel;
use log::{debug, info, warn};
use std::time::{Duration, Instant};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Cadence {
    Normal,
    Fast,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct PollingConfig {
    pub normal: Duration,
    pub fast: Duration,
    /// Grams between two readings that count as a fast change.
    pub change_threshold: f64,
    /// Quiet time required before falling back to Normal.
    pub slow_grace: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        PollingConfig {
            normal: Duration::from_secs(4),
            fast: Duration::from_secs(1),
            change_threshold: 1.0,
            slow_grace: Duration::from_secs(6),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RepeatingTimer {
    period: Duration,
    next_due: Instant,
}

impl RepeatingTimer {
    /// First expiry is immediate, then every `period`.
    fn arm(period: Duration, now: Instant) -> Self {
        RepeatingTimer { period, next_due: now }
    }

    pub fn next_due(&self) -> Instant {
        self.next_due
    }

    fn reschedule(&mut self, now: Instant) {
        self.next_due += self.period;
        if self.next_due <= now {
            self.next_due = now + self.period;
        }
    }
}

#[derive(Debug)]
pub struct FetchInterval {
    pub cadence: Cadence,
    pub interval: Duration,
    pub active: bool,
    timer: Option<RepeatingTimer>,
}

impl FetchInterval {
    fn new(cadence: Cadence, interval: Duration) -> Self {
        FetchInterval {
            cadence,
            interval,
            active: false,
            timer: None,
        }
    }

    pub fn timer(&self) -> Option<&RepeatingTimer> {
        self.timer.as_ref()
    }
}

pub struct StatusSynchronizer {
    config: PollingConfig,
    normal: FetchInterval,
    fast: FetchInterval,
    grace_deadline: Option<Instant>,
    last: Option<MachineStatus>,
    status: Channel<MachineStatus>,
    connected: Channel<bool>,
    loading: Channel<bool>,
}

impl StatusSynchronizer {
    pub fn new(config: PollingConfig) -> Self {
        StatusSynchronizer {
            normal: FetchInterval::new(Cadence::Normal, config.normal),
            fast: FetchInterval::new(Cadence::Fast, config.fast),
            config,
            grace_deadline: None,
            last: None,
            status: Channel::replaying("status"),
            connected: Channel::with_initial("status.connected", true),
            loading: Channel::with_initial("status.loading", false),
        }
    }

    pub fn status(&self) -> &Channel<MachineStatus> {
        &self.status
    }

    pub fn connected(&self) -> &Channel<bool> {
        &self.connected
    }

    pub fn loading(&self) -> &Channel<bool> {
        &self.loading
    }

    pub fn last_status(&self) -> Option<&MachineStatus> {
        self.last.as_ref()
    }

    pub fn interval(&self, cadence: Cadence) -> &FetchInterval {
        match cadence {
            Cadence::Normal => &self.normal,
            Cadence::Fast => &self.fast,
        }
    }

    fn interval_mut(&mut self, cadence: Cadence) -> &mut FetchInterval {
        match cadence {
            Cadence::Normal => &mut self.normal,
            Cadence::Fast => &mut self.fast,
        }
    }

    /// Cadence of the active interval; `None` before [`start`](Self::start).
    pub fn cadence(&self) -> Option<Cadence> {
        [&self.normal, &self.fast].into_iter().find(|i| i.active).map(|i| i.cadence)
    }

    pub fn grace_deadline(&self) -> Option<Instant> {
        self.grace_deadline
    }

    pub fn live_timers(&self) -> usize {
        [&self.normal, &self.fast].into_iter().filter(|i| i.timer.is_some()).count()
    }

    pub fn start(&mut self, now: Instant) {
        self.set_fetching(Cadence::Normal, now);
    }

    /// Make `cadence` the active interval. The previous interval's timer is cancelled
    /// before the new one is armed; the new timer fires immediately.
    pub fn set_fetching(&mut self, cadence: Cadence, now: Instant) -> bool {
        if self.interval(cadence).active {
            return false;
        }

        if let Some(previous) = self.cadence() {
            let prev = self.interval_mut(previous);
            prev.timer = None;
            prev.active = false;
        }

        let target = self.interval_mut(cadence);
        target.timer = Some(RepeatingTimer::arm(target.interval, now));
        target.active = true;
        info!(
            "Status polling switched to {:?} ({:.1}s)",
            cadence,
            target.interval.as_secs_f64()
        );
        true
    }

    /// Earliest pending timer expiry.
    pub fn next_deadline(&self) -> Option<Instant> {
        let active = [&self.normal, &self.fast]
            .into_iter()
            .filter_map(|i| i.timer.as_ref().map(RepeatingTimer::next_due))
            .min();
        match (active, self.grace_deadline) {
            (Some(a), Some(g)) => Some(a.min(g)),
            (a, g) => a.or(g),
        }
    }

    /// Fire every timer that has expired by `now`.
    pub fn on_timer(&mut self, api: &dyn FeederApi, now: Instant) {
        if let Some(deadline) = self.grace_deadline
            && deadline <= now
        {
            self.grace_deadline = None;
            debug!("Grace period elapsed without fast changes");
            self.set_fetching(Cadence::Normal, now);
        }

        let due = match self.cadence() {
            Some(cadence) => match self.interval_mut(cadence).timer.as_mut() {
                Some(timer) if timer.next_due <= now => {
                    timer.reschedule(now);
                    true
                }
                _ => false,
            },
            None => false,
        };
        if due {
            self.poll(api, now);
        }
    }

    /// Fetch one status reading and apply it.
    pub fn poll(&mut self, api: &dyn FeederApi, now: Instant) {
        self.loading.publish(true);
        match api.get_status() {
            Ok(status) => self.apply_status(status, now),
            Err(e) => self.on_fetch_error(&e),
        }
    }

    pub fn apply_status(&mut self, status: MachineStatus, now: Instant) {
        self.adjust_interval(&status, now);
        self.last = Some(status.clone());
        self.status.publish(status);
        self.loading.publish(false);
        self.connected.publish(true);
    }

    fn adjust_interval(&mut self, new: &MachineStatus, now: Instant) {
        let Some(prev) = self.last.as_ref() else {
            return;
        };
        let d_container = new.container_load - prev.container_load;
        let d_plate = new.plate_load - prev.plate_load;
        let threshold = self.config.change_threshold;

        if d_container.abs() > threshold || d_plate.abs() > threshold {
            debug!("Fast change: container {:+.2}, plate {:+.2}", d_container, d_plate);
            self.set_fetching(Cadence::Fast, now);
            if self.grace_deadline.take().is_some() {
                debug!("Pending slow-down cancelled");
            }
        } else if self.fast.active && self.grace_deadline.is_none() {
            self.grace_deadline = Some(now + self.config.slow_grace);
        }
    }

    fn on_fetch_error(&mut self, err: &FeederClientError) {
        if err.is_transport() {
            warn!("Status fetch failed, device unreachable: {}", err);
            self.connected.publish(false);
        } else {
            warn!("Status fetch failed: {}", err);
        }
        self.loading.publish(false);
    }

    pub fn mark_disconnected(&self) {
        self.connected.publish(false);
    }

    /// Forward a snapshot that arrived outside the polling loop.
    pub fn relay(&self, status: MachineStatus) {
        self.status.publish(status);
    }

    pub fn start_feed(&self, api: &dyn FeederApi) -> Result<(), FeederClientError> {
        info!("Start feeding...");
        api.open_food().inspect_err(|e| warn!("Opening the gate failed: {}", e))
    }

    pub fn stop_feed(&self, api: &dyn FeederApi) -> Result<(), FeederClientError> {
        info!("...feeding stopped.");
        api.close_food().inspect_err(|e| warn!("Closing the gate failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::mock::{MockFailure, MockFeeder};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn reading(container: f64, plate: f64) -> MachineStatus {
        MachineStatus {
            container_load: container,
            plate_load: plate,
            ..MachineStatus::default()
        }
    }

    /// Jump from deadline to deadline until `until`, recording the cadence after each step.
    fn run_until(
        sync: &mut StatusSynchronizer,
        api: &MockFeeder,
        start: Instant,
        until: Duration,
    ) -> Vec<(Duration, Option<Cadence>)> {
        let mut trace = Vec::new();
        while let Some(deadline) = sync.next_deadline() {
            if deadline > start + until {
                break;
            }
            sync.on_timer(api, deadline);
            trace.push((deadline - start, sync.cadence()));
            assert!(sync.live_timers() <= 1);
        }
        trace
    }

    #[test]
    fn starts_in_normal_with_immediate_fetch() {
        let api = MockFeeder::new(9);
        let mut sync = StatusSynchronizer::new(PollingConfig::default());
        let t0 = Instant::now();
        assert_eq!(sync.cadence(), None);
        sync.start(t0);
        assert_eq!(sync.cadence(), Some(Cadence::Normal));
        assert_eq!(sync.next_deadline(), Some(t0));

        sync.on_timer(&api, t0);
        assert!(sync.last_status().is_some());
        assert_eq!(sync.next_deadline(), Some(t0 + Duration::from_secs(4)));
        assert_eq!(sync.loading().latest(), Some(false));
    }

    #[test]
    fn speeds_up_on_change_and_slows_down_after_grace() {
        let api = MockFeeder::new(9);
        api.script_status([10.0, 10.0, 12.0, 12.0, 12.0, 12.0, 12.0].map(|c| reading(c, 0.0)));
        let mut sync = StatusSynchronizer::new(PollingConfig::default());
        let t0 = Instant::now();
        sync.start(t0);

        let trace = run_until(&mut sync, &api, t0, Duration::from_secs(20));
        let secs = |s: u64| Duration::from_secs(s);

        // readings at 0s and 4s are quiet, the third (8s) jumps by 2g
        assert_eq!(trace[0], (secs(0), Some(Cadence::Normal)));
        assert_eq!(trace[1], (secs(4), Some(Cadence::Normal)));
        assert_eq!(trace[2], (secs(8), Some(Cadence::Fast)));
        // fast polling fetches immediately, then once per second
        assert_eq!(trace[3], (secs(8), Some(Cadence::Fast)));
        assert_eq!(trace[4], (secs(9), Some(Cadence::Fast)));
        // the first quiet fast reading (8s) armed the grace timer for 14s
        let first_normal_after_fast = trace
            .iter()
            .skip(2)
            .find(|(_, c)| *c == Some(Cadence::Normal))
            .map(|(at, _)| *at);
        assert_eq!(first_normal_after_fast, Some(secs(14)));
        assert_eq!(sync.cadence(), Some(Cadence::Normal));
        assert_eq!(sync.grace_deadline(), None);
    }

    #[test]
    fn change_during_grace_cancels_slow_down() {
        let api = MockFeeder::new(9);
        let mut sync = StatusSynchronizer::new(PollingConfig::default());
        let t0 = Instant::now();
        sync.start(t0);
        sync.apply_status(reading(100.0, 0.0), t0);
        sync.apply_status(reading(90.0, 0.0), t0 + Duration::from_secs(1));
        sync.apply_status(reading(90.0, 0.0), t0 + Duration::from_secs(2));
        assert_eq!(sync.grace_deadline(), Some(t0 + Duration::from_secs(8)));

        sync.apply_status(reading(90.0, 5.0), t0 + Duration::from_secs(3));
        assert_eq!(sync.grace_deadline(), None);
        assert_eq!(sync.cadence(), Some(Cadence::Fast));

        // nothing fires at the old grace deadline
        sync.on_timer(&api, t0 + Duration::from_secs(8));
        assert_eq!(sync.cadence(), Some(Cadence::Fast));
    }

    #[test]
    fn fast_iff_recent_large_delta_without_elapsed_grace() {
        let api = MockFeeder::new(9);
        let loads = [5.0, 5.5, 9.0, 9.2, 9.2, 9.1, 9.1, 9.1, 9.1, 9.1, 9.1, 20.0, 20.0, 20.0, 20.0, 20.0, 20.0, 20.0, 20.0];
        api.script_status(loads.map(|c| reading(c, 1.0)));
        let config = PollingConfig::default();
        let mut sync = StatusSynchronizer::new(config);
        let t0 = Instant::now();
        sync.start(t0);

        let mut last_big: Option<Duration> = None;
        let mut prev: Option<f64> = None;
        while let Some(deadline) = sync.next_deadline() {
            if deadline > t0 + Duration::from_secs(60) {
                break;
            }
            let grace_fires = sync.grace_deadline().is_some_and(|g| g <= deadline);
            let polls = sync
                .cadence()
                .map(|c| sync.interval(c).timer().is_some_and(|t| t.next_due() <= deadline))
                .unwrap_or(false);
            sync.on_timer(&api, deadline);
            if polls || grace_fires {
                if grace_fires {
                    last_big = None;
                }
                let cur = sync.last_status().map(|s| s.container_load);
                if let (Some(p), Some(c)) = (prev, cur)
                    && (c - p).abs() > config.change_threshold
                {
                    last_big = Some(deadline - t0);
                }
                prev = cur;
            }
            assert_eq!(sync.cadence() == Some(Cadence::Fast), last_big.is_some(), "at {:?}", deadline - t0);
        }
    }

    #[test]
    fn switching_to_active_interval_is_a_noop() {
        let mut sync = StatusSynchronizer::new(PollingConfig::default());
        let t0 = Instant::now();
        sync.start(t0);
        assert!(!sync.set_fetching(Cadence::Normal, t0 + Duration::from_secs(1)));
        assert_eq!(sync.next_deadline(), Some(t0));
        assert!(sync.set_fetching(Cadence::Fast, t0));
        assert!(!sync.interval(Cadence::Normal).active);
        assert!(sync.interval(Cadence::Normal).timer().is_none());
        assert_eq!(sync.live_timers(), 1);
    }

    #[test]
    fn transport_failure_flips_connectivity() {
        let api = MockFeeder::new(9);
        let mut sync = StatusSynchronizer::new(PollingConfig::default());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        sync.connected().subscribe(move |c: &bool| sink.borrow_mut().push(*c));

        let t0 = Instant::now();
        sync.start(t0);
        api.fail_next(MockFailure::Unreachable);
        sync.on_timer(&api, t0);
        assert_eq!(sync.loading().latest(), Some(false));

        // the next tick is the retry
        let next = sync.next_deadline().expect("timer");
        sync.on_timer(&api, next);
        assert_eq!(*seen.borrow(), vec![true, false, true]);
    }

    #[test]
    fn http_error_keeps_connectivity() {
        let api = MockFeeder::new(9);
        let mut sync = StatusSynchronizer::new(PollingConfig::default());
        let t0 = Instant::now();
        sync.start(t0);
        api.fail_next(MockFailure::Rejected(500));
        sync.on_timer(&api, t0);
        assert_eq!(sync.connected().latest(), Some(true));
        assert!(sync.last_status().is_none());
    }

    #[test]
    fn relayed_status_is_published_without_changing_cadence() {
        let mut sync = StatusSynchronizer::new(PollingConfig::default());
        let t0 = Instant::now();
        sync.start(t0);
        sync.apply_status(reading(10.0, 0.0), t0);
        sync.relay(reading(500.0, 0.0));
        assert_eq!(sync.status().latest().map(|s| s.container_load), Some(500.0));
        assert_eq!(sync.cadence(), Some(Cadence::Normal));
        assert_eq!(sync.last_status().map(|s| s.container_load), Some(10.0));
    }

    #[test]
    fn feed_commands_reach_the_device() {
        let api = MockFeeder::new(9);
        let sync = StatusSynchronizer::new(PollingConfig::default());
        sync.start_feed(&api).expect("open");
        assert!(api.gate_open());
        sync.stop_feed(&api).expect("close");
        assert!(!api.gate_open());
    }
}
