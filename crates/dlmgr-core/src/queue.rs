//! Named queues with per-queue/global concurrency caps and minute-resolution
//! time-window scheduling (§4.3).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Name of the always-present, deletion-protected default queue.
pub const MAIN_QUEUE: &str = "Main";

/// Day of the week, used by a queue's periodic schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Weekday {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

/// A wall-clock time of day, minute resolution (no timezone — matched
/// against local time the same way the original queue manager compared
/// `datetime.hour`/`datetime.minute`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Self {
        Self { hour, minute }
    }

    fn matches(&self, hour: u32, minute: u32) -> bool {
        self.hour as u32 == hour && self.minute as u32 == minute
    }
}

/// A queue's optional start/stop time-window schedule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Schedule {
    pub enabled: bool,
    pub start: Option<TimeOfDay>,
    pub stop: Option<TimeOfDay>,
    /// Weekdays the schedule repeats on. Empty means every day.
    pub periodic: Vec<Weekday>,
}

impl Schedule {
    fn active_today(&self, today: Weekday) -> bool {
        self.periodic.is_empty() || self.periodic.contains(&today)
    }
}

/// `{ name, max_concurrent, schedule }` (§3 "Queue descriptor").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueDescriptor {
    pub name: String,
    pub max_concurrent: usize,
    #[serde(default)]
    pub schedule: Schedule,
}

impl QueueDescriptor {
    /// The default "Main" queue created on first run (§4.3 Defaults).
    pub fn default_main() -> Self {
        Self {
            name: MAIN_QUEUE.to_string(),
            max_concurrent: 3,
            schedule: Schedule::default(),
        }
    }
}

/// Runtime in-flight counters for one queue. Not persisted; rebuilt from the
/// registry at startup.
#[derive(Default)]
struct QueueState {
    active: bool,
    in_flight: AtomicUsize,
}

/// Owns the set of active queues, the global in-flight count, and per-queue
/// schedules (§4.3 Contract). Dispatch decisions (which pending items to
/// start) are made by the caller via `admit`; this type only enforces the
/// concurrency invariants and active/inactive state.
pub struct QueueScheduler {
    global_max: AtomicUsize,
    global_in_flight: AtomicUsize,
    queues: Mutex<HashMap<String, QueueDescriptor>>,
    states: Mutex<HashMap<String, QueueState>>,
}

impl QueueScheduler {
    /// Builds a scheduler from a loaded `queues` map (config.json) and the
    /// global concurrency cap (`max_concurrent_downloads`).
    pub fn new(queues: HashMap<String, QueueDescriptor>, global_max: usize) -> Self {
        let states = queues
            .keys()
            .map(|name| (name.clone(), QueueState::default()))
            .collect();
        Self {
            global_max: AtomicUsize::new(global_max.max(1)),
            global_in_flight: AtomicUsize::new(0),
            queues: Mutex::new(queues),
            states: Mutex::new(states),
        }
    }

    /// Marks a queue active. Returns `false` if the queue doesn't exist.
    pub fn start_queue(&self, name: &str) -> bool {
        let mut states = self.states.lock().unwrap();
        match states.get_mut(name) {
            Some(s) => {
                s.active = true;
                true
            }
            None => false,
        }
    }

    /// Marks a queue inactive. Does not interrupt in-flight items.
    pub fn stop_queue(&self, name: &str) {
        if let Some(s) = self.states.lock().unwrap().get_mut(name) {
            s.active = false;
        }
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.states.lock().unwrap().get(name).map(|s| s.active).unwrap_or(false)
    }

    /// Number of pending-item slots this queue may admit right now:
    /// `min(queue.max_concurrent - queue.in_flight, global.max_concurrent -
    /// global.in_flight)`, or 0 if the queue is inactive or unknown.
    pub fn admit(&self, name: &str) -> usize {
        if !self.is_active(name) {
            return 0;
        }
        let queues = self.queues.lock().unwrap();
        let descriptor = match queues.get(name) {
            Some(d) => d,
            None => return 0,
        };
        let states = self.states.lock().unwrap();
        let queue_in_flight = states.get(name).map(|s| s.in_flight.load(Ordering::Relaxed)).unwrap_or(0);
        let queue_room = descriptor.max_concurrent.saturating_sub(queue_in_flight);

        let global_in_flight = self.global_in_flight.load(Ordering::Relaxed);
        let global_max = self.global_max.load(Ordering::Relaxed);
        let global_room = global_max.saturating_sub(global_in_flight);

        queue_room.min(global_room)
    }

    /// Records that `count` items in `name` started running.
    pub fn mark_started(&self, name: &str, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(s) = self.states.lock().unwrap().get_mut(name) {
            s.in_flight.fetch_add(count, Ordering::Relaxed);
        }
        self.global_in_flight.fetch_add(count, Ordering::Relaxed);
    }

    /// `on_item_complete`: decrements counters for one finished item in `name`.
    /// Returns the number of new slots the caller should try to dispatch
    /// into (0 if the queue is no longer active).
    pub fn on_item_complete(&self, name: &str) -> usize {
        if let Some(s) = self.states.lock().unwrap().get_mut(name) {
            s.in_flight.fetch_sub(1.min(s.in_flight.load(Ordering::Relaxed)), Ordering::Relaxed);
        }
        self.global_in_flight.fetch_sub(1.min(self.global_in_flight.load(Ordering::Relaxed)), Ordering::Relaxed);
        self.admit(name)
    }

    pub fn global_in_flight(&self) -> usize {
        self.global_in_flight.load(Ordering::Relaxed)
    }

    pub fn queue_in_flight(&self, name: &str) -> usize {
        self.states.lock().unwrap().get(name).map(|s| s.in_flight.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub fn descriptor(&self, name: &str) -> Option<QueueDescriptor> {
        self.queues.lock().unwrap().get(name).cloned()
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues.lock().unwrap().keys().cloned().collect()
    }

    pub fn upsert_queue(&self, descriptor: QueueDescriptor) {
        let name = descriptor.name.clone();
        self.queues.lock().unwrap().insert(name.clone(), descriptor);
        self.states.lock().unwrap().entry(name).or_insert_with(QueueState::default);
    }

    /// Deletes a queue unless it's the deletion-protected default.
    pub fn delete_queue(&self, name: &str) -> bool {
        if name == MAIN_QUEUE {
            return false;
        }
        self.queues.lock().unwrap().remove(name);
        self.states.lock().unwrap().remove(name);
        true
    }

    /// Checks every queue's schedule against the given minute-resolution
    /// wall-clock time and weekday, starting/stopping queues whose tick
    /// matches (§4.3 "Scheduling semantics"). Intended to be called once per
    /// minute by the async scheduler loop; a missed tick is simply never
    /// replayed.
    pub fn check_schedule(&self, hour: u32, minute: u32, today: Weekday) -> Vec<ScheduleAction> {
        let queues = self.queues.lock().unwrap();
        let mut actions = Vec::new();
        for (name, descriptor) in queues.iter() {
            let sched = &descriptor.schedule;
            if !sched.enabled || !sched.active_today(today) {
                continue;
            }
            if let Some(start) = sched.start {
                if start.matches(hour, minute) {
                    actions.push(ScheduleAction::Start(name.clone()));
                }
            }
            if let Some(stop) = sched.stop {
                if stop.matches(hour, minute) {
                    actions.push(ScheduleAction::Stop(name.clone()));
                }
            }
        }
        actions
    }
}

/// An action `check_schedule` determined should happen this minute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleAction {
    Start(String),
    Stop(String),
}

/// Wall-clock `(hour, minute, weekday)` in local time, for feeding
/// `check_schedule` from a periodic tick. Unix only; `libc::localtime_r` is
/// already a direct dependency for process-group signaling elsewhere.
#[cfg(unix)]
pub fn local_now() -> (u32, u32, Weekday) {
    unsafe {
        let t: libc::time_t = libc::time(std::ptr::null_mut());
        let mut tmv: libc::tm = std::mem::zeroed();
        libc::localtime_r(&t, &mut tmv);
        let weekday = match tmv.tm_wday {
            0 => Weekday::Sun,
            1 => Weekday::Mon,
            2 => Weekday::Tue,
            3 => Weekday::Wed,
            4 => Weekday::Thu,
            5 => Weekday::Fri,
            _ => Weekday::Sat,
        };
        (tmv.tm_hour as u32, tmv.tm_min as u32, weekday)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, max_concurrent: usize) -> QueueDescriptor {
        QueueDescriptor { name: name.to_string(), max_concurrent, schedule: Schedule::default() }
    }

    #[test]
    fn default_main_is_deletion_protected() {
        let mut queues = HashMap::new();
        queues.insert(MAIN_QUEUE.to_string(), QueueDescriptor::default_main());
        let sched = QueueScheduler::new(queues, 3);
        assert!(!sched.delete_queue(MAIN_QUEUE));
        assert!(sched.descriptor(MAIN_QUEUE).is_some());
    }

    #[test]
    fn admit_respects_queue_and_global_caps() {
        let mut queues = HashMap::new();
        queues.insert("Q1".to_string(), descriptor("Q1", 2));
        queues.insert("Q2".to_string(), descriptor("Q2", 2));
        let sched = QueueScheduler::new(queues, 3);
        sched.start_queue("Q1");
        sched.start_queue("Q2");

        // Q1 cap 2, global cap 3: admits min(2, 3) = 2.
        assert_eq!(sched.admit("Q1"), 2);
        sched.mark_started("Q1", 2);
        // Global now at 2/3: Q2 can admit min(2, 1) = 1.
        assert_eq!(sched.admit("Q2"), 1);
    }

    #[test]
    fn inactive_queue_admits_nothing() {
        let mut queues = HashMap::new();
        queues.insert("Q1".to_string(), descriptor("Q1", 5));
        let sched = QueueScheduler::new(queues, 5);
        assert_eq!(sched.admit("Q1"), 0);
    }

    #[test]
    fn on_item_complete_frees_a_slot() {
        let mut queues = HashMap::new();
        queues.insert("Q1".to_string(), descriptor("Q1", 1));
        let sched = QueueScheduler::new(queues, 1);
        sched.start_queue("Q1");
        sched.mark_started("Q1", 1);
        assert_eq!(sched.admit("Q1"), 0);
        let freed = sched.on_item_complete("Q1");
        assert_eq!(freed, 1);
        assert_eq!(sched.global_in_flight(), 0);
    }

    #[test]
    fn stop_queue_does_not_reduce_in_flight() {
        let mut queues = HashMap::new();
        queues.insert("Q1".to_string(), descriptor("Q1", 2));
        let sched = QueueScheduler::new(queues, 2);
        sched.start_queue("Q1");
        sched.mark_started("Q1", 2);
        sched.stop_queue("Q1");
        assert_eq!(sched.queue_in_flight("Q1"), 2);
        assert_eq!(sched.admit("Q1"), 0);
    }

    #[test]
    fn check_schedule_fires_only_on_matching_minute() {
        let mut queues = HashMap::new();
        let mut d = descriptor("Q1", 2);
        d.schedule = Schedule {
            enabled: true,
            start: Some(TimeOfDay::new(9, 0)),
            stop: Some(TimeOfDay::new(17, 30)),
            periodic: vec![],
        };
        queues.insert("Q1".to_string(), d);
        let sched = QueueScheduler::new(queues, 3);

        assert!(sched.check_schedule(8, 59, Weekday::Mon).is_empty());
        assert_eq!(sched.check_schedule(9, 0, Weekday::Mon), vec![ScheduleAction::Start("Q1".to_string())]);
        assert_eq!(sched.check_schedule(17, 30, Weekday::Mon), vec![ScheduleAction::Stop("Q1".to_string())]);
    }

    #[test]
    fn check_schedule_respects_periodic_weekdays() {
        let mut queues = HashMap::new();
        let mut d = descriptor("Q1", 2);
        d.schedule = Schedule {
            enabled: true,
            start: Some(TimeOfDay::new(9, 0)),
            stop: None,
            periodic: vec![Weekday::Sat, Weekday::Sun],
        };
        queues.insert("Q1".to_string(), d);
        let sched = QueueScheduler::new(queues, 3);

        assert!(sched.check_schedule(9, 0, Weekday::Mon).is_empty());
        assert_eq!(sched.check_schedule(9, 0, Weekday::Sat), vec![ScheduleAction::Start("Q1".to_string())]);
    }

    #[test]
    fn scenario_d_two_queues_global_cap_three() {
        // Q1 cap 2, Q2 cap 2, global cap 3. Starting both with 3 pending in Q1
        // and 2 pending in Q2 admits exactly 3 total (2 from Q1, 1 from Q2).
        let mut queues = HashMap::new();
        queues.insert("Q1".to_string(), descriptor("Q1", 2));
        queues.insert("Q2".to_string(), descriptor("Q2", 2));
        let sched = QueueScheduler::new(queues, 3);
        sched.start_queue("Q1");
        sched.start_queue("Q2");

        let q1_admit = sched.admit("Q1").min(3);
        sched.mark_started("Q1", q1_admit);
        let q2_admit = sched.admit("Q2").min(2);
        sched.mark_started("Q2", q2_admit);

        assert_eq!(q1_admit, 2);
        assert_eq!(q2_admit, 1);
        assert_eq!(sched.global_in_flight(), 3);
    }
}
