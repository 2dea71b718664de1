//! Nightly calibration task list.

use std::{collections::HashMap, fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::sequence::CalibrationSequence;
use crate::{config::CalibrationsConfig, ephemeris::Ephemeris, module::NightId};

/// Event a task window is measured from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anchor {
    /// Sunset.
    #[default]
    Sunset,
    /// Sunrise.
    Sunrise,
    /// End of evening twilight.
    EveningTwilight,
    /// Start of morning twilight.
    MorningTwilight,
}

impl Anchor {
    /// The anchor's time in `ephemeris`.
    #[must_use]
    pub const fn time(self, ephemeris: &Ephemeris) -> DateTime<Utc> {
        match self {
            Self::Sunset => ephemeris.sunset,
            Self::Sunrise => ephemeris.sunrise,
            Self::EveningTwilight => ephemeris.evening_twilight,
            Self::MorningTwilight => ephemeris.morning_twilight,
        }
    }
}

/// A named sequence from `[calibrations.sequences]` or an inline one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SequenceRef {
    /// Name of a configured sequence.
    Named(String),
    /// Sequence given in place.
    Inline(CalibrationSequence),
}

/// Built-in day recipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayRecipe {
    /// Device pings and a bias before the night.
    PreObserving,
    /// Dome and park checks after the night, then calibration recovery.
    PostObserving,
}

impl DayRecipe {
    /// Task name of the recipe.
    #[must_use]
    pub const fn task_name(self) -> &'static str {
        match self {
            Self::PreObserving => "pre_observing",
            Self::PostObserving => "post_observing",
        }
    }
}

const fn one() -> u32 {
    1
}

const fn enabled() -> bool {
    true
}

const fn default_duration() -> f64 {
    600.0
}

/// A calibration task as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Unique task name.
    pub name: String,
    /// Sequence to run.
    #[serde(default)]
    pub sequence: Option<SequenceRef>,
    /// Built-in recipe to run instead of a sequence.
    #[serde(default)]
    pub recipe: Option<DayRecipe>,
    /// Window anchor.
    #[serde(default)]
    pub anchor: Anchor,
    /// Earliest start, minutes from the anchor.
    #[serde(default)]
    pub start_offset: f64,
    /// Latest start, minutes from the anchor.
    #[serde(default)]
    pub max_start_offset: Option<f64>,
    /// Task that must be done first.
    #[serde(default)]
    pub after: Option<String>,
    /// The task needs the dome and pauses observing.
    #[serde(default, rename = "dome", alias = "requires_dome")]
    pub requires_dome: bool,
    /// Close the dome once the task finishes.
    #[serde(default)]
    pub close_dome_after: bool,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
    /// Expected run time in seconds.
    #[serde(default = "default_duration")]
    pub estimated_duration: f64,
    /// Run every N nights.
    #[serde(default = "one")]
    pub cadence_nights: u32,
    /// Failed runs may be retried by the post-observing recipe.
    #[serde(default)]
    pub allow_post_observing_recovery: bool,
    /// Disabled tasks are listed but never run.
    #[serde(default = "enabled")]
    pub enabled: bool,
}

impl TaskDefinition {
    fn builtin(recipe: DayRecipe) -> Self {
        let (anchor, start_offset, max_start_offset) = match recipe {
            DayRecipe::PreObserving => (Anchor::Sunset, -30.0, -10.0),
            DayRecipe::PostObserving => (Anchor::MorningTwilight, 15.0, 30.0),
        };
        Self {
            name: recipe.task_name().to_string(),
            sequence: None,
            recipe: Some(recipe),
            anchor,
            start_offset,
            max_start_offset: Some(max_start_offset),
            after: None,
            requires_dome: false,
            close_dome_after: false,
            priority: 100,
            estimated_duration: 300.0,
            cadence_nights: 1,
            allow_post_observing_recovery: false,
            enabled: true,
        }
    }

    /// Whether `name` is one of the built-in day tasks.
    #[must_use]
    pub fn is_builtin(name: &str) -> bool {
        [DayRecipe::PreObserving, DayRecipe::PostObserving]
            .iter()
            .any(|recipe| recipe.task_name() == name)
    }
}

/// What a task runs.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    /// A calibration sequence.
    Sequence(SequenceRef),
    /// The pre-observing day recipe.
    PreObserving,
    /// The post-observing day recipe.
    PostObserving,
}

/// Status of a task within the night.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its window, dependency or backoff.
    Pending,
    /// Eligible to run.
    Ready,
    /// Running.
    Running,
    /// Completed.
    Done,
    /// Out of retries.
    Failed,
    /// Window missed, or not due this night.
    Skipped,
    /// Disabled in configuration.
    Disabled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Disabled => "disabled",
        };
        f.write_str(label)
    }
}

/// A task scheduled for the current night.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTask {
    /// Task name.
    pub name: String,
    /// What runs.
    pub kind: TaskKind,
    /// Start of the window.
    pub earliest_start: DateTime<Utc>,
    /// End of the window.
    pub latest_start: Option<DateTime<Utc>>,
    /// Prerequisite task.
    pub after: Option<String>,
    /// Expected run time.
    pub estimated_duration: Duration,
    /// Needs the dome.
    pub requires_dome: bool,
    /// Close the dome afterwards.
    pub close_dome_after: bool,
    /// Higher runs first.
    pub priority: i32,
    /// Current status.
    pub status: TaskStatus,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Not eligible again before this time.
    pub backoff_until: Option<DateTime<Utc>>,
    /// Eligible for post-observing recovery.
    pub allow_post_observing_recovery: bool,
}

/// Scheduler misuse.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScheduleError {
    /// No task with this name tonight.
    #[error("unknown calibration task '{0}'")]
    UnknownTask(String),
    /// The task is not in a state that allows the change.
    #[error("task '{task}' cannot go from {from} to {to}")]
    InvalidTransition {
        /// Task name.
        task: String,
        /// Current status.
        from: TaskStatus,
        /// Requested status.
        to: TaskStatus,
    },
    /// The latest start passed before the task could start.
    #[error("task '{task}' missed its window (latest start {latest})")]
    WindowClosed {
        /// Task name.
        task: String,
        /// End of the window.
        latest: DateTime<Utc>,
    },
    /// Another task of the same sub-schedule is running.
    #[error("task '{task}' would run alongside '{running}'")]
    SubScheduleBusy {
        /// Task name.
        task: String,
        /// Task already running.
        running: String,
    },
}

fn minutes(offset: f64) -> chrono::Duration {
    #[allow(clippy::cast_possible_truncation)]
    chrono::Duration::milliseconds((offset * 60_000.0).round() as i64)
}

/// Builds and advances the task list of the current night.
///
/// Dome and no-dome tasks form two sub-schedules: each runs at most one task
/// at a time and neither blocks the other.
#[derive(Debug, Clone)]
pub struct CalibrationScheduler {
    config: CalibrationsConfig,
    night: Option<NightId>,
    tasks: Vec<CalibrationTask>,
    last_done: HashMap<String, NightId>,
}

impl CalibrationScheduler {
    /// Scheduler for `config`.
    #[must_use]
    pub fn new(config: CalibrationsConfig) -> Self {
        Self {
            config,
            night: None,
            tasks: Vec::new(),
            last_done: HashMap::new(),
        }
    }

    /// Replaces the configuration. Definitions apply from the next night;
    /// retry settings apply immediately.
    pub fn set_config(&mut self, config: CalibrationsConfig) {
        self.config = config;
    }

    /// Night of the current list.
    #[must_use]
    pub const fn night(&self) -> Option<NightId> {
        self.night
    }

    /// Tasks of the current night.
    #[must_use]
    pub fn tasks(&self) -> &[CalibrationTask] {
        &self.tasks
    }

    /// Looks a task up by name.
    #[must_use]
    pub fn task(&self, name: &str) -> Option<&CalibrationTask> {
        self.tasks.iter().find(|task| task.name == name)
    }

    /// Rebuilds the list for `ephemeris.night`. Returns `false` without
    /// touching anything when the night has not changed.
    pub fn refresh(&mut self, ephemeris: &Ephemeris) -> bool {
        let night = ephemeris.night;
        if self.night == Some(night) {
            return false;
        }
        let builtins = [DayRecipe::PreObserving, DayRecipe::PostObserving]
            .into_iter()
            .filter(|_| self.config.day_tasks)
            .map(TaskDefinition::builtin);
        let definitions: Vec<TaskDefinition> =
            builtins.chain(self.config.tasks.iter().cloned()).collect();
        self.tasks = definitions
            .iter()
            .filter_map(|definition| self.build(definition, ephemeris))
            .collect();
        self.night = Some(night);
        tracing::info!(night = %night, tasks = self.tasks.len(), "calibration schedule rebuilt");
        true
    }

    fn build(&self, definition: &TaskDefinition, ephemeris: &Ephemeris) -> Option<CalibrationTask> {
        let kind = match (&definition.recipe, &definition.sequence) {
            (Some(DayRecipe::PreObserving), _) => TaskKind::PreObserving,
            (Some(DayRecipe::PostObserving), _) => TaskKind::PostObserving,
            (None, Some(sequence)) => TaskKind::Sequence(sequence.clone()),
            (None, None) => {
                tracing::warn!(task = %definition.name, "task has nothing to run");
                return None;
            }
        };
        let due = self.last_done.get(&definition.name).map_or(true, |last| {
            ephemeris.night.nights_since(*last) >= i64::from(definition.cadence_nights)
        });
        let status = if !definition.enabled {
            TaskStatus::Disabled
        } else if due {
            TaskStatus::Pending
        } else {
            TaskStatus::Skipped
        };
        let anchor = definition.anchor.time(ephemeris);
        Some(CalibrationTask {
            name: definition.name.clone(),
            kind,
            earliest_start: anchor + minutes(definition.start_offset),
            latest_start: definition
                .max_start_offset
                .map(|offset| anchor + minutes(offset)),
            after: definition.after.clone(),
            estimated_duration: crate::config::secs(definition.estimated_duration),
            requires_dome: definition.requires_dome,
            close_dome_after: definition.close_dome_after,
            priority: definition.priority,
            status,
            retry_count: 0,
            backoff_until: None,
            allow_post_observing_recovery: definition.allow_post_observing_recovery,
        })
    }

    /// Moves tasks between `Pending`, `Ready` and `Skipped` for `now`.
    pub fn update(&mut self, now: DateTime<Utc>) {
        let done: Vec<String> = self
            .tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Done)
            .map(|task| task.name.clone())
            .collect();
        for task in &mut self.tasks {
            if !matches!(task.status, TaskStatus::Pending | TaskStatus::Ready) {
                continue;
            }
            if task.latest_start.is_some_and(|latest| now > latest) {
                tracing::info!(task = %task.name, "calibration window missed");
                task.status = TaskStatus::Skipped;
                continue;
            }
            let in_window = now >= task.earliest_start;
            let backed_off = task.backoff_until.is_some_and(|until| now < until);
            let dependency_met = task.after.as_ref().map_or(true, |after| done.contains(after));
            if task.status == TaskStatus::Pending && in_window && !backed_off && dependency_met {
                task.status = TaskStatus::Ready;
            }
        }
    }

    fn running_in(&self, requires_dome: bool) -> Option<&CalibrationTask> {
        self.tasks
            .iter()
            .find(|task| task.status == TaskStatus::Running && task.requires_dome == requires_dome)
    }

    /// Highest-priority ready task of either idle sub-schedule, ties broken by
    /// earliest start.
    pub fn next_ready(&mut self, now: DateTime<Utc>) -> Option<CalibrationTask> {
        self.update(now);
        let idle = |dome: bool| self.running_in(dome).is_none();
        let (dome_idle, open_idle) = (idle(true), idle(false));
        self.tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Ready)
            .filter(|task| if task.requires_dome { dome_idle } else { open_idle })
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.earliest_start.cmp(&b.earliest_start))
            })
            .cloned()
    }

    /// Like [`Self::next_ready`], restricted to one sub-schedule.
    pub fn next_ready_for(
        &mut self,
        now: DateTime<Utc>,
        requires_dome: bool,
    ) -> Option<CalibrationTask> {
        self.update(now);
        if self.running_in(requires_dome).is_some() {
            return None;
        }
        self.tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Ready && task.requires_dome == requires_dome)
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.earliest_start.cmp(&b.earliest_start))
            })
            .cloned()
    }

    fn task_mut(&mut self, name: &str) -> Result<&mut CalibrationTask, ScheduleError> {
        self.tasks
            .iter_mut()
            .find(|task| task.name == name)
            .ok_or_else(|| ScheduleError::UnknownTask(name.to_string()))
    }

    fn transition(
        task: &mut CalibrationTask,
        allowed: &[TaskStatus],
        to: TaskStatus,
    ) -> Result<(), ScheduleError> {
        if !allowed.contains(&task.status) {
            return Err(ScheduleError::InvalidTransition {
                task: task.name.clone(),
                from: task.status,
                to,
            });
        }
        task.status = to;
        Ok(())
    }

    /// Marks a ready task as running. The window is checked again against
    /// `now`: a task whose latest start has passed becomes `Skipped` instead.
    pub fn mark_running(&mut self, name: &str, now: DateTime<Utc>) -> Result<(), ScheduleError> {
        self.update(now);
        let task = self
            .task(name)
            .ok_or_else(|| ScheduleError::UnknownTask(name.to_string()))?;
        if let Some(latest) = task.latest_start.filter(|latest| now > *latest) {
            return Err(ScheduleError::WindowClosed {
                task: name.to_string(),
                latest,
            });
        }
        let requires_dome = task.requires_dome;
        if let Some(running) = self.running_in(requires_dome) {
            return Err(ScheduleError::SubScheduleBusy {
                task: name.to_string(),
                running: running.name.clone(),
            });
        }
        let task = self.task_mut(name)?;
        Self::transition(task, &[TaskStatus::Ready], TaskStatus::Running)
    }

    /// Marks a running task as done.
    pub fn mark_done(&mut self, name: &str) -> Result<(), ScheduleError> {
        let night = self.night;
        let task = self.task_mut(name)?;
        Self::transition(task, &[TaskStatus::Running], TaskStatus::Done)?;
        if let Some(night) = night {
            self.last_done.insert(name.to_string(), night);
        }
        Ok(())
    }

    /// Records a failed run. The task goes back to `Pending` behind a backoff
    /// while it has retries left, and becomes `Failed` otherwise.
    pub fn mark_failed(
        &mut self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<TaskStatus, ScheduleError> {
        let max_retries = self.config.max_retries;
        let backoff = chrono::Duration::from_std(crate::config::secs(self.config.retry_backoff))
            .unwrap_or_else(|_| chrono::Duration::zero());
        let task = self.task_mut(name)?;
        if task.retry_count < max_retries {
            Self::transition(task, &[TaskStatus::Running], TaskStatus::Pending)?;
            task.retry_count += 1;
            task.backoff_until = Some(now + backoff);
        } else {
            Self::transition(task, &[TaskStatus::Running], TaskStatus::Failed)?;
        }
        tracing::warn!(task = %name, status = %task.status, retries = task.retry_count, "calibration failed");
        Ok(task.status)
    }

    /// Failed tasks that post-observing recovery may retry.
    #[must_use]
    pub fn recoverable(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|task| {
                task.status == TaskStatus::Failed
                    && task.allow_post_observing_recovery
                    && !task.requires_dome
            })
            .map(|task| task.name.clone())
            .collect()
    }

    /// Gives a failed task a fresh, open-ended window starting `now`.
    pub fn requeue_for_recovery(
        &mut self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ScheduleError> {
        let task = self.task_mut(name)?;
        Self::transition(task, &[TaskStatus::Failed], TaskStatus::Pending)?;
        task.earliest_start = now;
        task.latest_start = None;
        task.retry_count = 0;
        task.backoff_until = None;
        Ok(())
    }

    /// Resolves the sequence a task runs.
    #[must_use]
    pub fn sequence_for(&self, task: &CalibrationTask) -> Option<CalibrationSequence> {
        match &task.kind {
            TaskKind::Sequence(SequenceRef::Inline(sequence)) => Some(sequence.clone()),
            TaskKind::Sequence(SequenceRef::Named(name)) => {
                self.config.sequences.get(name).cloned()
            }
            TaskKind::PreObserving | TaskKind::PostObserving => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ephemeris(night: i64) -> Ephemeris {
        let sunset = Utc.with_ymd_and_hms(2024, 6, 1, 23, 0, 0).unwrap()
            + chrono::Duration::days(night - 60_462);
        Ephemeris {
            night: NightId(night),
            sunset,
            evening_twilight: sunset + chrono::Duration::minutes(75),
            morning_twilight: sunset + chrono::Duration::hours(9),
            sunrise: sunset + chrono::Duration::minutes(615),
        }
    }

    fn task(name: &str, start_offset: f64) -> TaskDefinition {
        TaskDefinition {
            name: name.into(),
            sequence: Some(SequenceRef::Named("arcs".into())),
            recipe: None,
            anchor: Anchor::Sunset,
            start_offset,
            max_start_offset: None,
            after: None,
            requires_dome: false,
            close_dome_after: false,
            priority: 0,
            estimated_duration: 600.0,
            cadence_nights: 1,
            allow_post_observing_recovery: false,
            enabled: true,
        }
    }

    fn scheduler(tasks: Vec<TaskDefinition>) -> CalibrationScheduler {
        let config = CalibrationsConfig {
            day_tasks: false,
            tasks,
            ..CalibrationsConfig::default()
        };
        let mut scheduler = CalibrationScheduler::new(config);
        assert!(scheduler.refresh(&ephemeris(60_462)));
        scheduler
    }

    fn at(minutes_from_sunset: i64) -> DateTime<Utc> {
        ephemeris(60_462).sunset + chrono::Duration::minutes(minutes_from_sunset)
    }

    #[test]
    fn dependent_waits_for_its_prerequisite() {
        let mut second = task("second", 0.0);
        second.after = Some("first".into());
        let mut scheduler = scheduler(vec![task("first", 0.0), second]);

        let next = scheduler.next_ready(at(1)).unwrap();
        assert_eq!(next.name, "first");
        scheduler.mark_running("first", at(1)).unwrap();
        assert!(scheduler.next_ready(at(2)).is_none());
        assert_eq!(scheduler.task("second").unwrap().status, TaskStatus::Pending);
        assert!(scheduler.mark_running("second", at(2)).is_err());

        scheduler.mark_done("first").unwrap();
        assert_eq!(scheduler.next_ready(at(3)).unwrap().name, "second");
    }

    #[test]
    fn missed_window_skips_even_ready_tasks() {
        let mut late = task("late", -30.0);
        late.max_start_offset = Some(-10.0);
        let mut scheduler = scheduler(vec![late]);
        assert_eq!(scheduler.next_ready(at(-20)).unwrap().name, "late");
        assert!(scheduler.next_ready(at(-5)).is_none());
        assert_eq!(scheduler.task("late").unwrap().status, TaskStatus::Skipped);
        assert!(scheduler.mark_running("late", at(-5)).is_err());
    }

    #[test]
    fn ready_task_cannot_start_once_its_window_closes() {
        let mut flats = task("flats", -30.0);
        flats.max_start_offset = Some(-10.0);
        flats.requires_dome = true;
        let mut scheduler = scheduler(vec![flats]);
        assert_eq!(scheduler.next_ready(at(-11)).unwrap().name, "flats");

        let err = scheduler.mark_running("flats", at(-9)).unwrap_err();
        assert!(matches!(err, ScheduleError::WindowClosed { .. }));
        assert_eq!(scheduler.task("flats").unwrap().status, TaskStatus::Skipped);
        assert!(scheduler.next_ready(at(-9)).is_none());
    }

    #[test]
    fn priority_then_earliest_start() {
        let mut low = task("low", 0.0);
        low.priority = 1;
        let mut later = task("later", 20.0);
        later.priority = 5;
        let mut sooner = task("sooner", 15.0);
        sooner.priority = 5;
        let mut scheduler = scheduler(vec![low, later, sooner]);
        assert_eq!(scheduler.next_ready(at(5)).unwrap().name, "low");
        assert_eq!(scheduler.next_ready(at(30)).unwrap().name, "sooner");
    }

    #[test]
    fn failures_back_off_then_fail_without_blocking_others() {
        let mut scheduler = scheduler(vec![task("flaky", 0.0), task("other", 10.0)]);
        for attempt in 0..2 {
            let now = at(attempt * 10);
            let next = scheduler.next_ready(now).unwrap();
            assert_eq!(next.name, "flaky");
            scheduler.mark_running("flaky", now).unwrap();
            assert_eq!(scheduler.mark_failed("flaky", now).unwrap(), TaskStatus::Pending);
            let next = scheduler.next_ready(now + chrono::Duration::minutes(1));
            assert_ne!(next.map(|task| task.name), Some("flaky".to_string()));
        }
        let now = at(60);
        assert_eq!(scheduler.next_ready(now).unwrap().name, "flaky");
        scheduler.mark_running("flaky", now).unwrap();
        assert_eq!(scheduler.mark_failed("flaky", now).unwrap(), TaskStatus::Failed);
        assert_eq!(scheduler.next_ready(now).unwrap().name, "other");
    }

    #[test]
    fn dome_and_open_sub_schedules_progress_independently() {
        let mut flats = task("flats", 0.0);
        flats.requires_dome = true;
        let mut scheduler = scheduler(vec![flats, task("arcs", 0.0), task("darks", 0.0)]);
        let dome = scheduler.next_ready_for(at(1), true).unwrap();
        assert_eq!(dome.name, "flats");
        scheduler.mark_running(&dome.name, at(1)).unwrap();
        let open = scheduler.next_ready(at(1)).unwrap();
        assert!(!open.requires_dome);
        scheduler.mark_running(&open.name, at(1)).unwrap();
        assert!(scheduler.next_ready(at(1)).is_none());
        assert!(matches!(
            scheduler.mark_running(if open.name == "arcs" { "darks" } else { "arcs" }, at(1)),
            Err(ScheduleError::InvalidTransition { .. } | ScheduleError::SubScheduleBusy { .. })
        ));
    }

    #[test]
    fn refresh_is_idempotent_and_honours_cadence() {
        let mut weekly = task("weekly", 0.0);
        weekly.cadence_nights = 2;
        let mut scheduler = scheduler(vec![weekly]);
        assert!(!scheduler.refresh(&ephemeris(60_462)));
        scheduler.next_ready(at(1)).unwrap();
        scheduler.mark_running("weekly", at(1)).unwrap();
        scheduler.mark_done("weekly").unwrap();
        assert!(!scheduler.refresh(&ephemeris(60_462)));
        assert_eq!(scheduler.task("weekly").unwrap().status, TaskStatus::Done);

        scheduler.refresh(&ephemeris(60_463));
        assert_eq!(scheduler.task("weekly").unwrap().status, TaskStatus::Skipped);
        scheduler.refresh(&ephemeris(60_464));
        assert_eq!(scheduler.task("weekly").unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn day_tasks_are_built_in() {
        let mut scheduler = CalibrationScheduler::new(CalibrationsConfig::default());
        scheduler.refresh(&ephemeris(60_462));
        let pre = scheduler.task("pre_observing").unwrap();
        assert_eq!(pre.kind, TaskKind::PreObserving);
        assert_eq!(pre.earliest_start, at(-30));
        assert_eq!(pre.latest_start, Some(at(-10)));
        assert!(TaskDefinition::is_builtin("post_observing"));
    }

    #[test]
    fn recovery_requeues_failed_open_tasks() {
        let mut arcs = task("arcs", 0.0);
        arcs.allow_post_observing_recovery = true;
        let mut config = CalibrationsConfig {
            day_tasks: false,
            max_retries: 0,
            tasks: vec![arcs],
            ..CalibrationsConfig::default()
        };
        config.retry_backoff = 0.0;
        let mut scheduler = CalibrationScheduler::new(config);
        scheduler.refresh(&ephemeris(60_462));
        scheduler.next_ready(at(1)).unwrap();
        scheduler.mark_running("arcs", at(1)).unwrap();
        scheduler.mark_failed("arcs", at(1)).unwrap();
        assert_eq!(scheduler.recoverable(), vec!["arcs".to_string()]);
        scheduler.requeue_for_recovery("arcs", at(600)).unwrap();
        assert_eq!(scheduler.next_ready(at(600)).unwrap().name, "arcs");
    }
}
