//! The scheduler: owns the per-watch timers and cron gates, staggers startup,
//! hot-reloads the config directory, and enforces per-watch non-overlap.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::cron::{CronExpr, CronGate};
use crate::runner::{RunOutcome, Runner};
use crate::watch::{self, WatchConfig};

/// Config directory rescan period (30s)
const RELOAD_INTERVAL: Duration = Duration::from_secs(30);

/// Main loop tick
const TICK: Duration = Duration::from_secs(1);

/// Commands consumed by the scheduler's event loop.
#[derive(Debug)]
pub enum Command {
    /// Fire an out-of-band run for a watch id
    Trigger(String),
}

/// One row of the status surface's watch listing.
#[derive(Debug, Clone, Serialize)]
pub struct WatchSummary {
    pub id: String,
    pub name: String,
    pub url: String,
}

/// Process-wide runtime state shared between the scheduler, the watch
/// runner workers, and the status server.
pub struct Engine {
    pub runner: Arc<Runner>,
    pub last_results: Mutex<HashMap<String, RunOutcome>>,
    pub watch_index: Mutex<Vec<WatchSummary>>,
    /// cumulative failed-run counts, for the metrics surface
    pub error_totals: Mutex<HashMap<String, u64>>,
    pub started: Instant,
    pub running: AtomicBool,
}

impl Engine {
    pub fn new(runner: Arc<Runner>) -> Arc<Self> {
        Arc::new(Self {
            runner,
            last_results: Mutex::new(HashMap::new()),
            watch_index: Mutex::new(Vec::new()),
            error_totals: Mutex::new(HashMap::new()),
            started: Instant::now(),
            running: AtomicBool::new(true),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn knows_watch(&self, id: &str) -> bool {
        self.watch_index.lock().unwrap().iter().any(|w| w.id == id)
    }

    pub fn record_outcome(&self, outcome: RunOutcome) {
        if !outcome.success {
            *self
                .error_totals
                .lock()
                .unwrap()
                .entry(outcome.id.clone())
                .or_insert(0) += 1;
        }
        self.last_results
            .lock()
            .unwrap()
            .insert(outcome.id.clone(), outcome);
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

enum ScheduleKind {
    Interval {
        period: Duration,
        next_due: Instant,
    },
    Cron {
        gate: CronGate,
        /// the staggered first run, before the ticker takes over
        first_run_at: Option<Instant>,
    },
}

struct Entry {
    watch: WatchConfig,
    hash: String,
    schedule: ScheduleKind,
    busy: Arc<AtomicBool>,
}

pub struct Scheduler {
    engine: Arc<Engine>,
    commands: Receiver<Command>,
    entries: HashMap<String, Entry>,
    last_reload: Instant,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>, commands: Receiver<Command>) -> Self {
        Self {
            engine,
            commands,
            entries: HashMap::new(),
            last_reload: Instant::now(),
        }
    }

    /// The main event loop. Returns when the engine is shut down.
    pub fn run(&mut self) {
        self.reload(true);
        log::info!("monitoring {} watch(es)", self.entries.len());
        for entry in self.entries.values() {
            match (&entry.watch.schedule, entry.watch.interval) {
                (Some(schedule), _) => {
                    log::info!("  {} - cron \"{}\"", entry.watch.name, schedule)
                }
                (None, interval) => log::info!(
                    "  {} - every {}ms",
                    entry.watch.name,
                    interval.unwrap_or(self.engine.runner.settings.check_interval_ms)
                ),
            }
        }

        while self.engine.running.load(Ordering::SeqCst) {
            while let Ok(command) = self.commands.try_recv() {
                self.handle_command(command);
            }

            self.tick();

            if self.last_reload.elapsed() >= RELOAD_INTERVAL {
                self.reload(false);
                self.last_reload = Instant::now();
            }

            std::thread::sleep(TICK);
        }
        log::info!("scheduler stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Trigger(id) => match self.entries.get(&id) {
                Some(entry) => {
                    log::info!("manual trigger for '{}'", entry.watch.name);
                    Self::fire(&self.engine, entry);
                }
                None => log::warn!("trigger for unknown watch id '{}'", id),
            },
        }
    }

    /// Fire every entry whose timer or cron gate is due. An entry whose
    /// previous run is still in flight is skipped, never overlapped.
    fn tick(&mut self) {
        let now = Instant::now();
        let wall = chrono::Local::now();

        for entry in self.entries.values_mut() {
            let due = match &mut entry.schedule {
                ScheduleKind::Interval { period, next_due } => {
                    if now >= *next_due {
                        *next_due = now + *period;
                        true
                    } else {
                        false
                    }
                }
                ScheduleKind::Cron { gate, first_run_at } => {
                    if first_run_at.map(|at| now >= at).unwrap_or(false) {
                        *first_run_at = None;
                        true
                    } else {
                        gate.should_fire(&wall)
                    }
                }
            };
            if due {
                Self::fire(&self.engine, entry);
            }
        }
    }

    /// Spawn a worker for one run. The busy flag guarantees a watch never
    /// overlaps itself; a due tick that finds it set is dropped.
    fn fire(engine: &Arc<Engine>, entry: &Entry) {
        if entry.busy.swap(true, Ordering::SeqCst) {
            log::debug!(
                "watch '{}' still running, skipping this tick",
                entry.watch.name
            );
            return;
        }

        let engine = Arc::clone(engine);
        let busy = Arc::clone(&entry.busy);
        let watch = entry.watch.clone();
        std::thread::spawn(move || {
            let outcome = engine.runner.run(&watch);
            engine.record_outcome(outcome);
            busy.store(false, Ordering::SeqCst);
        });
    }

    /// Rescan the config directory and reconcile the scheduled set:
    /// new ids schedule, changed hashes reschedule with an immediate run,
    /// deleted or disabled watches tear down.
    fn reload(&mut self, initial: bool) {
        let settings = &self.engine.runner.settings;
        let (configs, rejected) = watch::load_config_dir(&settings.config_dir);
        for (path, error) in &rejected {
            log::error!("rejected config {}: {}", path.display(), error);
        }

        let stagger = Duration::from_millis(settings.stagger_delay_ms);
        let default_period = Duration::from_millis(settings.check_interval_ms);
        let now = Instant::now();

        let mut seen = HashSet::new();
        let mut summaries = Vec::new();
        let mut stagger_index: u32 = 0;

        for config in configs {
            if !config.enabled {
                continue;
            }
            let id = config.watch_id();
            seen.insert(id.clone());
            summaries.push(WatchSummary {
                id: id.clone(),
                name: config.name.clone(),
                url: config.url.clone(),
            });

            let unchanged = self
                .entries
                .get(&id)
                .map(|e| e.hash == config.config_hash)
                .unwrap_or(false);
            if unchanged {
                continue;
            }

            let first_run_at = if initial {
                let at = now + stagger * stagger_index;
                stagger_index += 1;
                at
            } else {
                now
            };

            if self.entries.contains_key(&id) {
                log::info!("watch '{}' changed, rescheduling", config.name);
            } else {
                log::info!("scheduling watch '{}' ({})", config.name, id);
            }

            let schedule = match &config.schedule {
                Some(expr) => {
                    // validated at load, so this parse cannot fail
                    let expr = CronExpr::parse(expr).unwrap_or_else(|_| {
                        CronExpr::parse("* * * * *").expect("wildcard cron")
                    });
                    ScheduleKind::Cron {
                        gate: CronGate::new(expr),
                        first_run_at: Some(first_run_at),
                    }
                }
                None => ScheduleKind::Interval {
                    period: config
                        .interval
                        .map(Duration::from_millis)
                        .unwrap_or(default_period),
                    next_due: first_run_at,
                },
            };

            let hash = config.config_hash.clone();
            self.entries.insert(
                id,
                Entry {
                    watch: config,
                    hash,
                    schedule,
                    busy: Arc::new(AtomicBool::new(false)),
                },
            );
        }

        self.entries.retain(|id, entry| {
            let keep = seen.contains(id);
            if !keep {
                log::info!("watch '{}' removed or disabled, tearing down", entry.watch.name);
            }
            keep
        });

        *self.engine.watch_index.lock().unwrap() = summaries;
    }
}
