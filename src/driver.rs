//! Replica exchange runs through an external MD engine, retried with a shrinking time step
//! when the engine reports an unstable integration.

use crate::energies::ReplicaEnergies;
use crate::errors::*;
use crate::units::{kelvin, Temperature, Time, TimeUnit};
use tracing::{info, instrument, warn};

fn default_temperatures() -> Vec<Temperature> {
    (0..10).map(|i| kelvin(250.0 + 10.0 * i as f64)).collect()
}

/// Settings for a replica exchange run
#[derive(Builder, Debug, Clone, PartialEq)]
#[builder(
    pattern = "owned",
    build_fn(
        validate = "Self::validate",
        name = "build_inner",
        private,
        error = "ThermoError"
    )
)]
pub struct SimulationSettings {
    /// One replica per temperature
    #[builder(default = "default_temperatures()")]
    temperatures: Vec<Temperature>,

    /// Integration time step. If unset, the engine's suggestion is used.
    #[builder(default, setter(strip_option))]
    time_step: Option<Time>,

    /// Simulated time per replica
    #[builder(default = "Time::new(1.0, TimeUnit::Picosecond)")]
    total_simulation_time: Time,

    /// Number of exchange attempts. If unset, one per 1000 steps for long runs, otherwise 10.
    #[builder(default, setter(strip_option))]
    exchange_attempts: Option<usize>,

    /// Factor applied to the time step after an unstable run
    #[builder(default = "0.5")]
    backoff_factor: f64,

    /// Runs attempted before giving up
    #[builder(default = "5")]
    max_attempts: usize,

    /// The time step is never reduced to or below this
    #[builder(default = "Time::new(0.001, TimeUnit::Femtosecond)")]
    minimum_time_step: Time,
}

impl SimulationSettingsBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(temperatures) = &self.temperatures {
            if temperatures.is_empty() {
                return Err("the temperature list is empty".to_string());
            }
            if let Some(t) = temperatures.iter().find(|t| !(t.internal() > 0.0)) {
                return Err(format!("temperatures must be positive, not {}", t));
            }
        }
        if let Some(Some(dt)) = self.time_step {
            if !(dt.internal() > 0.0) {
                return Err(format!("time step must be positive, not {}", dt));
            }
        }
        if let Some(total) = self.total_simulation_time {
            if !(total.internal() > 0.0) {
                return Err(format!("total simulation time must be positive, not {}", total));
            }
        }
        if self.exchange_attempts == Some(Some(0)) {
            return Err("exchange_attempts must be at least 1".to_string());
        }
        if let Some(factor) = self.backoff_factor {
            if !(factor > 0.0 && factor < 1.0) {
                return Err(format!("backoff factor must lie in (0, 1), not {}", factor));
            }
        }
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be at least 1".to_string());
        }
        Ok(())
    }

    /// Build and check the settings
    pub fn build(self) -> Result<SimulationSettings> {
        self.build_inner()
    }
}

impl SimulationSettings {
    /// Get a new builder for the `SimulationSettings` struct.
    pub fn builder() -> SimulationSettingsBuilder {
        SimulationSettingsBuilder::default()
    }

    /// Replica temperatures
    pub fn temperatures(&self) -> &[Temperature] {
        &self.temperatures
    }

    /// The configured time step, if any
    pub fn time_step(&self) -> Option<Time> {
        self.time_step
    }

    /// Simulated time per replica
    pub fn total_simulation_time(&self) -> Time {
        self.total_simulation_time
    }

    /// Lay out a run at time step `time_step`.
    ///
    /// The total simulated time is fixed, so a smaller step means more steps.
    pub fn plan(&self, time_step: Time, attempt: usize) -> Result<ReplicaExchangePlan> {
        let steps = (self.total_simulation_time.internal() / time_step.internal()).round();
        if !(steps >= 1.0) {
            return Err(ThermoError::InvalidConfiguration(format!(
                "a time step of {} does not fit in {}",
                time_step, self.total_simulation_time
            )));
        }
        let steps = steps as usize;
        let exchange_attempts = self
            .exchange_attempts
            .unwrap_or_else(|| default_exchange_attempts(steps));
        let steps_per_exchange = ((steps as f64 / exchange_attempts as f64).round() as usize).max(1);

        Ok(ReplicaExchangePlan {
            temperatures: self.temperatures.clone(),
            time_step,
            steps,
            exchange_attempts,
            steps_per_exchange,
            attempt,
        })
    }
}

/// One exchange attempt per 1000 steps for runs over 10 000 steps, otherwise 10
pub fn default_exchange_attempts(steps: usize) -> usize {
    if steps > 10_000 {
        (steps as f64 / 1000.0).round() as usize
    } else {
        10
    }
}

/// Everything an engine needs to carry out one run
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaExchangePlan {
    /// One replica per temperature
    pub temperatures: Vec<Temperature>,
    /// Integration time step
    pub time_step: Time,
    /// Total integration steps per replica
    pub steps: usize,
    /// Number of exchange attempts
    pub exchange_attempts: usize,
    /// Integration steps between exchange attempts
    pub steps_per_exchange: usize,
    /// 1 for the first run, counting up with each retry
    pub attempt: usize,
}

/// How an engine run ended
#[derive(Debug, Clone, PartialEq)]
pub enum EngineExit {
    /// The run finished; energies of every replica at every temperature
    Completed(ReplicaEnergies),
    /// The integration blew up; worth retrying with a smaller time step
    Unstable(String),
    /// Unrecoverable failure
    Aborted(String),
}

/// A molecular dynamics engine capable of replica exchange
pub trait ReplicaExchangeEngine {
    /// Carry out the run described by `plan`
    fn run(&mut self, plan: &ReplicaExchangePlan) -> EngineExit;

    /// A stable time step for this system, used when the settings don't give one
    fn suggested_time_step(&mut self) -> Option<Time> {
        None
    }
}

/// Where a [`ReplicaExchangeDriver`] is in its run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// A run is planned but not yet started
    Proposed,
    /// The engine is running
    Running,
    /// A run completed
    Converged,
    /// The driver gave up
    Failed,
}

/// Runs replica exchange, halving the time step after each unstable run
#[derive(Debug, Clone)]
pub struct ReplicaExchangeDriver {
    settings: SimulationSettings,
    state: RunState,
    attempts: usize,
    time_step: Option<Time>,
}

impl ReplicaExchangeDriver {
    /// A driver that has not run yet
    pub fn new(settings: SimulationSettings) -> Self {
        Self {
            settings,
            state: RunState::Proposed,
            attempts: 0,
            time_step: None,
        }
    }

    /// Current state
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Runs started so far
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Time step of the latest run
    pub fn time_step(&self) -> Option<Time> {
        self.time_step
    }

    fn fail(&mut self, dt: Time, reason: String) -> ThermoError {
        self.state = RunState::Failed;
        ThermoError::SimulationFailed {
            attempts: self.attempts,
            last_time_step: dt.internal(),
            reason,
        }
    }

    /// Run `engine` until it completes, aborts, or the retry budget runs out
    #[instrument(level = "info", skip_all, fields(replicas = self.settings.temperatures.len()))]
    pub fn run<E: ReplicaExchangeEngine + ?Sized>(&mut self, engine: &mut E) -> Result<ReplicaEnergies> {
        let mut dt = match self.settings.time_step.or_else(|| engine.suggested_time_step()) {
            Some(dt) => dt,
            None => {
                self.state = RunState::Failed;
                return Err(ThermoError::InvalidConfiguration(
                    "no time step was given and the engine suggested none".to_string(),
                ));
            }
        };
        let floor = self.settings.minimum_time_step.internal();
        self.state = RunState::Proposed;
        self.attempts = 0;

        loop {
            let plan = match self.settings.plan(dt, self.attempts + 1) {
                Ok(plan) => plan,
                Err(e) => {
                    self.state = RunState::Failed;
                    return Err(e);
                }
            };
            self.state = RunState::Running;
            self.attempts += 1;
            self.time_step = Some(dt);
            info!(
                attempt = self.attempts,
                time_step_fs = dt.value_in(TimeUnit::Femtosecond),
                steps = plan.steps,
                exchanges = plan.exchange_attempts,
                "starting replica exchange"
            );

            match engine.run(&plan) {
                EngineExit::Completed(energies) => {
                    if energies.n_replicas() != plan.temperatures.len() {
                        self.state = RunState::Failed;
                        return Err(ThermoError::InputShapeMismatch(format!(
                            "engine returned {} replicas for {} temperatures",
                            energies.n_replicas(),
                            plan.temperatures.len()
                        )));
                    }
                    self.state = RunState::Converged;
                    info!(attempts = self.attempts, "replica exchange finished");
                    return Ok(energies);
                }
                EngineExit::Aborted(reason) => {
                    return Err(self.fail(dt, reason));
                }
                EngineExit::Unstable(reason) => {
                    let next = dt.internal() * self.settings.backoff_factor;
                    if self.attempts >= self.settings.max_attempts || next <= floor {
                        return Err(self.fail(dt, reason));
                    }
                    warn!(
                        attempt = self.attempts,
                        time_step_fs = dt.value_in(TimeUnit::Femtosecond),
                        %reason,
                        "unstable run, reducing time step"
                    );
                    dt = Time::from_internal(next);
                    self.state = RunState::Proposed;
                }
            }
        }
    }
}

/// Run replica exchange with `settings`, retrying unstable runs
pub fn replica_exchange<E: ReplicaExchangeEngine + ?Sized>(
    engine: &mut E,
    settings: SimulationSettings,
) -> Result<ReplicaEnergies> {
    ReplicaExchangeDriver::new(settings).run(engine)
}
