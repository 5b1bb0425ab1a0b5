// Calibration session state machine

use crate::{
    error::{CalibrationError, Result},
    geometry::{KinematicParameters, Point3D},
    kinematics::{DeltaKinematics, KinematicModel},
    measurement::{Measurement, MeasurementSet, Observation},
    solver::{LeastSquaresSolver, SolveObserver, SolveOptions, SolveResult},
};
use serde::Serialize;
use std::fmt;
use tracing::info;

#[derive(Clone, Debug)]
pub enum SessionState {
    Idle,
    Collecting,
    Solving,
    /// The solve produced a best-fit result. It may have stopped at the
    /// iteration limit; [`SolveResult::converged`] says whether it met the
    /// tolerance. Either way it can be accepted or discarded.
    Converged(SolveResult),
    Failed(CalibrationError),
}

impl SessionState {
    pub fn kind(&self) -> SessionStateKind {
        match self {
            SessionState::Idle => SessionStateKind::Idle,
            SessionState::Collecting => SessionStateKind::Collecting,
            SessionState::Solving => SessionStateKind::Solving,
            SessionState::Converged(_) => SessionStateKind::Converged,
            SessionState::Failed(_) => SessionStateKind::Failed,
        }
    }
}

/// Session state without its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStateKind {
    Idle,
    Collecting,
    Solving,
    Converged,
    Failed,
}

impl fmt::Display for SessionStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionStateKind::Idle => "idle",
            SessionStateKind::Collecting => "collecting",
            SessionStateKind::Solving => "solving",
            SessionStateKind::Converged => "converged",
            SessionStateKind::Failed => "failed",
        })
    }
}

/// One committed parameter snapshot.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ParameterVersion {
    pub version: u64,
    pub parameters: KinematicParameters,
    /// Residual RMS of the solve that produced this version, `None` for the
    /// starting geometry.
    pub rms: Option<f64>,
}

/// A solve detached from its session so it can run on another thread.
#[derive(Debug)]
pub struct SolveJob<M = DeltaKinematics> {
    generation: u64,
    initial: KinematicParameters,
    observations: Vec<Observation>,
    model: M,
    solver: LeastSquaresSolver,
}

impl<M: KinematicModel> SolveJob<M> {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn run(self) -> SolveOutcome {
        self.run_observed(&mut ())
    }

    pub fn run_observed<O: SolveObserver + ?Sized>(self, observer: &mut O) -> SolveOutcome {
        let result =
            self.solver
                .solve_observations(&self.initial, &self.observations, &self.model, observer);
        SolveOutcome {
            generation: self.generation,
            result,
        }
    }
}

/// Result of a [`SolveJob`], handed back to the session that issued it.
#[derive(Debug)]
pub struct SolveOutcome {
    generation: u64,
    pub result: Result<SolveResult>,
}

impl SolveOutcome {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Owns the active geometry, its version history and the measurements
/// collected against it.
///
/// The active parameters only change on [`accept`](Self::accept); solves
/// work on copies.
#[derive(Debug)]
pub struct CalibrationSession<M = DeltaKinematics> {
    model: M,
    state: SessionState,
    history: Vec<ParameterVersion>,
    measurements: MeasurementSet,
    generation: u64,
}

impl CalibrationSession {
    pub fn new() -> Self {
        Self::with_model(DeltaKinematics)
    }
}

impl Default for CalibrationSession {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: KinematicModel + Clone> CalibrationSession<M> {
    pub fn with_model(model: M) -> Self {
        Self {
            model,
            state: SessionState::Idle,
            history: Vec::new(),
            measurements: MeasurementSet::new(),
            generation: 0,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Geometry currently in force, `None` before [`start`](Self::start).
    pub fn active_parameters(&self) -> Option<&KinematicParameters> {
        self.history.last().map(|v| &v.parameters)
    }

    pub fn history(&self) -> &[ParameterVersion] {
        &self.history
    }

    pub fn measurements(&self) -> &MeasurementSet {
        &self.measurements
    }

    /// Begins a new calibration from `initial`, dropping any previous history
    /// and measurements.
    pub fn start(&mut self, initial: KinematicParameters) -> Result<()> {
        match self.state {
            SessionState::Idle | SessionState::Collecting | SessionState::Failed(_) => {}
            _ => return Err(self.invalid("start")),
        }

        self.history = vec![ParameterVersion {
            version: 0,
            parameters: initial,
            rms: None,
        }];
        self.measurements.clear();
        self.transition(SessionState::Collecting);
        Ok(())
    }

    /// Records a measurement taken with the active geometry, returning its
    /// index in the measurement set.
    pub fn record_measurement(&mut self, measurement: Measurement) -> Result<usize> {
        match self.state {
            SessionState::Collecting | SessionState::Failed(_) => {}
            _ => return Err(self.invalid("record a measurement")),
        }
        let active = self
            .active_parameters()
            .ok_or_else(|| self.invalid("record a measurement"))?;

        Observation::bind(&self.model, active, measurement)?;
        let index = self.measurements.add(measurement)?;

        if matches!(self.state, SessionState::Failed(_)) {
            self.transition(SessionState::Collecting);
        }
        Ok(index)
    }

    pub fn record(&mut self, nominal: Point3D, deviation: f64) -> Result<usize> {
        self.record_measurement(Measurement::new(nominal, deviation))
    }

    /// Detaches a solve over the current measurements. The session stays
    /// `Solving` until the outcome is passed to
    /// [`finish_solve`](Self::finish_solve).
    pub fn begin_solve(&mut self, options: SolveOptions) -> Result<SolveJob<M>> {
        match self.state {
            SessionState::Collecting | SessionState::Failed(_) => {}
            SessionState::Solving => return Err(CalibrationError::SessionBusy),
            _ => return Err(self.invalid("solve")),
        }
        if options.factors.is_empty() {
            return Err(CalibrationError::NoFreeParameters);
        }
        self.measurements.require(options.factors.len())?;

        let initial = self
            .active_parameters()
            .cloned()
            .ok_or_else(|| self.invalid("solve"))?;
        let observations = self.measurements.observe(&self.model, &initial)?;

        self.generation += 1;
        self.transition(SessionState::Solving);
        Ok(SolveJob {
            generation: self.generation,
            initial,
            observations,
            model: self.model.clone(),
            solver: LeastSquaresSolver::new(options),
        })
    }

    /// Applies a finished solve and returns its result.
    ///
    /// A cancelled solve returns the session to `Collecting`; any other error
    /// leaves it `Failed` with the error available for inspection.
    pub fn finish_solve(&mut self, outcome: SolveOutcome) -> Result<SolveResult> {
        if !matches!(self.state, SessionState::Solving) || outcome.generation != self.generation {
            return Err(self.invalid("finish a solve"));
        }

        match outcome.result {
            Ok(result) => {
                self.transition(SessionState::Converged(result.clone()));
                Ok(result)
            }
            Err(err @ CalibrationError::Cancelled { .. }) => {
                self.transition(SessionState::Collecting);
                Err(err)
            }
            Err(err) => {
                self.transition(SessionState::Failed(err.clone()));
                Err(err)
            }
        }
    }

    pub fn run_solve(&mut self, options: SolveOptions) -> Result<SolveResult> {
        self.run_solve_observed(options, &mut ())
    }

    pub fn run_solve_observed<O: SolveObserver + ?Sized>(
        &mut self,
        options: SolveOptions,
        observer: &mut O,
    ) -> Result<SolveResult> {
        let job = self.begin_solve(options)?;
        let outcome = job.run_observed(observer);
        self.finish_solve(outcome)
    }

    /// Commits the converged result as the next parameter version.
    pub fn accept(&mut self) -> Result<&ParameterVersion> {
        let SessionState::Converged(result) = &self.state else {
            return Err(self.invalid("accept"));
        };

        let version = self.history.last().map_or(0, |v| v.version + 1);
        let next = ParameterVersion {
            version,
            parameters: result.parameters.clone(),
            rms: Some(result.residual_rms),
        };
        info!(version, rms = result.residual_rms, "parameters accepted");

        self.history.push(next);
        self.measurements.clear();
        self.transition(SessionState::Idle);
        Ok(&self.history[self.history.len() - 1])
    }

    /// Drops the solve outcome, keeping the active parameters and the
    /// measurements.
    pub fn discard(&mut self) -> Result<()> {
        match self.state {
            SessionState::Converged(_) | SessionState::Failed(_) => {
                self.transition(SessionState::Idle);
                Ok(())
            }
            _ => Err(self.invalid("discard")),
        }
    }

    /// Returns to collecting with the current parameters and measurements.
    pub fn resume(&mut self) -> Result<()> {
        if !matches!(self.state, SessionState::Idle) || self.history.is_empty() {
            return Err(self.invalid("resume"));
        }
        self.transition(SessionState::Collecting);
        Ok(())
    }

    fn transition(&mut self, next: SessionState) {
        info!(from = %self.state.kind(), to = %next.kind(), "session transition");
        self.state = next;
    }

    fn invalid(&self, operation: &'static str) -> CalibrationError {
        CalibrationError::InvalidState {
            operation,
            state: self.state.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ReachFailure,
        geometry::{CarriagePositions, FactorSet},
        plan::spiral_points,
        solver::CancellationFlag,
        synthetic::SyntheticMachine,
    };

    fn assumed() -> KinematicParameters {
        KinematicParameters::new(215.0, 110.0, 250.0)
    }

    fn actual() -> KinematicParameters {
        assumed()
            .with_endstop_offsets([0.0, 0.3, 0.15])
            .with_tower_angle_offsets([0.2, -0.1, 0.0])
    }

    fn collecting(points: usize) -> CalibrationSession {
        let machine = SyntheticMachine::new(actual(), assumed());
        let mut session = CalibrationSession::new();
        session.start(assumed()).unwrap();
        for p in spiral_points(points, 75.0) {
            let m = machine.probe(p.x, p.y).unwrap();
            session.record_measurement(m).unwrap();
        }
        session
    }

    fn options() -> SolveOptions {
        SolveOptions::default().with_factors(FactorSet::SIX)
    }

    #[test]
    fn solve_and_accept() {
        let mut session = collecting(19);
        let result = session.run_solve(options()).unwrap();
        assert!(result.converged);
        assert_eq!(session.state().kind(), SessionStateKind::Converged);
        // nothing committed yet
        assert_eq!(session.active_parameters(), Some(&assumed()));

        let version = session.accept().unwrap();
        assert_eq!(version.version, 1);
        assert_eq!(version.parameters, result.parameters);
        assert_eq!(session.state().kind(), SessionStateKind::Idle);
        assert!(session.measurements().is_empty());
        assert_eq!(session.history().len(), 2);
        assert!(session.active_parameters().unwrap().max_deviation(&actual()) < 1e-3);
    }

    #[test]
    fn iteration_limit_still_offers_best_result() {
        let mut session = collecting(19);
        let result = session
            .run_solve(options().with_max_iterations(1))
            .unwrap();
        assert!(!result.converged);
        assert_eq!(result.iterations, 1);

        let SessionState::Converged(held) = session.state() else {
            panic!("unexpected {:?}", session.state());
        };
        assert!(!held.converged);
        assert!(held.residual_rms < held.initial_rms);

        let version = session.accept().unwrap();
        assert_eq!(version.rms, Some(result.residual_rms));
        assert_ne!(session.active_parameters(), Some(&assumed()));
    }

    #[test]
    fn discard_keeps_parameters_and_measurements() {
        let mut session = collecting(19);
        session.run_solve(options()).unwrap();
        session.discard().unwrap();
        assert_eq!(session.state().kind(), SessionStateKind::Idle);
        assert_eq!(session.active_parameters(), Some(&assumed()));
        assert_eq!(session.measurements().len(), 19);

        session.resume().unwrap();
        assert_eq!(session.state().kind(), SessionStateKind::Collecting);
        assert!(session.run_solve(options()).is_ok());
    }

    #[test]
    fn insufficient_data_stays_collecting() {
        let mut session = collecting(5);
        let err = session.run_solve(options()).unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::InsufficientData {
                samples: 5,
                required: 6
            }
        ));
        assert_eq!(session.state().kind(), SessionStateKind::Collecting);
    }

    #[test]
    fn recording_requires_collecting() {
        let mut session = CalibrationSession::new();
        let err = session.record(Point3D::new(0.0, 0.0, 0.0), 0.1).unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::InvalidState {
                state: SessionStateKind::Idle,
                ..
            }
        ));
        assert!(session.resume().is_err());
    }

    #[test]
    fn unreachable_measurement_is_rejected() {
        let mut session = CalibrationSession::new();
        session.start(assumed()).unwrap();
        let err = session.record(Point3D::new(500.0, 0.0, 0.0), 0.1).unwrap_err();
        assert!(matches!(err, CalibrationError::OutOfReach { .. }));
        assert!(session.measurements().is_empty());
    }

    #[test]
    fn solve_on_worker_thread() {
        let mut session = collecting(19);
        let job = session.begin_solve(options()).unwrap();
        assert_eq!(session.state().kind(), SessionStateKind::Solving);

        assert!(matches!(
            session.begin_solve(options()).unwrap_err(),
            CalibrationError::SessionBusy
        ));
        assert!(matches!(
            session.record(Point3D::new(1.0, 2.0, 0.0), 0.0).unwrap_err(),
            CalibrationError::InvalidState { .. }
        ));

        let outcome = std::thread::spawn(move || job.run()).join().unwrap();
        let result = session.finish_solve(outcome).unwrap();
        assert!(result.converged);
        assert_eq!(session.state().kind(), SessionStateKind::Converged);
    }

    #[test]
    fn stale_outcome_is_rejected() {
        let mut session = collecting(19);
        let stale = session.begin_solve(options()).unwrap().run();
        session.finish_solve(stale).unwrap();
        session.discard().unwrap();
        session.resume().unwrap();

        let job = session.begin_solve(options()).unwrap();
        let old = SolveOutcome {
            generation: job.generation() - 1,
            result: Err(CalibrationError::SessionBusy),
        };
        assert!(session.finish_solve(old).is_err());
        assert_eq!(session.state().kind(), SessionStateKind::Solving);
        session.finish_solve(job.run()).unwrap();
    }

    #[test]
    fn cancelled_solve_returns_to_collecting() {
        let mut session = collecting(19);
        let flag = CancellationFlag::new();
        flag.cancel();
        let err = session
            .run_solve_observed(options(), &mut flag.clone())
            .unwrap_err();
        assert!(matches!(err, CalibrationError::Cancelled { .. }));
        assert_eq!(session.state().kind(), SessionStateKind::Collecting);
        assert_eq!(session.active_parameters(), Some(&assumed()));
        assert_eq!(session.history().len(), 1);
        assert_eq!(session.measurements().len(), 19);
    }

    /// A model in which no parameter moves the effector.
    #[derive(Clone)]
    struct Flat;

    impl KinematicModel for Flat {
        fn forward_kinematics(
            &self,
            _parameters: &KinematicParameters,
            carriages: &CarriagePositions,
        ) -> Result<Point3D> {
            if !carriages.is_finite() {
                return Err(ReachFailure::NonFinite.into());
            }
            Ok(Point3D::default())
        }

        fn inverse_kinematics(
            &self,
            _parameters: &KinematicParameters,
            _point: &Point3D,
        ) -> Result<CarriagePositions> {
            Ok(CarriagePositions::default())
        }
    }

    #[test]
    fn failure_allows_more_measurements() {
        let mut session = CalibrationSession::with_model(Flat);
        session.start(assumed()).unwrap();
        for p in spiral_points(6, 50.0) {
            session.record(Point3D::new(p.x, p.y, 1.0), 0.0).unwrap();
        }

        let options = SolveOptions::default().with_factors(FactorSet::FOUR);
        let err = session.run_solve(options.clone()).unwrap_err();
        assert!(matches!(err, CalibrationError::SingularSystem { .. }));
        match session.state() {
            SessionState::Failed(CalibrationError::SingularSystem { best_rms, .. }) => {
                assert!((best_rms - 1.0).abs() < 1e-12)
            }
            other => panic!("unexpected state {other:?}"),
        }

        session.record(Point3D::new(70.0, 0.0, 1.0), 0.0).unwrap();
        assert_eq!(session.state().kind(), SessionStateKind::Collecting);
        assert!(session.accept().is_err());
    }
}
