use deltacal_core::{
    CalibrationSession, FactorSet, KinematicParameters, SolveOptions, SyntheticMachine,
    spiral_points,
};
use deltacal_gcode::{CodecError, CommandCodec, FieldProblem, FirmwareDialect, parse_probe_log};

const SETTINGS: &str = "\
echo:  M92 X80.00 Y80.00 Z80.00
echo:  M666 X0.00 Y0.00 Z0.00
echo:  M665 L215.00 R110.00 H250.00 S200.00 X0.00 Y0.00 Z0.00
ok
";

fn firmware() -> KinematicParameters {
    CommandCodec::default()
        .decode(SETTINGS)
        .unwrap()
        .into_parameters()
        .unwrap()
}

fn solved_session() -> CalibrationSession {
    let actual = firmware()
        .with_endstop_offsets([0.0, 0.3, 0.1])
        .with_tower_angle_offsets([0.15, -0.2, 0.0]);
    let machine = SyntheticMachine::new(actual, firmware());

    let mut session = CalibrationSession::new();
    session.start(firmware()).unwrap();
    for p in spiral_points(13, 70.0) {
        session.record_measurement(machine.probe(p.x, p.y).unwrap()).unwrap();
    }
    session
        .run_solve(SolveOptions::default().with_factors(FactorSet::SIX))
        .unwrap();
    session
}

#[test]
fn decode_steps_per_unit() {
    let parsed = CommandCodec::default()
        .decode("M92 X80.00 Y80.00 Z80.00")
        .unwrap();
    assert_eq!(parsed.steps_per_unit, Some([80.0, 80.0, 80.0]));
}

#[test]
fn decode_missing_axis() {
    let err = CommandCodec::default()
        .decode("M92 X80.00 Z80.00")
        .unwrap_err();
    assert_eq!(
        err,
        CodecError::UnparsableResponse {
            command: "M92".parse().unwrap(),
            field: 'Y',
            line: 1,
            problem: FieldProblem::Missing,
        }
    );
}

#[test]
fn accepted_result_is_what_gets_encoded() {
    let codec = CommandCodec::new(FirmwareDialect::marlin());
    let mut session = solved_session();
    let before = codec.encode(session.active_parameters().unwrap());

    let accepted = session.accept().unwrap().parameters.clone();
    let after = codec.encode(session.active_parameters().unwrap());

    assert_ne!(before, after);
    assert_eq!(after, codec.encode(&accepted));
    // endstops and tower angles changed, steps per unit did not
    assert_eq!(before[0], after[0]);
    assert_ne!(before[1], after[1]);
}

#[test]
fn discarded_result_leaves_commands_unchanged() {
    let codec = CommandCodec::new(FirmwareDialect::marlin());
    let mut session = solved_session();
    let before = codec.encode(session.active_parameters().unwrap());
    session.discard().unwrap();
    assert_eq!(codec.encode(session.active_parameters().unwrap()), before);
}

#[test]
fn probe_log_feeds_a_session() {
    let log = "\
Recv: Bed X: 0.000 Y: 0.000 Z: 0.050
Recv: Bed X: 40.000 Y: 0.000 Z: -0.020
Recv: Bed X: -20.000 Y: 34.641 Z: 0.010
Recv: Bed X: -20.000 Y: -34.641 Z: 0.030
";
    let mut session = CalibrationSession::new();
    session.start(firmware()).unwrap();
    for report in parse_probe_log(log) {
        session.record_measurement(report.measurement()).unwrap();
    }
    assert_eq!(session.measurements().len(), 4);

    let result = session
        .run_solve(SolveOptions::default().with_factors(FactorSet::FOUR))
        .unwrap();
    assert!(result.residual_rms <= result.initial_rms);
}
