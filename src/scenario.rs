//! Module test suites expressed as data, and the runner that plays them
//! against a live session.
use std::fmt;
use std::time::Duration;

use tracing::{error, info};

use crate::bus::{CanBus, Delay};
use crate::can_decoder::InboundMessage;
use crate::catalog::{ModuleVariant, ISO_TP_DDE_ID, ISO_TP_SCANNER_ID};
use crate::error::{FrameError, ScenarioError, SessionError};
use crate::frame::Frame;
use crate::messages::{LightRequest, Outbound};
use crate::power::PowerControl;
use crate::session::Session;

/// Settle time after a command before looking at the module's reaction.
const REACTION_TIME: Duration = Duration::from_millis(100);
/// Long enough without traffic for a module to flag the bus as idle.
const IDLE_WAIT: Duration = Duration::from_secs(2);

/// Expected value of one field of a decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check {
    Flag { name: &'static str, value: bool },
    Field { name: &'static str, value: i64 },
}

impl Check {
    pub fn flag(name: &'static str, value: bool) -> Self {
        Check::Flag { name, value }
    }

    pub fn field(name: &'static str, value: i64) -> Self {
        Check::Field { name, value }
    }

    /// Compare against a decoded message. Unknown names are decode errors, not
    /// failed checks.
    pub fn verify(&self, message: &InboundMessage) -> Result<(), ScenarioError> {
        match *self {
            Check::Flag { name, value } => {
                let actual = message.flag(name).map_err(SessionError::from)?;
                if actual != value {
                    return Err(ScenarioError::Check(format!(
                        "{}.{name} is {actual}, expected {value}",
                        message.name()
                    )));
                }
            }
            Check::Field { name, value } => {
                let actual = message.field(name).map_err(SessionError::from)?;
                if actual != value {
                    return Err(ScenarioError::Check(format!(
                        "{}.{name} is {actual}, expected {value}",
                        message.name()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// One action of a scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Send(Outbound),
    SendRaw(Frame),
    Sleep(Duration),
    Drain,
    /// Next status report must satisfy every check.
    ExpectStatus(Vec<Check>),
    ExpectMessage {
        kind: &'static str,
        checks: Vec<Check>,
    },
    /// Next frame with `id` must start with `prefix`.
    ExpectFrame { id: u32, prefix: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioTest {
    pub name: &'static str,
    pub steps: Vec<Step>,
}

/// Run a single step.
pub fn run_step<B, P, D>(session: &mut Session<B, P, D>, step: &Step) -> Result<(), ScenarioError>
where
    B: CanBus,
    P: PowerControl,
    D: Delay,
{
    match step {
        Step::Send(message) => {
            session.send(message)?;
        }
        Step::SendRaw(frame) => session.send_raw(frame)?,
        Step::Sleep(duration) => session.sleep(*duration),
        Step::Drain => {
            session.drain()?;
        }
        Step::ExpectStatus(checks) => {
            let status = session.status()?;
            for check in checks {
                check.verify(&status)?;
            }
        }
        Step::ExpectMessage { kind, checks } => {
            let timeout = session.config().status_timeout();
            let message = session.wait_for(kind, timeout)?;
            for check in checks {
                check.verify(&message)?;
            }
        }
        Step::ExpectFrame { id, prefix } => {
            let timeout = session.config().status_timeout();
            let Some(frame) = session.receive(timeout, &[*id])? else {
                return Err(SessionError::Timeout {
                    what: format!("frame {id:#x}"),
                    timeout_ms: timeout.as_millis() as u64,
                }
                .into());
            };
            if !frame.payload().starts_with(prefix) {
                return Err(ScenarioError::Check(format!(
                    "frame {frame} does not start with {prefix:02x?}"
                )));
            }
        }
    }
    Ok(())
}

/// Start the module, run every step, then power off whatever the outcome.
pub fn run_test<B, P, D>(session: &mut Session<B, P, D>, test: &ScenarioTest) -> Result<(), ScenarioError>
where
    B: CanBus,
    P: PowerControl,
    D: Delay,
{
    let result = run_steps(session, test);
    let stopped = session.stop();
    result?;
    stopped?;
    Ok(())
}

fn run_steps<B, P, D>(session: &mut Session<B, P, D>, test: &ScenarioTest) -> Result<(), ScenarioError>
where
    B: CanBus,
    P: PowerControl,
    D: Delay,
{
    session.start()?;
    session.prepare()?;
    for step in &test.steps {
        run_step(session, step)?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestResult {
    pub name: String,
    pub outcome: Outcome,
}

/// Outcomes of a suite run, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    pub results: Vec<TestResult>,
}

impl Report {
    pub fn passed(&self) -> usize {
        self.results
            .iter()
            .filter(|result| result.outcome == Outcome::Passed)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.passed()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for result in &self.results {
            match &result.outcome {
                Outcome::Passed => writeln!(f, "test {} ... ok", result.name)?,
                Outcome::Failed(reason) => writeln!(f, "test {} ... FAILED: {reason}", result.name)?,
            }
        }
        let verdict = if self.is_success() { "ok" } else { "FAILED" };
        write!(
            f,
            "test result: {verdict}. {} passed; {} failed",
            self.passed(),
            self.failed()
        )
    }
}

/// Run the tests whose name contains `pattern` (all of them without one).
pub fn run_suite<B, P, D>(
    session: &mut Session<B, P, D>,
    tests: &[ScenarioTest],
    pattern: Option<&str>,
) -> Report
where
    B: CanBus,
    P: PowerControl,
    D: Delay,
{
    let mut report = Report::default();
    for test in tests
        .iter()
        .filter(|test| pattern.map_or(true, |pattern| test.name.contains(pattern)))
    {
        info!("running {}", test.name);
        let outcome = match run_test(session, test) {
            Ok(()) => Outcome::Passed,
            Err(err) => {
                error!("{} failed: {err}", test.name);
                Outcome::Failed(err.to_string())
            }
        };
        report.results.push(TestResult {
            name: test.name.to_owned(),
            outcome,
        });
    }
    report
}

/// Built-in suite for a module variant.
pub fn suite(variant: ModuleVariant) -> Result<Vec<ScenarioTest>, FrameError> {
    match variant {
        ModuleVariant::Tail | ModuleVariant::TailFuel => Ok(tail_suite()),
        ModuleVariant::Pdm => pdm_suite(),
    }
}

const TAIL_FLAGS: [&str; 10] = [
    "brake_on",
    "brake_requested",
    "lights_on",
    "lights_requested",
    "rain_on",
    "rain_requested",
    "reverse_on",
    "reverse_requested",
    "engine_running",
    "can_idle",
];

/// Every tail lamp flag false except the named ones.
fn tail_lamps(on: &[&'static str]) -> Vec<Check> {
    TAIL_FLAGS[..8]
        .iter()
        .map(|&name| Check::flag(name, on.contains(&name)))
        .collect()
}

fn command(message: Outbound) -> [Step; 3] {
    [Step::Send(message), Step::Sleep(REACTION_TIME), Step::Drain]
}

fn light_steps(request: LightRequest, on: &[&'static str]) -> [Step; 3] {
    [
        Step::Send(Outbound::Lights(request)),
        Step::Drain,
        Step::ExpectStatus(tail_lamps(on)),
    ]
}

fn can_idle_test() -> ScenarioTest {
    ScenarioTest {
        name: "can_idle",
        steps: vec![
            Step::ExpectStatus(vec![Check::flag("can_idle", false)]),
            Step::Sleep(IDLE_WAIT),
            Step::Drain,
            Step::ExpectStatus(vec![Check::flag("can_idle", true)]),
        ],
    }
}

pub fn tail_suite() -> Vec<ScenarioTest> {
    let mut status_after_reset: Vec<Check> =
        TAIL_FLAGS.iter().map(|&name| Check::flag(name, false)).collect();
    status_after_reset.push(Check::flag("debug_enable", true));

    let brake = |applied| Outbound::Brake { applied };

    let mut brake_apply = vec![Step::ExpectStatus(vec![Check::flag("brake_requested", false)])];
    brake_apply.extend(command(brake(true)));
    // Engine is off, so the lamps stay in the reminder pattern
    brake_apply.push(Step::ExpectStatus(vec![
        Check::flag("brake_requested", true),
        Check::flag("brake_on", false),
    ]));
    brake_apply.extend(command(brake(false)));
    brake_apply.push(Step::ExpectStatus(vec![Check::flag("brake_requested", false)]));
    brake_apply.extend(command(brake(true)));
    brake_apply.push(Step::ExpectStatus(vec![
        Check::flag("brake_requested", true),
        Check::flag("brake_on", false),
    ]));

    let mut lights_test = vec![Step::ExpectStatus(tail_lamps(&[]))];
    lights_test.extend(light_steps(
        LightRequest {
            tail: true,
            ..LightRequest::default()
        },
        &["lights_on", "lights_requested"],
    ));
    lights_test.extend(light_steps(
        LightRequest {
            reverse: true,
            ..LightRequest::default()
        },
        &["reverse_on", "reverse_requested"],
    ));
    lights_test.extend(light_steps(LightRequest::default(), &[]));

    vec![
        ScenarioTest {
            name: "get_status",
            steps: vec![Step::ExpectStatus(status_after_reset)],
        },
        can_idle_test(),
        ScenarioTest {
            name: "brake_apply",
            steps: brake_apply,
        },
        ScenarioTest {
            name: "lights",
            steps: lights_test,
        },
    ]
}

fn scanner_request(prefix: &[u8]) -> Step {
    Step::ExpectFrame {
        id: ISO_TP_SCANNER_ID,
        prefix: prefix.to_vec(),
    }
}

fn dde_reply(payload: [u8; 8]) -> Result<Step, FrameError> {
    Ok(Step::SendRaw(Frame::standard(ISO_TP_DDE_ID, &payload)?))
}

pub fn pdm_suite() -> Result<Vec<ScenarioTest>, FrameError> {
    let get_status = vec![
        Check::field("engine_rpm", 0),
        Check::field("selected_gear", 0),
        Check::flag("brake_applied", false),
        Check::flag("lights_on", false),
        Check::flag("rain_on", false),
        Check::flag("can_idle", false),
        Check::flag("keypad_active", false),
        Check::flag("start_inhibited", true),
        Check::flag("start_waiting", false),
        Check::flag("starting", false),
        Check::flag("debug_enable", true),
    ];

    let brake_lamp = |on| Step::ExpectMessage {
        kind: "LightControl",
        checks: vec![Check::flag("brake", on)],
    };
    let mut brake = vec![
        Step::ExpectStatus(vec![Check::flag("brake_applied", false)]),
        brake_lamp(false),
    ];
    brake.extend(command(Outbound::Brake { applied: true }));
    brake.push(Step::ExpectStatus(vec![Check::flag("brake_applied", true)]));
    brake.push(brake_lamp(true));

    // Diagnostic scanner exchange with a simulated engine controller
    let scan_request = [0x12, 0x10, 0x10, 0x2c, 0x10];
    let bmw_scan = vec![
        scanner_request(&scan_request),
        dde_reply([0xf1, 0x30, 0, 0, 0, 0, 0, 0])?,
        scanner_request(&[0x12, 0x21]),
        scanner_request(&[0x12, 0x22]),
        dde_reply([0xf1, 0x10, 0x0d, 0, 0, 0, 0, 0])?,
        scanner_request(&[0x12, 0x30]),
        dde_reply([0xf1, 0x21, 0, 0, 0, 0, 0, 0])?,
        dde_reply([0xf1, 0x22, 0, 0, 0, 0, 0, 0])?,
        Step::ExpectFrame {
            id: 0x700,
            prefix: Vec::new(),
        },
        Step::ExpectFrame {
            id: 0x701,
            prefix: Vec::new(),
        },
        scanner_request(&[0x12, 0x02, 0x2c, 0x10]),
        scanner_request(&scan_request),
    ];

    Ok(vec![
        ScenarioTest {
            name: "get_status",
            steps: vec![Step::ExpectStatus(get_status)],
        },
        can_idle_test(),
        ScenarioTest {
            name: "brake",
            steps: brake,
        },
        ScenarioTest {
            name: "bmw_scan",
            steps: bmw_scan,
        },
    ])
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    use super::*;
    use crate::can_decoder::{self, decode_any};
    use crate::can_encoder;
    use crate::catalog::{Catalog, SIGN_ON_ID};
    use crate::config::SessionConfig;
    use crate::error::{BusError, PowerError};
    use crate::mock::MockBus;
    use crate::power::{ManualPower, PowerState};

    const STATUS_PERIOD: Duration = Duration::from_millis(250);
    const IDLE_AFTER: Duration = Duration::from_secs(1);
    const SIGN_ON_DELAY: Duration = Duration::from_millis(10);

    /// Tail module firmware reduced to what the suite observes, running in
    /// virtual time.
    struct TailSim {
        catalog: Catalog,
        now: Duration,
        powered: bool,
        silent: bool,
        pending: VecDeque<(Duration, Frame)>,
        next_status: Duration,
        last_rx: Duration,
        debug: bool,
        brake_requested: bool,
        lights: bool,
        rain: bool,
        reverse: bool,
    }

    type Shared = Rc<RefCell<TailSim>>;

    impl TailSim {
        fn new(variant: ModuleVariant) -> Shared {
            Rc::new(RefCell::new(TailSim {
                catalog: Catalog::for_variant(variant).unwrap(),
                now: Duration::ZERO,
                powered: false,
                silent: false,
                pending: VecDeque::new(),
                next_status: Duration::ZERO,
                last_rx: Duration::ZERO,
                debug: false,
                brake_requested: false,
                lights: false,
                rain: false,
                reverse: false,
            }))
        }

        fn power_on(&mut self) {
            if self.powered || self.silent {
                return;
            }
            self.powered = true;
            self.debug = false;
            self.brake_requested = false;
            self.lights = false;
            self.rain = false;
            self.reverse = false;
            self.last_rx = self.now;
            self.next_status = self.now + STATUS_PERIOD;
            let ack = Frame::extended(SIGN_ON_ID, &[0, 0, 0, 0x12, 0x34, 0, 1, 2]).unwrap();
            self.pending.push_back((self.now + SIGN_ON_DELAY, ack));
        }

        fn power_off(&mut self) {
            self.powered = false;
            self.pending.clear();
        }

        fn handle(&mut self, frame: &Frame) {
            if !self.powered {
                return;
            }
            self.last_rx = self.now;
            let Some(Ok(message)) = decode_any(&self.catalog, frame) else {
                return;
            };
            match message.name() {
                "BrakeControl" => {
                    self.brake_requested = message.field("brake_state").unwrap() == 32
                }
                "LightControl" => {
                    self.lights = message.flag("tail").unwrap();
                    self.rain = message.flag("rain").unwrap();
                    self.reverse = message.flag("reverse").unwrap();
                }
                "DebugControl" => self.debug = message.field("enable").unwrap() != 0,
                _ => {}
            }
        }

        fn status_frame(&self) -> Frame {
            let definition = self.catalog.status().unwrap();
            let idle = self.now - self.last_rx >= IDLE_AFTER;
            can_encoder::encode(
                &definition,
                &[],
                &[
                    // Engine is never running on the bench, so no lamp follows the pedal
                    ("brake_on", false),
                    ("brake_requested", self.brake_requested),
                    ("lights_on", self.lights),
                    ("lights_requested", self.lights),
                    ("rain_on", self.rain),
                    ("rain_requested", self.rain),
                    ("reverse_on", self.reverse),
                    ("reverse_requested", self.reverse),
                    ("can_idle", idle),
                    ("debug_enable", self.debug),
                ],
            )
            .unwrap()
        }

        fn recv(&mut self, timeout: Duration) -> Option<Frame> {
            let deadline = self.now + timeout;
            if !self.powered {
                self.now = deadline;
                return None;
            }
            // Statuses missed while the harness slept coalesce into one
            self.next_status = self.next_status.max(self.now);
            if let Some(&(at, frame)) = self.pending.front() {
                if at <= deadline && at <= self.next_status {
                    self.pending.pop_front();
                    self.now = self.now.max(at);
                    return Some(frame);
                }
            }
            if self.next_status <= deadline {
                self.now = self.next_status;
                self.next_status = self.now + STATUS_PERIOD;
                return Some(self.status_frame());
            }
            self.now = deadline;
            None
        }
    }

    struct SimBus(Shared);

    impl CanBus for SimBus {
        fn send(&mut self, frame: &Frame) -> Result<(), BusError> {
            self.0.borrow_mut().handle(frame);
            Ok(())
        }

        fn recv(&mut self, timeout: Duration) -> Result<Option<Frame>, BusError> {
            Ok(self.0.borrow_mut().recv(timeout))
        }
    }

    struct SimPower(Shared);

    impl PowerControl for SimPower {
        fn set_power_off(&mut self) -> Result<(), PowerError> {
            self.0.borrow_mut().power_off();
            Ok(())
        }

        fn set_power_t30(&mut self) -> Result<(), PowerError> {
            self.0.borrow_mut().power_on();
            Ok(())
        }

        fn set_power_t30_t15(&mut self) -> Result<(), PowerError> {
            self.0.borrow_mut().power_on();
            Ok(())
        }
    }

    struct SimDelay(Shared);

    impl Delay for SimDelay {
        fn delay(&mut self, duration: Duration) {
            self.0.borrow_mut().now += duration;
        }
    }

    fn sim_session(sim: &Shared) -> Session<SimBus, SimPower, SimDelay> {
        let catalog = sim.borrow().catalog.clone();
        Session::new(
            catalog,
            SimBus(sim.clone()),
            SimPower(sim.clone()),
            SimDelay(sim.clone()),
            SessionConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_tail_suite_passes_against_simulated_module() {
        for variant in [ModuleVariant::Tail, ModuleVariant::TailFuel] {
            let sim = TailSim::new(variant);
            let mut session = sim_session(&sim);
            let report = run_suite(&mut session, &suite(variant).unwrap(), None);
            assert!(report.is_success(), "{variant}: {report}");
            assert_eq!(report.passed(), 4);
            assert_eq!(session.power_state(), PowerState::Off);
            assert!(!sim.borrow().powered);
        }
    }

    #[test]
    fn test_pattern_selects_tests() {
        let sim = TailSim::new(ModuleVariant::Tail);
        let mut session = sim_session(&sim);
        let report = run_suite(&mut session, &tail_suite(), Some("brake"));
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].name, "brake_apply");
        assert_eq!(
            report.to_string(),
            "test brake_apply ... ok\ntest result: ok. 1 passed; 0 failed"
        );

        let report = run_suite(&mut session, &tail_suite(), Some("nothing matches"));
        assert!(report.results.is_empty());
    }

    #[test]
    fn test_failed_check_still_powers_off() {
        let sim = TailSim::new(ModuleVariant::Tail);
        let mut session = sim_session(&sim);
        let test = ScenarioTest {
            name: "wrong_expectation",
            steps: vec![Step::ExpectStatus(vec![Check::flag("lights_on", true)])],
        };
        let err = run_test(&mut session, &test).unwrap_err();
        match err {
            ScenarioError::Check(reason) => {
                assert_eq!(reason, "TailStatus.lights_on is false, expected true")
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(session.power_state(), PowerState::Off);
    }

    #[test]
    fn test_silent_module_fails_every_test() {
        let sim = TailSim::new(ModuleVariant::Tail);
        sim.borrow_mut().silent = true;
        let mut session = sim_session(&sim);
        let report = run_suite(&mut session, &tail_suite(), None);
        assert_eq!(report.failed(), 4);
        for result in &report.results {
            assert_eq!(
                result.outcome,
                Outcome::Failed("no power-on message from module within 5000 ms".into())
            );
        }
    }

    #[test]
    fn test_unknown_check_name_is_decode_error() {
        let catalog = Catalog::for_variant(ModuleVariant::Pdm).unwrap();
        let definition = catalog.status().unwrap();
        let frame = Frame::standard(0x780, &[0x0B, 0xB8, b'P', 0x21, 0x01]).unwrap();
        let status = can_decoder::decode(&definition, &frame).unwrap();

        Check::field("engine_rpm", 3000).verify(&status).unwrap();
        Check::field("selected_gear", b'P' as i64).verify(&status).unwrap();
        Check::flag("brake_applied", true).verify(&status).unwrap();
        Check::flag("start_inhibited", true).verify(&status).unwrap();
        Check::flag("debug_enable", true).verify(&status).unwrap();
        assert!(matches!(
            Check::flag("brake_on", true).verify(&status),
            Err(ScenarioError::Session(SessionError::Decode(_)))
        ));
    }

    #[test]
    fn test_expect_frame_prefix() {
        let catalog = Catalog::for_variant(ModuleVariant::Pdm).unwrap();
        let request = Frame::standard(ISO_TP_SCANNER_ID, &[0x12, 0x10, 0x10, 0x2c, 0x10, 0, 0, 0])
            .unwrap();
        let bus = MockBus::with_responses([request, request]);
        let mut session = Session::new(
            catalog,
            bus,
            ManualPower::new(Box::new(std::io::sink())),
            crate::bus::StdDelay,
            SessionConfig::default(),
        )
        .unwrap();

        run_step(&mut session, &scanner_request(&[0x12, 0x10, 0x10, 0x2c])).unwrap();
        assert!(matches!(
            run_step(&mut session, &scanner_request(&[0x12, 0x21])),
            Err(ScenarioError::Check(_))
        ));
        assert!(matches!(
            run_step(&mut session, &scanner_request(&[0x12])),
            Err(ScenarioError::Session(SessionError::Timeout { .. }))
        ));
    }

    #[test]
    fn test_pdm_suite_shape() {
        let tests = suite(ModuleVariant::Pdm).unwrap();
        let names: Vec<_> = tests.iter().map(|test| test.name).collect();
        assert_eq!(names, ["get_status", "can_idle", "brake", "bmw_scan"]);

        let scan = &tests[3].steps;
        assert_eq!(
            scan[1],
            Step::SendRaw(Frame::standard(0x612, &[0xf1, 0x30, 0, 0, 0, 0, 0, 0]).unwrap())
        );
        assert_eq!(scan.len(), 12);
    }
}
