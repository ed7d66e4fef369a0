//! Test utility for probe handlers
//!
//! Example usage taken from the syscall correlator tests:
//! ```ignore
//! use probe_common::{event_check, test_runner::TestRunner};
//!
//! #[test]
//! fn connect_ipv4() {
//!     let runner = TestRunner::new();
//!     let correlator = build_correlator(runner.sender());
//!     runner
//!         .run(|| {
//!             correlator.sys_enter_connect(&ctx, SOCKADDR);
//!             correlator.security_socket_connect(&ctx, SOCKET, SOCKADDR, 16);
//!             correlator.sys_exit_connect(&ctx, 0);
//!         })
//!         .expect_event(event_check!(
//!             EventPayload::Connect,
//!             (port, 443, "destination port")
//!         ))
//!         .report()
//!         .assert();
//! }
//! ```

use tokio::sync::mpsc;

use crate::{EventSender, ProbeEvent, ThreadId};

/// TestReport is the TestResult output
#[must_use]
pub struct TestReport {
    /// Wheather or not the test passed
    pub success: bool,
    /// Output describing the failure
    pub lines: Vec<String>,
}

impl TestReport {
    /// Panic with the full report if any expectation failed.
    pub fn assert(self) {
        if !self.success {
            panic!("\n{}", self.lines.join("\n"));
        }
    }
}

/// TestRunner collects into a TestResult all events produced by the
/// given trigger code.
pub struct TestRunner<T: ProbeEvent> {
    tx: mpsc::UnboundedSender<T>,
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T: ProbeEvent> Default for TestRunner<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ProbeEvent> TestRunner<T> {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// Sender to be given to the code under test.
    pub fn sender(&self) -> TestSender<T> {
        TestSender {
            tx: self.tx.clone(),
        }
    }

    /// Run the given triggering code and collect all events into a TestResult.
    pub fn run<F>(mut self, trigger_program: F) -> TestResult<T>
    where
        F: FnOnce(),
    {
        trigger_program();
        let events: Vec<_> = std::iter::from_fn(|| self.rx.try_recv().ok()).collect();
        TestResult {
            events,
            expectations: Vec::new(),
        }
    }
}

/// Simple EventSender used to collect events.
pub struct TestSender<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for TestSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> EventSender<T> for TestSender<T> {
    fn send(&self, event: T) {
        assert!(self.tx.send(event).is_ok());
    }
}

/// Events collected by the TestRunner
pub struct TestResult<T: ProbeEvent> {
    /// Collected events
    pub events: Vec<T>,

    /// Expectations for this test. These are checked by the `report`
    /// function and used to produce a TestReport.
    expectations: Vec<Expectation<T>>,
}

/// Expectation for a given test
enum Expectation<T: ProbeEvent> {
    /// The given predicate must match at least one of the generated events
    Predicate(Predicate<T>),
    /// At least one event must match all provided constraints
    Checks {
        /// Check the event comes from the given thread, if one is specified
        thread: Option<ThreadId>,
        /// List of checks on the event payload
        checks: Vec<Check<T::Payload>>,
    },
    /// Exactly this many events must have been produced
    Count(usize),
}

/// A `Predicate<T>` is a function which takes an event and returns if
/// an expectation is satisfied.
type Predicate<T> = Box<dyn Fn(&T) -> bool>;

impl<T: ProbeEvent> TestResult<T> {
    /// Assert the provided predicate matches at least one event
    pub fn expect(mut self, predicate: impl Fn(&T) -> bool + 'static) -> Self {
        self.expectations
            .push(Expectation::Predicate(Box::new(predicate)));
        self
    }

    /// Make sure there's an event matching all expectations.
    pub fn expect_event(mut self, checks: Vec<Check<T::Payload>>) -> Self {
        self.expectations.push(Expectation::Checks {
            thread: None,
            checks,
        });
        self
    }

    /// Make sure there's an event:
    /// - matching all expectations
    /// - coming from the specified thread.
    pub fn expect_event_from(mut self, thread: ThreadId, checks: Vec<Check<T::Payload>>) -> Self {
        self.expectations.push(Expectation::Checks {
            thread: Some(thread),
            checks,
        });
        self
    }

    /// Make sure exactly `count` events were produced.
    pub fn expect_count(mut self, count: usize) -> Self {
        self.expectations.push(Expectation::Count(count));
        self
    }

    /// Make sure no event was produced.
    pub fn expect_no_events(self) -> Self {
        self.expect_count(0)
    }

    /// Search among the produced events one which satisfies all expectations.
    pub fn report(self) -> TestReport {
        let events = self.events;
        let mut success = true;
        let mut lines = Vec::new();
        // print all events
        lines.push(format!("* {} events generated:", events.len()));
        events.iter().for_each(|e| lines.push(format!("| {e:?}")));
        lines.push(String::new());

        for expectation in self.expectations {
            match expectation {
                Expectation::Predicate(predicate) => {
                    let found = events.iter().any(|event| predicate(event));
                    if !found {
                        lines.push(format!("event not found among {} analyzed", events.len()));
                        success = false;
                    }
                }
                Expectation::Count(count) => {
                    if events.len() != count {
                        lines.push(format!("expected {count} events, found {}", events.len()));
                        success = false;
                    }
                }
                Expectation::Checks { thread, checks } => {
                    let candidates: Vec<&T> = events
                        .iter()
                        .filter(|event| thread.is_none_or(|thread| event.thread() == thread))
                        .collect();
                    if candidates.len() != events.len() {
                        lines.push(format!(
                            "{} events discarded by thread filter",
                            events.len() - candidates.len()
                        ));
                    }
                    success = run_checks(&candidates, checks, &mut lines) && success;
                }
            }
        }
        TestReport { success, lines }
    }
}

/// Make sure at least one event maches all checks.
pub fn run_checks<T: ProbeEvent>(
    events: &[&T],
    checks: Vec<Check<T::Payload>>,
    lines: &mut Vec<String>,
) -> bool {
    // for each event, run all checks
    let results: Vec<(&T, usize, Vec<CheckResult>)> = events
        .iter()
        .map(|event| {
            let results: Vec<CheckResult> = checks
                .iter()
                .map(|c| (c.check_fn)(event.payload()))
                .collect();
            let score = results.iter().filter(|x| x.success).count();
            (*event, score, results)
        })
        .collect();

    // check how many checks have passed
    let max_score = match results.iter().map(|x| x.1).max() {
        Some(max_score) => max_score,
        None => {
            lines.push("No events generated".to_string());
            return false;
        }
    };

    // if no event satisfies all cheks, we print a report table for each event
    if max_score != checks.len() {
        let best_results = results.into_iter().filter(|x| x.1 == max_score);
        for (event, score, check_results) in best_results {
            lines.push(format!(
                "* Only ({}/{}) matches for \"{:?}\"",
                score,
                checks.len(),
                event
            ));
            for (check_result, check) in check_results.iter().zip(checks.iter()) {
                if check_result.success {
                    lines.push(format!(
                        "✓ {}: {}",
                        check.description, check_result.expected
                    ));
                } else {
                    lines.push(format!("❌ {}: (FAIL)", check.description));
                    lines.push(format!("  |    found: {}", check_result.found));
                    lines.push(format!("  | expected: {}", check_result.expected));
                }
            }
            lines.push(String::new());
        }
        false
    } else {
        true
    }
}

/// A Check is an expectation about the payload of an event which should be emitted.
/// This allows to split test expectations in different lines, making it easier to spot the error.
/// Build this is using the `event_check!` macro.
pub struct Check<P> {
    pub description: &'static str,
    pub check_fn: CheckFunction<P>,
}

/// A `CheckFunction<P>` is a function which takes a payload and returns the description
/// of the test-result
type CheckFunction<P> = Box<dyn Fn(&P) -> CheckResult>;

impl<P> Check<P> {
    pub fn new(description: &'static str, check_fn: impl Fn(&P) -> CheckResult + 'static) -> Self {
        Self {
            description,
            check_fn: Box::new(check_fn),
        }
    }
}

pub struct CheckResult {
    /// Weather or not the event passed this test
    pub success: bool,
    /// String representation of the actual value produced
    pub found: String,
    /// String representation of the value which should have been produced
    pub expected: String,
}

/// event_check! makes it easy to build a list of checks for a given enum variant.
/// Example usage:
///
/// (...).expect_event(event_check!(
///    EventPayload::Ptrace,
///    (request, PTRACE_ATTACH, "request"),
///    (pid, 5000, "root namespace pid"),
///    (ns_pid, 100, "namespace pid")
/// ));
#[macro_export]
macro_rules! event_check {
    ($event:tt :: $subtype:tt, $(($left:ident, $right:expr, $description:literal)),*) => {
        {
            use $crate::test_runner::{Check, CheckResult};
            let mut checks = Vec::new();
            checks.push(Check::new("event type", move |payload: &$event| {
                CheckResult {
                    success: matches!(payload, $event::$subtype {..}),
                    found: format!("{:?}", payload),
                    expected: stringify!($event::$subtype).to_string(),
                }
            }));
            $(
                let expected_value = $right;
                checks.push(Check::new(
                    $description,
                    move |payload: &$event| match payload {
                        $event::$subtype { $left, .. } => CheckResult {
                            success: *$left == expected_value,
                            found: format!("{:?}", $left),
                            expected: format!("{:?}", expected_value),
                        },
                        #[allow(unreachable_patterns)]
                        _ => CheckResult {
                            success: false,
                            found: format!("wrong variant"),
                            expected: format!("{:?}", expected_value),
                        },
                    },
                ));
            )*
            checks
        }
    }
}
