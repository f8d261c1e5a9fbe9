//! Entry points called by instrumented code.
//!
//! [`Bridge`] owns a write-once [`CallbackRegistry`] and a [`Breakpoint`].
//! Probe call sites cannot carry a context object, so the crate also keeps a
//! single process-wide bridge behind the free functions [`arm`], [`on_step`]
//! and [`on_branch`]. Independent `Bridge` values are useful for embedding
//! and tests.

use crate::breakpoint::{Breakpoint, HaltController};
use crate::config::{BranchMode, BridgeConfig};
use crate::event::InstructionEvent;
use crate::handler::{BranchHandler, StepHandler};
use crate::registry::{BridgeState, CallbackRegistry};
use log::{debug, error, info, trace};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Bridge is already armed; handlers cannot be replaced")]
    AlreadyArmed,
    #[error("Bridge dispatched an event before arming: no {0} handler registered")]
    Unarmed(&'static str),
}

pub struct Bridge {
    registry: OnceLock<CallbackRegistry>,
    active: AtomicBool,
    breakpoint: Breakpoint,
}

impl Bridge {
    pub const fn new() -> Self {
        Self {
            registry: OnceLock::new(),
            active: AtomicBool::new(false),
            breakpoint: Breakpoint::new(),
        }
    }

    pub fn arm(
        &self,
        step: Arc<dyn StepHandler>,
        branch: Arc<dyn BranchHandler>,
    ) -> Result<(), BridgeError> {
        self.install(CallbackRegistry::new(step, branch))
    }

    pub fn arm_with_config(
        &self,
        step: Arc<dyn StepHandler>,
        branch: Arc<dyn BranchHandler>,
        config: &BridgeConfig,
    ) -> Result<(), BridgeError> {
        self.install(CallbackRegistry::with_mode(step, branch, config.branch_mode))
    }

    /// Installs `registry` if no handlers were registered yet.
    pub fn install(&self, registry: CallbackRegistry) -> Result<(), BridgeError> {
        let mode = registry.branch_mode();
        self.registry
            .set(registry)
            .map_err(|_| BridgeError::AlreadyArmed)?;
        info!("concolic bridge armed (branch mode: {mode:?})");
        Ok(())
    }

    pub fn state(&self) -> BridgeState {
        if self.registry.get().is_none() {
            BridgeState::Uninitialized
        } else if self.active.load(Ordering::Acquire) {
            BridgeState::Active
        } else {
            BridgeState::Armed
        }
    }

    fn registry(&self, slot: &'static str) -> &CallbackRegistry {
        match self.registry.get() {
            Some(registry) => {
                if !self.active.load(Ordering::Relaxed) {
                    self.active.store(true, Ordering::Release);
                }
                registry
            }
            None => {
                error!("{}", BridgeError::Unarmed(slot));
                std::process::abort()
            }
        }
    }

    /// Reports one executed instruction to the step handler.
    ///
    /// # Aborts
    /// If the bridge is not armed, the error is logged and the process is
    /// aborted. The event cannot be dropped without desynchronizing the
    /// engine's view of the run, and unwinding would only end the calling
    /// thread.
    pub fn on_step(&self, event: &InstructionEvent) {
        let registry = self.registry("step");
        trace!("step {}", event.id());
        registry.step_handler().on_step(event);
    }

    /// Asks the branch handler whether the engine must intervene at this
    /// branch, and fires the breakpoint if it says so.
    ///
    /// # Aborts
    /// If the bridge is not armed, like [`Bridge::on_step`].
    pub fn on_branch(&self, event: &InstructionEvent) {
        let registry = self.registry("branch");
        let need = registry.branch_handler().choose_branch(event);
        debug!("branch {} verdict: {need}", event.id());
        if need && registry.branch_mode() == BranchMode::Verdict {
            self.trigger();
        }
    }

    pub fn trigger(&self) -> u64 {
        self.breakpoint.trigger()
    }

    pub fn trigger_count(&self) -> u64 {
        self.breakpoint.hits()
    }

    pub fn attach_controller(
        &self,
        controller: Arc<dyn HaltController>,
    ) -> Option<Arc<dyn HaltController>> {
        self.breakpoint.attach(controller)
    }

    pub fn detach_controller(&self) -> Option<Arc<dyn HaltController>> {
        self.breakpoint.detach()
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

static BRIDGE: Bridge = Bridge::new();

/// Registers the handlers of the process-wide bridge. Succeeds once per process.
pub fn arm(step: Arc<dyn StepHandler>, branch: Arc<dyn BranchHandler>) -> Result<(), BridgeError> {
    BRIDGE.arm(step, branch)
}

pub fn arm_with_config(
    step: Arc<dyn StepHandler>,
    branch: Arc<dyn BranchHandler>,
    config: &BridgeConfig,
) -> Result<(), BridgeError> {
    BRIDGE.arm_with_config(step, branch, config)
}

pub fn on_step(event: &InstructionEvent) {
    BRIDGE.on_step(event)
}

pub fn on_branch(event: &InstructionEvent) {
    BRIDGE.on_branch(event)
}

pub fn trigger_count() -> u64 {
    BRIDGE.trigger_count()
}

pub fn state() -> BridgeState {
    BRIDGE.state()
}

pub fn attach_controller(controller: Arc<dyn HaltController>) -> Option<Arc<dyn HaltController>> {
    BRIDGE.attach_controller(controller)
}

pub fn detach_controller() -> Option<Arc<dyn HaltController>> {
    BRIDGE.detach_controller()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{BreakOnEveryBranch, NeverBreak, NoOpStepHandler};
    use crate::trace::TraceRecorder;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[derive(Default)]
    struct HaltLog {
        hits: Mutex<Vec<u64>>,
    }

    impl HaltController for HaltLog {
        fn on_halt(&self, hit: u64) {
            self.hits.lock().unwrap().push(hit);
        }
    }

    fn armed(branch: Arc<dyn BranchHandler>) -> Bridge {
        let bridge = Bridge::new();
        bridge.arm(Arc::new(NoOpStepHandler), branch).unwrap();
        bridge
    }

    #[test]
    fn state_moves_forward_only() {
        let bridge = Bridge::new();
        assert_eq!(bridge.state(), BridgeState::Uninitialized);
        bridge
            .arm(Arc::new(NoOpStepHandler), Arc::new(NeverBreak))
            .unwrap();
        assert_eq!(bridge.state(), BridgeState::Armed);
        bridge.on_step(&InstructionEvent::new(1));
        assert_eq!(bridge.state(), BridgeState::Active);
        assert_eq!(
            bridge.arm(Arc::new(NoOpStepHandler), Arc::new(NeverBreak)),
            Err(BridgeError::AlreadyArmed)
        );
        assert_eq!(bridge.state(), BridgeState::Active);
    }

    #[test]
    fn step_handler_sees_each_event_once_in_order() {
        let bridge = Bridge::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        bridge
            .arm(
                Arc::new(move |event: &InstructionEvent| sink.lock().unwrap().push(event.clone())),
                Arc::new(NeverBreak),
            )
            .unwrap();

        let events: Vec<InstructionEvent> = (10..15).map(InstructionEvent::new).collect();
        for event in &events {
            bridge.on_step(event);
        }
        assert_eq!(*log.lock().unwrap(), events);
        assert_eq!(bridge.trigger_count(), 0);
    }

    #[test]
    fn false_verdict_leaves_counter_unchanged() {
        let bridge = armed(Arc::new(NeverBreak));
        let halts = Arc::new(HaltLog::default());
        bridge.attach_controller(halts.clone());
        for id in 0..10 {
            bridge.on_branch(&InstructionEvent::new(id));
        }
        assert_eq!(bridge.trigger_count(), 0);
        assert!(halts.hits.lock().unwrap().is_empty());
    }

    #[test]
    fn true_verdict_halts_exactly_once() {
        let bridge = armed(Arc::new(BreakOnEveryBranch));
        let halts = Arc::new(HaltLog::default());
        bridge.attach_controller(halts.clone());

        bridge.on_branch(&InstructionEvent::new(1));
        assert_eq!(bridge.trigger_count(), 1);
        assert_eq!(*halts.hits.lock().unwrap(), vec![1]);
    }

    #[test]
    fn consecutive_true_verdicts_add_two_despite_steps() {
        let bridge = armed(Arc::new(BreakOnEveryBranch));
        let before = bridge.trigger_count();
        bridge.on_branch(&InstructionEvent::new(1));
        bridge.on_step(&InstructionEvent::new(2));
        bridge.on_step(&InstructionEvent::new(3));
        bridge.on_branch(&InstructionEvent::new(4));
        assert_eq!(bridge.trigger_count(), before + 2);
    }

    #[test]
    fn branch_ids_scenario_fires_once_for_42() {
        let bridge = Bridge::new();
        let recorder = Arc::new(
            TraceRecorder::new()
                .with_verdict(Arc::new(|event: &InstructionEvent| event.id() == 42)),
        );
        bridge.arm(recorder.clone(), recorder.clone()).unwrap();
        let halts = Arc::new(HaltLog::default());
        bridge.attach_controller(halts.clone());

        for id in [1, 42, 7] {
            bridge.on_branch(&InstructionEvent::new(id));
        }
        assert_eq!(recorder.snapshot().instruction_ids(), vec![1, 42, 7]);
        assert_eq!(*halts.hits.lock().unwrap(), vec![1]);
        assert_eq!(bridge.trigger_count(), 1);
    }

    #[test]
    fn notify_only_mode_never_triggers() {
        let bridge = Bridge::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let config = BridgeConfig {
            branch_mode: BranchMode::NotifyOnly,
            ..Default::default()
        };
        bridge
            .arm_with_config(
                Arc::new(NoOpStepHandler),
                Arc::new(move |_: &InstructionEvent| {
                    counted.fetch_add(1, Ordering::SeqCst);
                    true
                }),
                &config,
            )
            .unwrap();

        bridge.on_branch(&InstructionEvent::new(1));
        bridge.on_branch(&InstructionEvent::new(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(bridge.trigger_count(), 0);
    }

    const UNARMED_CHILD: &str = "CONCOLIC_BRIDGE_UNARMED_CHILD";

    /// Re-runs `test` in a child process with [`UNARMED_CHILD`] set and
    /// returns its exit status.
    fn run_as_child(test: &str) -> std::process::ExitStatus {
        std::process::Command::new(std::env::current_exe().unwrap())
            .args([test, "--exact", "--test-threads=1"])
            .env(UNARMED_CHILD, "1")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .unwrap()
    }

    fn assert_aborted(status: std::process::ExitStatus) {
        assert!(!status.success(), "child exited cleanly: {status}");
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            assert_eq!(status.signal(), Some(6), "expected SIGABRT, got {status}");
        }
    }

    #[test]
    fn step_before_arming_aborts_process() {
        if std::env::var_os(UNARMED_CHILD).is_some() {
            Bridge::new().on_step(&InstructionEvent::new(1));
            return;
        }
        assert_aborted(run_as_child("dispatcher::tests::step_before_arming_aborts_process"));
    }

    #[test]
    fn branch_before_arming_aborts_process() {
        if std::env::var_os(UNARMED_CHILD).is_some() {
            Bridge::new().on_branch(&InstructionEvent::new(1));
            return;
        }
        assert_aborted(run_as_child("dispatcher::tests::branch_before_arming_aborts_process"));
    }

    #[test]
    #[should_panic(expected = "engine rejected instruction 9")]
    fn handler_panics_propagate_unchanged() {
        let bridge = Bridge::new();
        bridge
            .arm(
                Arc::new(|event: &InstructionEvent| {
                    if event.id() == 9 {
                        panic!("engine rejected instruction {}", event.id());
                    }
                }),
                Arc::new(NeverBreak),
            )
            .unwrap();
        bridge.on_step(&InstructionEvent::new(9));
    }

    #[test]
    fn two_threads_thousand_true_verdicts_each() {
        let bridge = Arc::new(armed(Arc::new(BreakOnEveryBranch)));
        let workers: Vec<_> = (0..2)
            .map(|t| {
                let bridge = Arc::clone(&bridge);
                thread::spawn(move || {
                    for i in 0..1000 {
                        bridge.on_branch(&InstructionEvent::new(t * 1000 + i));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(bridge.trigger_count(), 2000);
    }
}
