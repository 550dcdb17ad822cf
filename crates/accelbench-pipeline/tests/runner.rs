use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use accelbench_core::{
    AccelError, BenchEvent, ComputeTask, DeviceDescriptor, LogLevel, Phase, Result,
};
use accelbench_pipeline::{BenchmarkRunner, RunnerConfig};

#[derive(Default)]
struct CountingTask {
    setups: usize,
    executes: usize,
    teardowns: usize,
    fail_setup: bool,
    fail_on_execute: Option<usize>,
    bad_output: bool,
    sleep: Duration,
}

impl ComputeTask for CountingTask {
    fn name(&self) -> &str {
        "counting"
    }

    fn setup(&mut self, capacity_hint: usize) -> Result<()> {
        assert!(capacity_hint > 0);
        self.setups += 1;
        if self.fail_setup {
            return Err(AccelError::DeviceOutOfMemory {
                requested: capacity_hint,
                available: 0,
            });
        }
        Ok(())
    }

    fn execute(&mut self) -> Result<()> {
        if self.fail_on_execute == Some(self.executes) {
            return Err(AccelError::Execution("device lost".into()));
        }
        self.executes += 1;
        std::thread::sleep(self.sleep);
        Ok(())
    }

    fn teardown(&mut self) {
        self.teardowns += 1;
    }

    fn verify(&self) -> Result<()> {
        if self.bad_output {
            return Err(AccelError::Execution("output mismatch".into()));
        }
        Ok(())
    }
}

fn runner(iterations: usize, warmup_iterations: usize) -> BenchmarkRunner {
    BenchmarkRunner::new(
        DeviceDescriptor::new("test", "test:0"),
        RunnerConfig {
            batch_size: 1000,
            iterations,
            warmup_iterations,
        },
    )
}

#[test]
fn warmup_then_timed_iterations() {
    let mut task = CountingTask {
        sleep: Duration::from_millis(1),
        ..Default::default()
    };
    let result = runner(5, 3).run(&mut task).unwrap();

    assert_eq!(task.setups, 1);
    assert_eq!(task.executes, 8);
    assert_eq!(task.teardowns, 1);

    assert_eq!(result.task_name, "counting");
    assert_eq!(result.backend_label, "test");
    assert_eq!(result.device_label, "test:0");
    assert_eq!(result.iterations, 5);
    assert_eq!(result.batch_size, 1000);
    assert!(result.avg_latency_ms >= 1.0);
    assert!(result.p95_latency_ms >= result.avg_latency_ms * 0.5);
    // At most 1000 elements per millisecond.
    assert!(result.throughput_elements_per_sec <= 1_000_000.0);
    assert!(result.throughput_elements_per_sec > 0.0);
}

#[test]
fn invalid_config_touches_nothing() {
    let mut task = CountingTask::default();
    let err = runner(0, 1).run(&mut task).unwrap_err();
    assert!(err.is_configuration_error());
    assert_eq!(task.setups, 0);
    assert_eq!(task.teardowns, 0);
}

#[test]
fn setup_failure_is_reported_before_timing() {
    let mut task = CountingTask {
        fail_setup: true,
        ..Default::default()
    };
    let err = runner(5, 1).run(&mut task).unwrap_err();
    assert!(err.is_setup_failure());
    assert_eq!(task.executes, 0);
    assert_eq!(task.teardowns, 1);
}

#[test]
fn execution_failure_still_tears_down_once() {
    let mut task = CountingTask {
        fail_on_execute: Some(4),
        ..Default::default()
    };
    let err = runner(10, 2).run(&mut task).unwrap_err();
    assert!(err.is_execution_failure());
    assert_eq!(task.executes, 4);
    assert_eq!(task.teardowns, 1);
}

#[test]
fn verification_mismatch_warns_but_returns_result() {
    let mut task = CountingTask {
        bad_output: true,
        ..Default::default()
    };
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut runner = runner(3, 0);
    {
        let events = events.clone();
        runner.subscribe(Arc::new(move |event: &BenchEvent| {
            events.lock().push(event.clone());
        }));
    }

    let result = runner.run(&mut task).unwrap();
    assert_eq!(result.iterations, 3);

    let events = events.lock();
    assert!(events.iter().any(|e| matches!(
        e,
        BenchEvent::Log {
            level: LogLevel::Warn,
            ..
        }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        BenchEvent::PhaseCompleted {
            phase: Phase::Timed,
            ..
        }
    )));
    // No warmup phase when warmup_iterations is 0.
    assert!(!events.iter().any(|e| matches!(
        e,
        BenchEvent::PhaseStarted {
            phase: Phase::Warmup,
            ..
        }
    )));
}
