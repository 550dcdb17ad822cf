use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use accelbench_core::{
    AccelError, BenchEvent, ComputeTask, DoubleBufferedTask, ExecutionStream, Phase, Result, Slot,
    SlotPair,
};
use accelbench_device::{DeviceContext, DeviceContextConfig, TransferModel};
use accelbench_kernels::{AffineParams, AffineTask};
use accelbench_pipeline::{DoubleBufferedScheduler, SchedulerConfig};

fn device(streams: usize) -> Arc<DeviceContext> {
    Arc::new(
        DeviceContext::new(DeviceContextConfig {
            pool_size: 64 << 20,
            stream_count: streams,
            transfer: TransferModel::instant(),
            ..Default::default()
        })
        .unwrap(),
    )
}

fn config(iterations: usize) -> SchedulerConfig {
    SchedulerConfig {
        batch_size: 64,
        iterations,
        warmup_iterations: 1,
    }
}

#[derive(Default)]
struct SlotState {
    data: Mutex<Vec<f32>>,
    /// Set when work is issued for the slot, cleared when its copy-out runs.
    in_flight: AtomicBool,
}

/// Sleeps on the issuing stream to model copy and kernel time.
struct MockTask {
    transfer: Duration,
    compute: Duration,
    slots: Option<SlotPair<Arc<SlotState>>>,
    fail_on_launch: Option<usize>,
    launches: usize,
    setup_calls: Arc<AtomicUsize>,
    teardown_calls: Arc<AtomicUsize>,
    slot_reuse_detected: Arc<AtomicBool>,
}

impl MockTask {
    fn new(transfer_ms: u64, compute_ms: u64) -> Self {
        Self {
            transfer: Duration::from_millis(transfer_ms),
            compute: Duration::from_millis(compute_ms),
            slots: None,
            fail_on_launch: None,
            launches: 0,
            setup_calls: Arc::default(),
            teardown_calls: Arc::default(),
            slot_reuse_detected: Arc::default(),
        }
    }

    fn slot(&self, slot: Slot) -> Result<Arc<SlotState>> {
        self.slots
            .as_ref()
            .map(|pair| pair[slot].clone())
            .ok_or_else(|| AccelError::Execution("not set up".into()))
    }
}

impl ComputeTask for MockTask {
    fn name(&self) -> &str {
        "mock"
    }

    fn setup(&mut self, _capacity_hint: usize) -> Result<()> {
        unreachable!("the scheduler only uses setup_double_buffered")
    }

    fn execute(&mut self) -> Result<()> {
        unreachable!("the scheduler never calls execute")
    }

    fn teardown(&mut self) {
        self.teardown_calls.fetch_add(1, Ordering::SeqCst);
        self.slots = None;
    }
}

impl DoubleBufferedTask for MockTask {
    fn setup_double_buffered(
        &mut self,
        capacity_hint: usize,
        stream_a: &dyn ExecutionStream,
        stream_b: &dyn ExecutionStream,
    ) -> Result<()> {
        assert_ne!(stream_a.index(), stream_b.index());
        self.setup_calls.fetch_add(1, Ordering::SeqCst);
        self.slots = Some(SlotPair::new(
            Arc::new(SlotState {
                data: Mutex::new(vec![0.0; capacity_hint]),
                ..Default::default()
            }),
            Arc::new(SlotState {
                data: Mutex::new(vec![0.0; capacity_hint]),
                ..Default::default()
            }),
        ));
        Ok(())
    }

    fn copy_in(&mut self, slot: Slot, stream: &dyn ExecutionStream) -> Result<()> {
        let state = self.slot(slot)?;
        if state.in_flight.swap(true, Ordering::SeqCst) {
            self.slot_reuse_detected.store(true, Ordering::SeqCst);
        }
        let delay = self.transfer;
        stream.enqueue(Box::new(move || -> Result<()> {
            std::thread::sleep(delay);
            state.data.lock().fill(1.0);
            Ok(())
        }))
    }

    fn launch(&mut self, slot: Slot, stream: &dyn ExecutionStream) -> Result<()> {
        let state = self.slot(slot)?;
        let delay = self.compute;
        let fail = self.fail_on_launch == Some(self.launches);
        self.launches += 1;
        stream.enqueue(Box::new(move || -> Result<()> {
            if fail {
                return Err(AccelError::Execution("kernel fault".into()));
            }
            std::thread::sleep(delay);
            state.data.lock().iter_mut().for_each(|v| *v *= 3.0);
            Ok(())
        }))
    }

    fn copy_out(&mut self, slot: Slot, stream: &dyn ExecutionStream) -> Result<()> {
        let state = self.slot(slot)?;
        let delay = self.transfer;
        stream.enqueue(Box::new(move || -> Result<()> {
            std::thread::sleep(delay);
            state.in_flight.store(false, Ordering::SeqCst);
            Ok(())
        }))
    }

    fn host_output(&self, slot: Slot) -> Vec<f32> {
        self.slot(slot)
            .map(|s| s.data.lock().clone())
            .unwrap_or_default()
    }
}

#[test]
fn single_iteration_is_rejected_before_setup() {
    let ctx = device(2);
    let mut task = MockTask::new(0, 0);
    let setup_calls = task.setup_calls.clone();
    let teardown_calls = task.teardown_calls.clone();

    let err = DoubleBufferedScheduler::new(ctx, config(1))
        .run(&mut task)
        .unwrap_err();

    assert!(err.is_configuration_error());
    assert_eq!(setup_calls.load(Ordering::SeqCst), 0);
    assert_eq!(teardown_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn overlap_never_hurts_when_transfer_and_compute_are_comparable() {
    let ctx = device(2);
    let mut task = MockTask::new(2, 2);
    let teardown_calls = task.teardown_calls.clone();
    let reuse = task.slot_reuse_detected.clone();

    let result = DoubleBufferedScheduler::new(ctx.clone(), config(10))
        .run(&mut task)
        .unwrap();

    assert_eq!(result.result.iterations, 10);
    assert_eq!(result.result.task_name, "mock");
    assert!(result.single_buffer_avg_ms >= 6.0);
    assert!(
        result.speedup_factor >= 1.0,
        "speedup {} (single {} ms, overlapped {} ms)",
        result.speedup_factor,
        result.single_buffer_avg_ms,
        result.result.avg_latency_ms
    );
    assert!(result.overlap_percentage >= 0.0);
    assert!(!reuse.load(Ordering::SeqCst), "a slot was reissued while in flight");
    assert_eq!(teardown_calls.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.stream_pool.available(), ctx.stream_pool.pool_size());
}

#[test]
fn execution_failure_tears_down_once() {
    let ctx = device(2);
    let mut task = MockTask::new(0, 0);
    // Warmup (1) + baseline (4) + prime, then fail inside phase 2.
    task.fail_on_launch = Some(7);
    let teardown_calls = task.teardown_calls.clone();

    let err = DoubleBufferedScheduler::new(ctx.clone(), config(4))
        .run(&mut task)
        .unwrap_err();

    assert!(err.is_execution_failure());
    assert_eq!(teardown_calls.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.stream_pool.available(), ctx.stream_pool.pool_size());
}

#[test]
fn one_stream_is_not_enough() {
    let ctx = device(1);
    let mut task = MockTask::new(0, 0);
    let err = DoubleBufferedScheduler::new(ctx, config(4))
        .run(&mut task)
        .unwrap_err();
    assert!(err.is_setup_failure());
    assert_eq!(task.setup_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn affine_runs_both_phases_and_verifies() {
    let ctx = device(2);
    let mut task = AffineTask::new(ctx.clone(), AffineParams::default());
    let events = Arc::new(Mutex::new(Vec::new()));

    let mut scheduler = DoubleBufferedScheduler::new(
        ctx.clone(),
        SchedulerConfig {
            batch_size: 4096,
            iterations: 6,
            warmup_iterations: 2,
        },
    );
    {
        let events = events.clone();
        scheduler.subscribe(Arc::new(move |event: &BenchEvent| {
            events.lock().push(event.clone());
        }));
    }

    let result = scheduler.run(&mut task).unwrap();
    assert_eq!(result.result.task_name, "affine");
    assert_eq!(result.result.backend_label, "host-sim");
    assert_eq!(result.result.batch_size, 4096);
    assert!(result.single_buffer_p95_ms >= 0.0);
    assert_eq!(ctx.memory_pool.in_use(), 0);

    let events = events.lock();
    let phases: Vec<Phase> = events
        .iter()
        .filter_map(|e| match e {
            BenchEvent::PhaseStarted { phase, .. } => Some(*phase),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        vec![Phase::Warmup, Phase::SingleBuffered, Phase::DoubleBuffered]
    );
    let timed = events
        .iter()
        .filter(|e| matches!(e, BenchEvent::IterationCompleted { .. }))
        .count();
    assert_eq!(timed, 12);
    assert!(!events.iter().any(|e| matches!(e, BenchEvent::Log { .. })));
}
