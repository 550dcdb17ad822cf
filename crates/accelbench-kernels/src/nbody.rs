//! All-pairs softened gravity.
//!
//! Body state lives in two device-side copies; each step reads the current
//! copy, writes the other and flips. Positions are packed `[x, y, z, mass]`,
//! velocities `[vx, vy, vz, 0]`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use accelbench_core::{
    AccelError, ComputeTask, ExecutionStream, PingPong, Result, Slot, SlotPair,
};
use accelbench_device::{DeviceBuffer, DeviceContext, HostBuffer};

use crate::data_gen::DataGenerator;

const LANES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NBodyParams {
    pub dt: f32,
    pub softening: f32,
}

impl Default for NBodyParams {
    fn default() -> Self {
        Self {
            dt: 0.01,
            softening: 0.05,
        }
    }
}

#[derive(Clone)]
struct BodyState {
    pos: DeviceBuffer<f32>,
    vel: DeviceBuffer<f32>,
}

fn step_kernel(
    params: NBodyParams,
    pos: &[f32],
    vel: &[f32],
    pos_out: &mut [f32],
    vel_out: &mut [f32],
) {
    let eps2 = params.softening * params.softening;
    let bodies = pos.len() / LANES;

    for i in 0..bodies {
        let pi = &pos[i * LANES..i * LANES + LANES];
        let mut acc = [0.0f32; 3];
        for j in 0..bodies {
            if i == j {
                continue;
            }
            let pj = &pos[j * LANES..j * LANES + LANES];
            let d = [pj[0] - pi[0], pj[1] - pi[1], pj[2] - pi[2]];
            let r2 = d[0] * d[0] + d[1] * d[1] + d[2] * d[2] + eps2;
            let inv_r3 = 1.0 / (r2 * r2.sqrt());
            for k in 0..3 {
                acc[k] += pj[3] * d[k] * inv_r3;
            }
        }

        let base = i * LANES;
        for k in 0..3 {
            let v = vel[base + k] + acc[k] * params.dt;
            vel_out[base + k] = v;
            pos_out[base + k] = pi[k] + v * params.dt;
        }
        vel_out[base + 3] = 0.0;
        pos_out[base + 3] = pi[3];
    }
}

fn total_momentum(pos: &[f32], vel: &[f32]) -> ([f64; 3], f64) {
    let mut p = [0.0f64; 3];
    let mut scale = 0.0f64;
    for (b, v) in pos.chunks_exact(LANES).zip(vel.chunks_exact(LANES)) {
        let m = b[3] as f64;
        for k in 0..3 {
            let mv = m * v[k] as f64;
            p[k] += mv;
            scale += mv.abs();
        }
    }
    (p, scale)
}

pub struct NBodyTask {
    ctx: Arc<DeviceContext>,
    params: NBodyParams,
    state: Option<PingPong<BodyState>>,
    initial_momentum: [f64; 3],
    steps: u64,
}

impl NBodyTask {
    pub fn new(ctx: Arc<DeviceContext>, params: NBodyParams) -> Result<Self> {
        if !(params.dt > 0.0) || !(params.softening > 0.0) {
            return Err(AccelError::Configuration(
                "n_body: dt and softening must be > 0".into(),
            ));
        }
        Ok(Self {
            ctx,
            params,
            state: None,
            initial_momentum: [0.0; 3],
            steps: 0,
        })
    }

    pub fn params(&self) -> NBodyParams {
        self.params
    }

    /// Completed integration steps since `setup`.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Snapshot of the current positions, `[x, y, z, mass]` per body.
    pub fn positions(&self) -> Vec<f32> {
        self.state
            .as_ref()
            .map(|s| s.current().pos.with_contents(|p| p.to_vec()))
            .unwrap_or_default()
    }

    fn alloc_state(&self, bodies: usize) -> Result<BodyState> {
        let lanes = bodies
            .checked_mul(LANES)
            .ok_or(AccelError::DeviceOutOfMemory {
                requested: usize::MAX,
                available: self.ctx.memory_pool.capacity(),
            })?;
        Ok(BodyState {
            pos: self.ctx.memory_pool.alloc::<f32>(lanes)?,
            vel: self.ctx.memory_pool.alloc::<f32>(lanes)?,
        })
    }
}

impl ComputeTask for NBodyTask {
    fn name(&self) -> &str {
        "n_body"
    }

    fn setup(&mut self, capacity_hint: usize) -> Result<()> {
        if capacity_hint < 2 {
            return Err(AccelError::Configuration(
                "n_body: need at least two bodies".into(),
            ));
        }
        let bodies = capacity_hint;
        let pair = SlotPair::new(self.alloc_state(bodies)?, self.alloc_state(bodies)?);

        let mut gen = DataGenerator::default();
        let mut pos = gen.range_f32(bodies * LANES, -1.0, 1.0);
        let mut vel = gen.range_f32(bodies * LANES, -0.1, 0.1);
        let masses = gen.range_f32(bodies, 0.5, 1.5);
        for (i, m) in masses.into_iter().enumerate() {
            pos[i * LANES + 3] = m;
            vel[i * LANES + 3] = 0.0;
        }
        self.initial_momentum = total_momentum(&pos, &vel).0;

        let transfer = self.ctx.transfer();
        pair[Slot::Zero]
            .pos
            .upload(&HostBuffer::from_vec(pos), transfer);
        pair[Slot::Zero]
            .vel
            .upload(&HostBuffer::from_vec(vel), transfer);

        self.state = Some(PingPong::new(pair));
        self.steps = 0;
        tracing::debug!(bodies, "n_body state allocated");
        Ok(())
    }

    fn execute(&mut self) -> Result<()> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| AccelError::Execution("n_body: setup() was not called".into()))?;
        let (current, next) = state.step_mut();
        let (current, next) = (current.clone(), next.clone());
        let params = self.params;
        let transfer = *self.ctx.transfer();
        let stream = self.ctx.default_stream();

        stream.enqueue(Box::new(move || -> Result<()> {
            transfer.simulate_launch();
            current.pos.with_contents(|pos| {
                current.vel.with_contents(|vel| {
                    next.pos.with_contents_mut(|pos_out| {
                        next.vel.with_contents_mut(|vel_out| {
                            step_kernel(params, pos, vel, pos_out, vel_out)
                        })
                    })
                })
            });
            Ok(())
        }))?;
        stream.synchronize()?;

        state.swap();
        self.steps += 1;
        Ok(())
    }

    fn teardown(&mut self) {
        self.state = None;
    }

    /// Pairwise forces are antisymmetric, so total momentum must not drift.
    fn verify(&self) -> Result<()> {
        let Some(state) = &self.state else {
            return Ok(());
        };
        let cur = state.current();
        let (p, scale) =
            cur.pos.with_contents(|pos| cur.vel.with_contents(|vel| total_momentum(pos, vel)));
        let tolerance = 1e-3 * scale.max(1.0);
        for k in 0..3 {
            let drift = (p[k] - self.initial_momentum[k]).abs();
            if drift > tolerance {
                return Err(AccelError::Execution(format!(
                    "n_body momentum drift {drift:.3e} on axis {k} after {} steps",
                    self.steps
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accelbench_device::{DeviceContextConfig, TransferModel};

    fn ctx() -> Arc<DeviceContext> {
        Arc::new(
            DeviceContext::new(DeviceContextConfig {
                pool_size: 1 << 20,
                stream_count: 1,
                transfer: TransferModel::instant(),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    #[test]
    fn two_bodies_attract() {
        let pos = [-1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0];
        let vel = [0.0; 8];
        let mut pos_out = [0.0; 8];
        let mut vel_out = [0.0; 8];
        step_kernel(NBodyParams::default(), &pos, &vel, &mut pos_out, &mut vel_out);
        assert!(vel_out[0] > 0.0);
        assert!(vel_out[4] < 0.0);
        assert!((vel_out[0] + vel_out[4]).abs() < 1e-6);
        assert_eq!(pos_out[3], 1.0);
    }

    #[test]
    fn steps_flip_state_and_conserve_momentum() {
        let ctx = ctx();
        let mut task = NBodyTask::new(ctx.clone(), NBodyParams::default()).unwrap();
        task.setup(64).unwrap();
        let before = task.positions();
        for _ in 0..5 {
            task.execute().unwrap();
        }
        assert_eq!(task.steps(), 5);
        assert_ne!(task.positions(), before);
        task.verify().unwrap();
        task.teardown();
        task.teardown();
        assert_eq!(ctx.memory_pool.in_use(), 0);
    }

    #[test]
    fn huge_body_count_fails_on_the_budget() {
        let ctx = ctx();
        let mut task = NBodyTask::new(ctx.clone(), NBodyParams::default()).unwrap();
        for bodies in [usize::MAX / 2, 1 << 20] {
            let err = task.setup(bodies).unwrap_err();
            assert!(matches!(err, AccelError::DeviceOutOfMemory { .. }));
        }
        assert_eq!(ctx.memory_pool.in_use(), 0);
    }

    #[test]
    fn single_body_rejected() {
        let mut task = NBodyTask::new(ctx(), NBodyParams::default()).unwrap();
        assert!(task.setup(1).unwrap_err().is_configuration_error());
    }
}
