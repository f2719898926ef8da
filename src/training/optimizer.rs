//! Optimizer factory and the scaled backward-step helper.
//!
//! Moment buffers live here, keyed by parameter name, so a reset can swap
//! in a brand-new optimizer without touching the model. Adam and AdamW use
//! betas (0.9, 0.95), the values the adaptation recipe trains with.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::model::TestTimeModel;

const ADAM_BETA1: f32 = 0.9;
const ADAM_BETA2: f32 = 0.95;
const ADAM_EPS: f32 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Sgd,
    Adam,
    AdamW,
}

impl OptimizerKind {
    /// Closed-set lookup used when validating configuration at startup.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "sgd" => Ok(Self::Sgd),
            "adam" => Ok(Self::Adam),
            "adam_w" => Ok(Self::AdamW),
            other => bail!(
                "unknown optimizer {:?}, expected one of: sgd, adam, adam_w",
                other
            ),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sgd => "sgd",
            Self::Adam => "adam",
            Self::AdamW => "adam_w",
        }
    }
}

/// Serialized optimizer state, restored verbatim across checkpoint swaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub kind: OptimizerKind,
    pub step_count: usize,
    pub first_moments: BTreeMap<String, Vec<f32>>,
    pub second_moments: BTreeMap<String, Vec<f32>>,
}

pub struct Optimizer {
    kind: OptimizerKind,
    lr: f32,
    momentum: f32,
    weight_decay: f32,
    step_count: usize,
    names: Vec<String>,
    first_moments: BTreeMap<String, Vec<f32>>,
    second_moments: BTreeMap<String, Vec<f32>>,
}

impl Optimizer {
    pub fn new(
        kind: OptimizerKind,
        lr: f32,
        momentum: f32,
        weight_decay: f32,
        names: Vec<String>,
    ) -> Result<Self> {
        if lr.is_nan() || lr <= 0.0 {
            bail!("learning rate must be positive, got {}", lr);
        }
        if names.is_empty() {
            bail!("finetune scope selects no parameters");
        }
        Ok(Self {
            kind,
            lr,
            momentum,
            weight_decay,
            step_count: 0,
            names,
            first_moments: BTreeMap::new(),
            second_moments: BTreeMap::new(),
        })
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    pub fn learning_rate(&self) -> f32 {
        self.lr
    }

    pub fn zero_grad<M: TestTimeModel + ?Sized>(&mut self, model: &mut M) {
        model.zero_grads();
    }

    /// Apply one update from the model's accumulated gradients.
    pub fn step<M: TestTimeModel + ?Sized>(&mut self, model: &mut M) -> Result<()> {
        self.step_count += 1;
        let kind = self.kind;
        let lr = self.lr;
        let momentum = self.momentum;
        let weight_decay = self.weight_decay;
        let t = self.step_count;
        let first = &mut self.first_moments;
        let second = &mut self.second_moments;

        model.visit_trainable(&self.names, &mut |name, param, grad| {
            match kind {
                OptimizerKind::Sgd => {
                    let velocity = first
                        .entry(name.to_string())
                        .or_insert_with(|| vec![0.0; param.len()]);
                    sgd_update(param, grad, velocity, lr, momentum);
                }
                OptimizerKind::Adam => {
                    let m = first
                        .entry(name.to_string())
                        .or_insert_with(|| vec![0.0; param.len()]);
                    let v = second
                        .entry(name.to_string())
                        .or_insert_with(|| vec![0.0; param.len()]);
                    adam_update(param, grad, m, v, t, lr, 0.0);
                }
                OptimizerKind::AdamW => {
                    let m = first
                        .entry(name.to_string())
                        .or_insert_with(|| vec![0.0; param.len()]);
                    let v = second
                        .entry(name.to_string())
                        .or_insert_with(|| vec![0.0; param.len()]);
                    adam_update(param, grad, m, v, t, lr, weight_decay);
                }
            }
        })
    }

    pub fn state_dict(&self) -> OptimizerState {
        OptimizerState {
            kind: self.kind,
            step_count: self.step_count,
            first_moments: self.first_moments.clone(),
            second_moments: self.second_moments.clone(),
        }
    }

    pub fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()> {
        if state.kind != self.kind {
            bail!(
                "optimizer state is for {}, this optimizer is {}",
                state.kind.as_str(),
                self.kind.as_str()
            );
        }
        self.step_count = state.step_count;
        self.first_moments = state.first_moments.clone();
        self.second_moments = state.second_moments.clone();
        Ok(())
    }

    /// True when no update has deposited momentum yet.
    pub fn is_pristine(&self) -> bool {
        self.step_count == 0
            && self.first_moments.is_empty()
            && self.second_moments.is_empty()
    }
}

fn sgd_update(param: &mut [f32], grad: &[f32], velocity: &mut [f32], lr: f32, momentum: f32) {
    for ((p, &g), vel) in param.iter_mut().zip(grad).zip(velocity.iter_mut()) {
        *vel = momentum * *vel + g;
        *p -= lr * *vel;
    }
}

fn adam_update(
    param: &mut [f32],
    grad: &[f32],
    m: &mut [f32],
    v: &mut [f32],
    t: usize,
    lr: f32,
    weight_decay: f32,
) {
    let bc1 = 1.0 - ADAM_BETA1.powi(t as i32);
    let bc2 = 1.0 - ADAM_BETA2.powi(t as i32);
    for (((p, &g), m_i), v_i) in param
        .iter_mut()
        .zip(grad)
        .zip(m.iter_mut())
        .zip(v.iter_mut())
    {
        if weight_decay > 0.0 {
            *p -= lr * weight_decay * *p;
        }
        *m_i = ADAM_BETA1 * *m_i + (1.0 - ADAM_BETA1) * g;
        *v_i = ADAM_BETA2 * *v_i + (1.0 - ADAM_BETA2) * g * g;
        let m_hat = *m_i / bc1;
        let v_hat = *v_i / bc2;
        *p -= lr * m_hat / (v_hat.sqrt() + ADAM_EPS);
    }
}

/// Serialized scaler state, carried through resets when configured.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    pub scale: f32,
}

/// Gradient scaler with the backward-then-maybe-step call shape.
///
/// The f32 backend needs no loss scaling, so the scale factor is carried
/// as checkpoint state without being applied to gradients.
#[derive(Debug, Clone)]
pub struct LossScaler {
    scale: f32,
}

impl LossScaler {
    pub fn new() -> Self {
        Self { scale: 1.0 }
    }

    pub fn with_scale(scale: f32) -> Self {
        Self { scale }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Backward the scaled loss; step the optimizer only at accumulation
    /// boundaries (`update_grad`).
    pub fn backward_and_maybe_step<M: TestTimeModel + ?Sized>(
        &mut self,
        model: &mut M,
        optimizer: &mut Optimizer,
        loss_scale: f32,
        update_grad: bool,
    ) -> Result<()> {
        model.backward(loss_scale)?;
        if update_grad {
            optimizer.step(model)?;
        }
        Ok(())
    }

    pub fn state_dict(&self) -> ScalerState {
        ScalerState { scale: self.scale }
    }

    pub fn load_state_dict(&mut self, state: &ScalerState) {
        self.scale = state.scale;
    }
}

impl Default for LossScaler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_lookup_is_a_closed_set() {
        assert_eq!(OptimizerKind::from_name("sgd").unwrap(), OptimizerKind::Sgd);
        assert_eq!(OptimizerKind::from_name("adam").unwrap(), OptimizerKind::Adam);
        assert_eq!(
            OptimizerKind::from_name("adam_w").unwrap(),
            OptimizerKind::AdamW
        );
        assert!(OptimizerKind::from_name("adamw").is_err());
        assert!(OptimizerKind::from_name("lion").is_err());
    }

    #[test]
    fn sgd_momentum_compounds() {
        let mut param = vec![1.0_f32];
        let mut velocity = vec![0.0_f32];
        let grad = vec![1.0_f32];
        sgd_update(&mut param, &grad, &mut velocity, 0.1, 0.9);
        let first_delta = 1.0 - param[0];
        let before = param[0];
        sgd_update(&mut param, &grad, &mut velocity, 0.1, 0.9);
        let second_delta = before - param[0];
        assert!((first_delta - 0.1).abs() < 1e-6);
        assert!((second_delta - 0.19).abs() < 1e-6);
    }

    #[test]
    fn adam_first_step_is_about_lr() {
        let mut param = vec![0.0_f32];
        let mut m = vec![0.0_f32];
        let mut v = vec![0.0_f32];
        adam_update(&mut param, &[0.5], &mut m, &mut v, 1, 0.01, 0.0);
        // bias-corrected first step moves by ~lr regardless of grad scale
        assert!((param[0] + 0.01).abs() < 1e-4);
    }

    #[test]
    fn adamw_decays_even_without_gradient() {
        let mut param = vec![2.0_f32];
        let mut m = vec![0.0_f32];
        let mut v = vec![0.0_f32];
        adam_update(&mut param, &[0.0], &mut m, &mut v, 1, 0.1, 0.05);
        assert!((param[0] - 2.0 * (1.0 - 0.1 * 0.05)).abs() < 1e-6);
    }

    #[test]
    fn fresh_optimizer_is_pristine_and_state_round_trips() {
        let mut optimizer = Optimizer::new(
            OptimizerKind::Adam,
            1e-3,
            0.9,
            0.0,
            vec!["encoder.weight".to_string()],
        )
        .unwrap();
        assert!(optimizer.is_pristine());

        let mut state = optimizer.state_dict();
        state.step_count = 7;
        state
            .first_moments
            .insert("encoder.weight".to_string(), vec![0.25; 3]);
        optimizer.load_state_dict(&state).unwrap();
        assert!(!optimizer.is_pristine());
        assert_eq!(optimizer.state_dict(), state);

        let foreign = OptimizerState {
            kind: OptimizerKind::Sgd,
            step_count: 0,
            first_moments: BTreeMap::new(),
            second_moments: BTreeMap::new(),
        };
        assert!(optimizer.load_state_dict(&foreign).is_err());
    }

    #[test]
    fn rejects_empty_parameter_sets() {
        assert!(Optimizer::new(OptimizerKind::Sgd, 1e-3, 0.9, 0.0, Vec::new()).is_err());
        assert!(Optimizer::new(
            OptimizerKind::Sgd,
            0.0,
            0.9,
            0.0,
            vec!["encoder.weight".to_string()]
        )
        .is_err());
    }
}
