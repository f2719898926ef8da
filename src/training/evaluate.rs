//! Post-step classification probe.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use ndarray::Array4;

use crate::model::TestTimeModel;

/// Verdict of one evaluation: the voted class and its scored outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    /// 100.0 when the voted class matches the label, else 0.0.
    pub outcome: f32,
    /// Majority-voted class; ties go to the smallest class index.
    pub predicted: usize,
    /// Classification loss of the last pass.
    pub class_loss: f32,
}

/// Runs the model in eval mode over the clean view and votes on the class.
///
/// The number of passes mirrors the accumulation factor, so a stochastic
/// model gets the same number of opinions as gradient contributions. No
/// masking and no reconstruction happen here; train mode is restored on
/// the way out.
pub struct EvaluationUnit {
    passes: usize,
}

impl EvaluationUnit {
    pub fn new(passes: usize) -> Result<Self> {
        if passes == 0 {
            bail!("evaluation needs at least one pass");
        }
        Ok(Self { passes })
    }

    pub fn evaluate(
        &self,
        model: &mut dyn TestTimeModel,
        view: &Array4<f32>,
        label: usize,
    ) -> Result<Evaluation> {
        model.set_train(false);
        let verdict = self.vote(model, view, label);
        model.set_train(true);
        verdict
    }

    fn vote(
        &self,
        model: &mut dyn TestTimeModel,
        view: &Array4<f32>,
        label: usize,
    ) -> Result<Evaluation> {
        let mut votes: BTreeMap<usize, usize> = BTreeMap::new();
        let mut class_loss = 0.0;
        for _ in 0..self.passes {
            let pass = model.forward(view, Some(label), 0.0, false)?;
            let predicted = pass
                .predicted_class(0)
                .context("evaluation forward produced no logits")?;
            *votes.entry(predicted).or_insert(0) += 1;
            class_loss = pass
                .losses
                .get("classification")
                .copied()
                .unwrap_or_else(|| pass.total_loss());
        }

        // Ascending key order plus a strict comparison picks the smallest
        // class among tied vote counts.
        let mut winner = 0;
        let mut top = 0;
        for (&class, &count) in &votes {
            if count > top {
                winner = class;
                top = count;
            }
        }

        let outcome = if winner == label { 100.0 } else { 0.0 };
        Ok(Evaluation {
            outcome,
            predicted: winner,
            class_loss,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoints::ModelState;
    use crate::config::{HeadType, ModelConfig, ModelVariant};
    use crate::model::{ForwardPass, TinyMae};
    use ndarray::{Array2, Array3, Array4};

    /// Replays a fixed sequence of logit rows, one per forward call.
    struct ScriptedModel {
        script: Vec<Vec<f32>>,
        calls: usize,
        train: bool,
        saw_train_mode: Vec<bool>,
    }

    impl ScriptedModel {
        fn new(script: Vec<Vec<f32>>) -> Self {
            Self {
                script,
                calls: 0,
                train: true,
                saw_train_mode: Vec::new(),
            }
        }
    }

    impl TestTimeModel for ScriptedModel {
        fn forward(
            &mut self,
            _views: &Array4<f32>,
            label: Option<usize>,
            _mask_ratio: f32,
            _reconstruct: bool,
        ) -> anyhow::Result<ForwardPass> {
            self.saw_train_mode.push(self.train);
            let row = self.script[self.calls % self.script.len()].clone();
            self.calls += 1;
            let width = row.len();
            let mut losses = std::collections::BTreeMap::new();
            if label.is_some() {
                losses.insert("classification".to_string(), 0.5);
            }
            Ok(ForwardPass {
                losses,
                pred_patches: None,
                predictions: Array2::from_shape_vec((1, width), row)?,
                mask: None,
            })
        }

        fn backward(&mut self, _scale: f32) -> anyhow::Result<()> {
            Ok(())
        }

        fn zero_grads(&mut self) {}

        fn set_train(&mut self, train: bool) {
            self.train = train;
        }

        fn is_train(&self) -> bool {
            self.train
        }

        fn reseed(&mut self, _seed: u64) {}

        fn state_dict(&self) -> ModelState {
            ModelState::new()
        }

        fn load_state_dict(&mut self, _state: &ModelState) -> anyhow::Result<()> {
            Ok(())
        }

        fn parameter_names(&self) -> Vec<String> {
            Vec::new()
        }

        fn visit_trainable(
            &mut self,
            _names: &[String],
            _f: &mut dyn FnMut(&str, &mut [f32], &[f32]),
        ) -> anyhow::Result<()> {
            Ok(())
        }

        fn unpatchify(&self, _patch_grid: &Array2<f32>) -> anyhow::Result<Array3<f32>> {
            anyhow::bail!("not a reconstructing model")
        }

        fn patch_size(&self) -> usize {
            16
        }
    }

    fn dummy_view() -> Array4<f32> {
        Array4::zeros((1, 1, 32, 32))
    }

    #[test]
    fn split_votes_go_to_the_smallest_class() {
        // Two passes, one vote each for class 3 and class 1.
        let mut model = ScriptedModel::new(vec![
            vec![0.0, 0.0, 0.0, 1.0],
            vec![0.0, 1.0, 0.0, 0.0],
        ]);
        let unit = EvaluationUnit::new(2).unwrap();
        let verdict = unit.evaluate(&mut model, &dummy_view(), 1).unwrap();
        assert_eq!(verdict.predicted, 1);
        assert_eq!(verdict.outcome, 100.0);
    }

    #[test]
    fn majority_beats_a_lone_dissent() {
        let mut model = ScriptedModel::new(vec![
            vec![0.0, 0.0, 1.0],
            vec![1.0, 0.0, 0.0],
            vec![0.0, 0.0, 1.0],
        ]);
        let unit = EvaluationUnit::new(3).unwrap();
        let verdict = unit.evaluate(&mut model, &dummy_view(), 0).unwrap();
        assert_eq!(verdict.predicted, 2);
        assert_eq!(verdict.outcome, 0.0);
        assert!((verdict.class_loss - 0.5).abs() < 1e-6);
    }

    #[test]
    fn runs_in_eval_mode_and_restores_train() {
        let mut model = ScriptedModel::new(vec![vec![1.0, 0.0]]);
        model.set_train(true);
        let unit = EvaluationUnit::new(2).unwrap();
        unit.evaluate(&mut model, &dummy_view(), 0).unwrap();
        assert!(model.is_train());
        assert_eq!(model.saw_train_mode, vec![false, false]);
    }

    #[test]
    fn scores_a_real_model_consistently() {
        let config = ModelConfig {
            variant: ModelVariant::Small,
            input_size: 32,
            channels: 1,
            num_classes: 4,
            head_type: HeadType::Linear,
            head_dropout: 0.0,
            norm_pix_loss: false,
        };
        let mut model = TinyMae::new(&config, 7).unwrap();
        let view = Array4::from_shape_fn((1, 1, 32, 32), |(_, _, r, c)| {
            (r * 3 + c) as f32 / 100.0
        });
        let unit = EvaluationUnit::new(1).unwrap();
        let first = unit.evaluate(&mut model, &view, 2).unwrap();
        let second = unit.evaluate(&mut model, &view, 2).unwrap();
        assert_eq!(first, second);
        let expected = if first.predicted == 2 { 100.0 } else { 0.0 };
        assert_eq!(first.outcome, expected);
    }

    #[test]
    fn rejects_zero_passes() {
        assert!(EvaluationUnit::new(0).is_err());
    }
}
