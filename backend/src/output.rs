use model::Model;

/// The raw network outputs for one position, filled in place by `evaluate`.
///
/// Every value is a logit, no softmax nor any other final activation is applied.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NNOutput {
    /// One logit per board cell in row major order, followed by the pass logit.
    pub policy: Vec<f32>,
    /// `[win, loss, no result]`
    pub value: [f32; 3],
    pub score_value: Vec<f32>,
    /// One logit per board cell in row major order.
    pub ownership: Vec<f32>,
}

impl NNOutput {
    /// Allocates a zeroed output sized for `model` on a `width x height` board.
    pub fn new(model: &Model, width: usize, height: usize) -> Self {
        let area = width * height;
        Self {
            policy: vec![0.0; area + 1],
            value: [0.0; 3],
            score_value: vec![0.0; model.num_score_value_channels()],
            ownership: vec![0.0; area],
        }
    }

    /// The logit of passing.
    pub fn pass_logit(&self) -> f32 {
        self.policy.last().copied().unwrap_or(f32::NAN)
    }

    pub(crate) fn fits(&self, area: usize, num_score_value_channels: usize) -> bool {
        self.policy.len() == area + 1
            && self.ownership.len() == area
            && self.score_value.len() == num_score_value_channels
    }
}
