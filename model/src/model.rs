use crate::{
    Result,
    desc::ModelDesc,
    rules::{RuleSupport, Rules},
};

/// A loaded, validated and immutable neural net model.
///
/// Compute contexts, handles and input buffers only ever borrow a `Model`, dropping it releases
/// its weights.
#[derive(Debug)]
pub struct Model {
    desc: ModelDesc,
}

impl Model {
    /// Creates a new `Model` from its description.
    ///
    /// # Arguments
    /// * `desc` - The architecture and weights of the model.
    ///
    /// # Returns
    /// The model, or the first inconsistency found in `desc`.
    pub fn new(desc: ModelDesc) -> Result<Self> {
        desc.validate()?;
        Ok(Self { desc })
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn version(&self) -> i32 {
        self.desc.version
    }

    pub fn desc(&self) -> &ModelDesc {
        &self.desc
    }

    pub fn rule_support(&self) -> &RuleSupport {
        &self.desc.rules
    }

    /// Amount of spatial input features per board cell.
    pub fn num_input_channels(&self) -> usize {
        self.desc.num_input_channels
    }

    /// Amount of global input features per batch element.
    pub fn num_input_global_channels(&self) -> usize {
        self.desc.num_input_global_channels
    }

    pub fn num_score_value_channels(&self) -> usize {
        self.desc.num_score_value_channels()
    }

    /// Returns the supported rules nearest to `desired`.
    ///
    /// # Arguments
    /// * `desired` - The rules the caller would like to use.
    ///
    /// # Returns
    /// The rules to use and whether `desired` was already exactly supported.
    pub fn supported_rules(&self, desired: &Rules) -> (Rules, bool) {
        self.desc.rules.nearest(desired)
    }
}
