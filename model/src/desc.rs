use serde::{Deserialize, Serialize};

use crate::{ModelErr, Result, rules::RuleSupport};

/// A weight tensor of some layer, as seen by the artifact codec.
pub struct TensorRef<'a> {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: &'a [f32],
}

/// A mutable weight tensor of some layer, as seen by the artifact codec.
pub struct TensorMut<'a> {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: &'a mut Vec<f32>,
}

/// Anything that owns named weight tensors.
///
/// The architecture metadata is serialized with serde while the weights travel as separate
/// tensors, named `"{layer}.{field}"`.
pub trait Weighted {
    fn tensors(&self) -> Vec<TensorRef<'_>>;
    fn tensors_mut(&mut self) -> Vec<TensorMut<'_>>;
}

fn check(what: impl Into<String>, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(ModelErr::Inconsistent {
            what: what.into(),
            got,
            expected,
        });
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    Identity,
    #[default]
    Relu,
    Mish,
}

impl ActivationKind {
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            ActivationKind::Identity => x,
            ActivationKind::Relu => x.max(0.0),
            ActivationKind::Mish => {
                // softplus saturates to the identity long before exp overflows
                let softplus = if x > 20.0 { x } else { x.exp().ln_1p() };
                x * softplus.tanh()
            }
        }
    }
}

/// A 2d convolution with "same" zero padding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvLayerDesc {
    pub name: String,
    pub conv_y_size: usize,
    pub conv_x_size: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub dilation_y: usize,
    pub dilation_x: usize,
    /// Laid out as `(out_channels, in_channels, conv_y_size, conv_x_size)`.
    #[serde(skip)]
    pub weights: Vec<f32>,
}

impl ConvLayerDesc {
    /// Creates a new undilated `ConvLayerDesc`.
    ///
    /// # Arguments
    /// * `name` - The layer's name, prefix of its tensor names.
    /// * `kernel` - The kernel size as `(y, x)`.
    /// * `in_channels` - The amount of input channels.
    /// * `out_channels` - The amount of output channels.
    /// * `weights` - The kernel weights in `(out, in, y, x)` order.
    pub fn new(
        name: impl Into<String>,
        kernel: (usize, usize),
        in_channels: usize,
        out_channels: usize,
        weights: Vec<f32>,
    ) -> Self {
        Self {
            name: name.into(),
            conv_y_size: kernel.0,
            conv_x_size: kernel.1,
            in_channels,
            out_channels,
            dilation_y: 1,
            dilation_x: 1,
            weights,
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        vec![
            self.out_channels,
            self.in_channels,
            self.conv_y_size,
            self.conv_x_size,
        ]
    }

    /// Checks that the kernel is odd sized, dilations are positive and the weights fit the shape.
    pub fn validate(&self) -> Result<()> {
        let name = &self.name;
        check(format!("{name}.conv_y_size parity"), self.conv_y_size % 2, 1)?;
        check(format!("{name}.conv_x_size parity"), self.conv_x_size % 2, 1)?;
        check(
            format!("{name}.dilation positive"),
            (self.dilation_y > 0 && self.dilation_x > 0) as usize,
            1,
        )?;
        check(
            format!("{name}.weights"),
            self.weights.len(),
            self.shape().iter().product(),
        )
    }
}

impl Weighted for ConvLayerDesc {
    fn tensors(&self) -> Vec<TensorRef<'_>> {
        vec![TensorRef {
            name: format!("{}.weights", self.name),
            shape: self.shape(),
            data: &self.weights,
        }]
    }

    fn tensors_mut(&mut self) -> Vec<TensorMut<'_>> {
        vec![TensorMut {
            name: format!("{}.weights", self.name),
            shape: self.shape(),
            data: &mut self.weights,
        }]
    }
}

/// Batch normalization with frozen statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchNormLayerDesc {
    pub name: String,
    pub num_channels: usize,
    pub epsilon: f32,
    pub has_scale: bool,
    pub has_bias: bool,
    #[serde(skip)]
    pub mean: Vec<f32>,
    #[serde(skip)]
    pub variance: Vec<f32>,
    #[serde(skip)]
    pub scale: Vec<f32>,
    #[serde(skip)]
    pub bias: Vec<f32>,
}

impl BatchNormLayerDesc {
    /// A batch norm that leaves its input as is.
    pub fn identity(name: impl Into<String>, num_channels: usize) -> Self {
        Self {
            name: name.into(),
            num_channels,
            epsilon: 0.0,
            has_scale: false,
            has_bias: false,
            mean: vec![0.0; num_channels],
            variance: vec![1.0; num_channels],
            scale: Vec::new(),
            bias: Vec::new(),
        }
    }

    /// Folds the statistics into a per channel affine transform.
    ///
    /// # Returns
    /// The `(scale, bias)` vectors such that `bn(x) = x * scale + bias`.
    pub fn merged(&self) -> (Vec<f32>, Vec<f32>) {
        (0..self.num_channels)
            .map(|c| {
                let gamma = if self.has_scale { self.scale[c] } else { 1.0 };
                let beta = if self.has_bias { self.bias[c] } else { 0.0 };
                let scale = gamma / (self.variance[c] + self.epsilon).sqrt();
                (scale, beta - self.mean[c] * scale)
            })
            .unzip()
    }

    pub fn validate(&self) -> Result<()> {
        let name = &self.name;
        let c = self.num_channels;
        check(format!("{name}.mean"), self.mean.len(), c)?;
        check(format!("{name}.variance"), self.variance.len(), c)?;

        if self.has_scale {
            check(format!("{name}.scale"), self.scale.len(), c)?;
        }
        if self.has_bias {
            check(format!("{name}.bias"), self.bias.len(), c)?;
        }

        Ok(())
    }
}

impl Weighted for BatchNormLayerDesc {
    fn tensors(&self) -> Vec<TensorRef<'_>> {
        let name = &self.name;
        let shape = vec![self.num_channels];
        let mut tensors = vec![
            TensorRef {
                name: format!("{name}.mean"),
                shape: shape.clone(),
                data: &self.mean,
            },
            TensorRef {
                name: format!("{name}.variance"),
                shape: shape.clone(),
                data: &self.variance,
            },
        ];

        if self.has_scale {
            tensors.push(TensorRef {
                name: format!("{name}.scale"),
                shape: shape.clone(),
                data: &self.scale,
            });
        }
        if self.has_bias {
            tensors.push(TensorRef {
                name: format!("{name}.bias"),
                shape,
                data: &self.bias,
            });
        }

        tensors
    }

    fn tensors_mut(&mut self) -> Vec<TensorMut<'_>> {
        let name = &self.name;
        let shape = vec![self.num_channels];
        let mut tensors = vec![
            TensorMut {
                name: format!("{name}.mean"),
                shape: shape.clone(),
                data: &mut self.mean,
            },
            TensorMut {
                name: format!("{name}.variance"),
                shape: shape.clone(),
                data: &mut self.variance,
            },
        ];

        if self.has_scale {
            tensors.push(TensorMut {
                name: format!("{name}.scale"),
                shape: shape.clone(),
                data: &mut self.scale,
            });
        }
        if self.has_bias {
            tensors.push(TensorMut {
                name: format!("{name}.bias"),
                shape,
                data: &mut self.bias,
            });
        }

        tensors
    }
}

/// A dense layer without bias, `out = x · weights`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatMulLayerDesc {
    pub name: String,
    pub in_channels: usize,
    pub out_channels: usize,
    /// Laid out as `(in_channels, out_channels)`.
    #[serde(skip)]
    pub weights: Vec<f32>,
}

impl MatMulLayerDesc {
    pub fn validate(&self) -> Result<()> {
        check(
            format!("{}.weights", self.name),
            self.weights.len(),
            self.in_channels * self.out_channels,
        )
    }
}

impl Weighted for MatMulLayerDesc {
    fn tensors(&self) -> Vec<TensorRef<'_>> {
        vec![TensorRef {
            name: format!("{}.weights", self.name),
            shape: vec![self.in_channels, self.out_channels],
            data: &self.weights,
        }]
    }

    fn tensors_mut(&mut self) -> Vec<TensorMut<'_>> {
        vec![TensorMut {
            name: format!("{}.weights", self.name),
            shape: vec![self.in_channels, self.out_channels],
            data: &mut self.weights,
        }]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatBiasLayerDesc {
    pub name: String,
    pub num_channels: usize,
    #[serde(skip)]
    pub weights: Vec<f32>,
}

impl MatBiasLayerDesc {
    pub fn validate(&self) -> Result<()> {
        check(
            format!("{}.weights", self.name),
            self.weights.len(),
            self.num_channels,
        )
    }
}

impl Weighted for MatBiasLayerDesc {
    fn tensors(&self) -> Vec<TensorRef<'_>> {
        vec![TensorRef {
            name: format!("{}.weights", self.name),
            shape: vec![self.num_channels],
            data: &self.weights,
        }]
    }

    fn tensors_mut(&mut self) -> Vec<TensorMut<'_>> {
        vec![TensorMut {
            name: format!("{}.weights", self.name),
            shape: vec![self.num_channels],
            data: &mut self.weights,
        }]
    }
}

/// `x + final_conv(act(mid_bn(regular_conv(act(pre_bn(x))))))`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidualBlockDesc {
    pub name: String,
    pub pre_bn: BatchNormLayerDesc,
    pub pre_activation: ActivationKind,
    pub regular_conv: ConvLayerDesc,
    pub mid_bn: BatchNormLayerDesc,
    pub mid_activation: ActivationKind,
    pub final_conv: ConvLayerDesc,
}

impl ResidualBlockDesc {
    /// Checks the block against the trunk width it is plugged into.
    ///
    /// # Arguments
    /// * `trunk_channels` - The amount of channels flowing through the trunk.
    pub fn validate(&self, trunk_channels: usize) -> Result<()> {
        let name = &self.name;
        let regular = self.regular_conv.out_channels;

        self.pre_bn.validate()?;
        self.regular_conv.validate()?;
        self.mid_bn.validate()?;
        self.final_conv.validate()?;

        check(format!("{name}.pre_bn"), self.pre_bn.num_channels, trunk_channels)?;
        check(
            format!("{name}.regular_conv.in"),
            self.regular_conv.in_channels,
            trunk_channels,
        )?;
        check(format!("{name}.mid_bn"), self.mid_bn.num_channels, regular)?;
        check(format!("{name}.final_conv.in"), self.final_conv.in_channels, regular)?;
        check(
            format!("{name}.final_conv.out"),
            self.final_conv.out_channels,
            trunk_channels,
        )
    }
}

impl Weighted for ResidualBlockDesc {
    fn tensors(&self) -> Vec<TensorRef<'_>> {
        let mut tensors = self.pre_bn.tensors();
        tensors.extend(self.regular_conv.tensors());
        tensors.extend(self.mid_bn.tensors());
        tensors.extend(self.final_conv.tensors());
        tensors
    }

    fn tensors_mut(&mut self) -> Vec<TensorMut<'_>> {
        let mut tensors = self.pre_bn.tensors_mut();
        tensors.extend(self.regular_conv.tensors_mut());
        tensors.extend(self.mid_bn.tensors_mut());
        tensors.extend(self.final_conv.tensors_mut());
        tensors
    }
}

/// A residual block whose regular path is biased by globally pooled features of a parallel path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalPoolingResidualBlockDesc {
    pub name: String,
    pub pre_bn: BatchNormLayerDesc,
    pub pre_activation: ActivationKind,
    pub regular_conv: ConvLayerDesc,
    pub gpool_conv: ConvLayerDesc,
    pub gpool_bn: BatchNormLayerDesc,
    pub gpool_activation: ActivationKind,
    pub gpool_to_bias_mul: MatMulLayerDesc,
    pub mid_bn: BatchNormLayerDesc,
    pub mid_activation: ActivationKind,
    pub final_conv: ConvLayerDesc,
}

impl GlobalPoolingResidualBlockDesc {
    /// Checks the block against the trunk width it is plugged into.
    ///
    /// # Arguments
    /// * `trunk_channels` - The amount of channels flowing through the trunk.
    pub fn validate(&self, trunk_channels: usize) -> Result<()> {
        let name = &self.name;
        let regular = self.regular_conv.out_channels;
        let gpool = self.gpool_conv.out_channels;

        self.pre_bn.validate()?;
        self.regular_conv.validate()?;
        self.gpool_conv.validate()?;
        self.gpool_bn.validate()?;
        self.gpool_to_bias_mul.validate()?;
        self.mid_bn.validate()?;
        self.final_conv.validate()?;

        check(format!("{name}.pre_bn"), self.pre_bn.num_channels, trunk_channels)?;
        check(
            format!("{name}.regular_conv.in"),
            self.regular_conv.in_channels,
            trunk_channels,
        )?;
        check(
            format!("{name}.gpool_conv.in"),
            self.gpool_conv.in_channels,
            trunk_channels,
        )?;
        check(format!("{name}.gpool_bn"), self.gpool_bn.num_channels, gpool)?;
        check(
            format!("{name}.gpool_to_bias_mul.in"),
            self.gpool_to_bias_mul.in_channels,
            3 * gpool,
        )?;
        check(
            format!("{name}.gpool_to_bias_mul.out"),
            self.gpool_to_bias_mul.out_channels,
            regular,
        )?;
        check(format!("{name}.mid_bn"), self.mid_bn.num_channels, regular)?;
        check(format!("{name}.final_conv.in"), self.final_conv.in_channels, regular)?;
        check(
            format!("{name}.final_conv.out"),
            self.final_conv.out_channels,
            trunk_channels,
        )
    }
}

impl Weighted for GlobalPoolingResidualBlockDesc {
    fn tensors(&self) -> Vec<TensorRef<'_>> {
        let mut tensors = self.pre_bn.tensors();
        tensors.extend(self.regular_conv.tensors());
        tensors.extend(self.gpool_conv.tensors());
        tensors.extend(self.gpool_bn.tensors());
        tensors.extend(self.gpool_to_bias_mul.tensors());
        tensors.extend(self.mid_bn.tensors());
        tensors.extend(self.final_conv.tensors());
        tensors
    }

    fn tensors_mut(&mut self) -> Vec<TensorMut<'_>> {
        let mut tensors = self.pre_bn.tensors_mut();
        tensors.extend(self.regular_conv.tensors_mut());
        tensors.extend(self.gpool_conv.tensors_mut());
        tensors.extend(self.gpool_bn.tensors_mut());
        tensors.extend(self.gpool_to_bias_mul.tensors_mut());
        tensors.extend(self.mid_bn.tensors_mut());
        tensors.extend(self.final_conv.tensors_mut());
        tensors
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockDesc {
    Ordinary(ResidualBlockDesc),
    GlobalPooling(GlobalPoolingResidualBlockDesc),
}

impl BlockDesc {
    pub fn validate(&self, trunk_channels: usize) -> Result<()> {
        match self {
            BlockDesc::Ordinary(b) => b.validate(trunk_channels),
            BlockDesc::GlobalPooling(b) => b.validate(trunk_channels),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            BlockDesc::Ordinary(b) => &b.name,
            BlockDesc::GlobalPooling(b) => &b.name,
        }
    }
}

impl Weighted for BlockDesc {
    fn tensors(&self) -> Vec<TensorRef<'_>> {
        match self {
            BlockDesc::Ordinary(b) => b.tensors(),
            BlockDesc::GlobalPooling(b) => b.tensors(),
        }
    }

    fn tensors_mut(&mut self) -> Vec<TensorMut<'_>> {
        match self {
            BlockDesc::Ordinary(b) => b.tensors_mut(),
            BlockDesc::GlobalPooling(b) => b.tensors_mut(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrunkDesc {
    pub name: String,
    pub trunk_num_channels: usize,
    pub initial_conv: ConvLayerDesc,
    pub initial_matmul: MatMulLayerDesc,
    pub blocks: Vec<BlockDesc>,
    pub trunk_tip_bn: BatchNormLayerDesc,
    pub trunk_tip_activation: ActivationKind,
}

impl TrunkDesc {
    fn validate(&self, spatial: usize, global: usize) -> Result<()> {
        let name = &self.name;
        let trunk = self.trunk_num_channels;

        self.initial_conv.validate()?;
        self.initial_matmul.validate()?;
        self.trunk_tip_bn.validate()?;

        check(format!("{name}.initial_conv.in"), self.initial_conv.in_channels, spatial)?;
        check(format!("{name}.initial_conv.out"), self.initial_conv.out_channels, trunk)?;
        check(format!("{name}.initial_matmul.in"), self.initial_matmul.in_channels, global)?;
        check(format!("{name}.initial_matmul.out"), self.initial_matmul.out_channels, trunk)?;
        check(format!("{name}.trunk_tip_bn"), self.trunk_tip_bn.num_channels, trunk)?;

        self.blocks.iter().try_for_each(|b| b.validate(trunk))
    }
}

impl Weighted for TrunkDesc {
    fn tensors(&self) -> Vec<TensorRef<'_>> {
        let mut tensors = self.initial_conv.tensors();
        tensors.extend(self.initial_matmul.tensors());
        tensors.extend(self.blocks.iter().flat_map(|b| b.tensors()));
        tensors.extend(self.trunk_tip_bn.tensors());
        tensors
    }

    fn tensors_mut(&mut self) -> Vec<TensorMut<'_>> {
        let mut tensors = self.initial_conv.tensors_mut();
        tensors.extend(self.initial_matmul.tensors_mut());
        tensors.extend(self.blocks.iter_mut().flat_map(|b| b.tensors_mut()));
        tensors.extend(self.trunk_tip_bn.tensors_mut());
        tensors
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyHeadDesc {
    pub name: String,
    pub p1_conv: ConvLayerDesc,
    pub g1_conv: ConvLayerDesc,
    pub g1_bn: BatchNormLayerDesc,
    pub g1_activation: ActivationKind,
    pub gpool_to_bias_mul: MatMulLayerDesc,
    pub p1_bn: BatchNormLayerDesc,
    pub p1_activation: ActivationKind,
    pub p2_conv: ConvLayerDesc,
    pub gpool_to_pass_mul: MatMulLayerDesc,
}

impl PolicyHeadDesc {
    fn validate(&self, trunk: usize) -> Result<()> {
        let name = &self.name;
        let p1 = self.p1_conv.out_channels;
        let g1 = self.g1_conv.out_channels;

        self.p1_conv.validate()?;
        self.g1_conv.validate()?;
        self.g1_bn.validate()?;
        self.gpool_to_bias_mul.validate()?;
        self.p1_bn.validate()?;
        self.p2_conv.validate()?;
        self.gpool_to_pass_mul.validate()?;

        check(format!("{name}.p1_conv.in"), self.p1_conv.in_channels, trunk)?;
        check(format!("{name}.g1_conv.in"), self.g1_conv.in_channels, trunk)?;
        check(format!("{name}.g1_bn"), self.g1_bn.num_channels, g1)?;
        check(
            format!("{name}.gpool_to_bias_mul.in"),
            self.gpool_to_bias_mul.in_channels,
            3 * g1,
        )?;
        check(
            format!("{name}.gpool_to_bias_mul.out"),
            self.gpool_to_bias_mul.out_channels,
            p1,
        )?;
        check(format!("{name}.p1_bn"), self.p1_bn.num_channels, p1)?;
        check(format!("{name}.p2_conv.in"), self.p2_conv.in_channels, p1)?;
        check(format!("{name}.p2_conv.out"), self.p2_conv.out_channels, 1)?;
        check(
            format!("{name}.gpool_to_pass_mul.in"),
            self.gpool_to_pass_mul.in_channels,
            3 * g1,
        )?;
        check(
            format!("{name}.gpool_to_pass_mul.out"),
            self.gpool_to_pass_mul.out_channels,
            1,
        )
    }
}

impl Weighted for PolicyHeadDesc {
    fn tensors(&self) -> Vec<TensorRef<'_>> {
        let mut tensors = self.p1_conv.tensors();
        tensors.extend(self.g1_conv.tensors());
        tensors.extend(self.g1_bn.tensors());
        tensors.extend(self.gpool_to_bias_mul.tensors());
        tensors.extend(self.p1_bn.tensors());
        tensors.extend(self.p2_conv.tensors());
        tensors.extend(self.gpool_to_pass_mul.tensors());
        tensors
    }

    fn tensors_mut(&mut self) -> Vec<TensorMut<'_>> {
        let mut tensors = self.p1_conv.tensors_mut();
        tensors.extend(self.g1_conv.tensors_mut());
        tensors.extend(self.g1_bn.tensors_mut());
        tensors.extend(self.gpool_to_bias_mul.tensors_mut());
        tensors.extend(self.p1_bn.tensors_mut());
        tensors.extend(self.p2_conv.tensors_mut());
        tensors.extend(self.gpool_to_pass_mul.tensors_mut());
        tensors
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueHeadDesc {
    pub name: String,
    pub v1_conv: ConvLayerDesc,
    pub v1_bn: BatchNormLayerDesc,
    pub v1_activation: ActivationKind,
    pub v2_mul: MatMulLayerDesc,
    pub v2_bias: MatBiasLayerDesc,
    pub v2_activation: ActivationKind,
    pub v3_mul: MatMulLayerDesc,
    pub v3_bias: MatBiasLayerDesc,
    pub sv3_mul: MatMulLayerDesc,
    pub sv3_bias: MatBiasLayerDesc,
    pub v_ownership_conv: ConvLayerDesc,
}

impl ValueHeadDesc {
    fn validate(&self, trunk: usize) -> Result<()> {
        let name = &self.name;
        let v1 = self.v1_conv.out_channels;
        let v2 = self.v2_mul.out_channels;
        let sv = self.sv3_mul.out_channels;

        self.v1_conv.validate()?;
        self.v1_bn.validate()?;
        self.v2_mul.validate()?;
        self.v2_bias.validate()?;
        self.v3_mul.validate()?;
        self.v3_bias.validate()?;
        self.sv3_mul.validate()?;
        self.sv3_bias.validate()?;
        self.v_ownership_conv.validate()?;

        check(format!("{name}.v1_conv.in"), self.v1_conv.in_channels, trunk)?;
        check(format!("{name}.v1_bn"), self.v1_bn.num_channels, v1)?;
        check(format!("{name}.v2_mul.in"), self.v2_mul.in_channels, 3 * v1)?;
        check(format!("{name}.v2_bias"), self.v2_bias.num_channels, v2)?;
        check(format!("{name}.v3_mul.in"), self.v3_mul.in_channels, v2)?;
        check(format!("{name}.v3_mul.out"), self.v3_mul.out_channels, 3)?;
        check(format!("{name}.v3_bias"), self.v3_bias.num_channels, 3)?;
        check(format!("{name}.sv3_mul.in"), self.sv3_mul.in_channels, v2)?;
        check(format!("{name}.sv3_bias"), self.sv3_bias.num_channels, sv)?;
        check(
            format!("{name}.v_ownership_conv.in"),
            self.v_ownership_conv.in_channels,
            v1,
        )?;
        check(
            format!("{name}.v_ownership_conv.out"),
            self.v_ownership_conv.out_channels,
            1,
        )
    }
}

impl Weighted for ValueHeadDesc {
    fn tensors(&self) -> Vec<TensorRef<'_>> {
        let mut tensors = self.v1_conv.tensors();
        tensors.extend(self.v1_bn.tensors());
        tensors.extend(self.v2_mul.tensors());
        tensors.extend(self.v2_bias.tensors());
        tensors.extend(self.v3_mul.tensors());
        tensors.extend(self.v3_bias.tensors());
        tensors.extend(self.sv3_mul.tensors());
        tensors.extend(self.sv3_bias.tensors());
        tensors.extend(self.v_ownership_conv.tensors());
        tensors
    }

    fn tensors_mut(&mut self) -> Vec<TensorMut<'_>> {
        let mut tensors = self.v1_conv.tensors_mut();
        tensors.extend(self.v1_bn.tensors_mut());
        tensors.extend(self.v2_mul.tensors_mut());
        tensors.extend(self.v2_bias.tensors_mut());
        tensors.extend(self.v3_mul.tensors_mut());
        tensors.extend(self.v3_bias.tensors_mut());
        tensors.extend(self.sv3_mul.tensors_mut());
        tensors.extend(self.sv3_bias.tensors_mut());
        tensors.extend(self.v_ownership_conv.tensors_mut());
        tensors
    }
}

/// The full architecture and weights of a model.
///
/// `name` and `version` travel in the artifact's metadata, everything else but the weights in
/// its `config` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDesc {
    #[serde(skip)]
    pub name: String,
    #[serde(skip)]
    pub version: i32,
    pub num_input_channels: usize,
    pub num_input_global_channels: usize,
    pub rules: RuleSupport,
    pub trunk: TrunkDesc,
    pub policy_head: PolicyHeadDesc,
    pub value_head: ValueHeadDesc,
}

impl ModelDesc {
    /// Checks that every layer fits the next one and every weight tensor fits its layer.
    ///
    /// # Returns
    /// An `Inconsistent` error naming the first offending layer.
    pub fn validate(&self) -> Result<()> {
        // the first spatial input flags the cells on the board
        if self.num_input_channels == 0 {
            return Err(ModelErr::Inconsistent {
                what: "num_input_channels".into(),
                got: 0,
                expected: 1,
            });
        }

        let trunk = self.trunk.trunk_num_channels;

        self.trunk
            .validate(self.num_input_channels, self.num_input_global_channels)?;
        self.policy_head.validate(trunk)?;
        self.value_head.validate(trunk)?;
        self.rules.validate()
    }

    pub fn num_score_value_channels(&self) -> usize {
        self.value_head.sv3_mul.out_channels
    }

    /// Every convolution of the model, trunk first.
    pub fn conv_layers(&self) -> Vec<&ConvLayerDesc> {
        let mut convs = vec![&self.trunk.initial_conv];
        for block in &self.trunk.blocks {
            match block {
                BlockDesc::Ordinary(b) => convs.extend([&b.regular_conv, &b.final_conv]),
                BlockDesc::GlobalPooling(b) => {
                    convs.extend([&b.regular_conv, &b.gpool_conv, &b.final_conv])
                }
            }
        }

        let (ph, vh) = (&self.policy_head, &self.value_head);
        convs.extend([&ph.p1_conv, &ph.g1_conv, &ph.p2_conv, &vh.v1_conv, &vh.v_ownership_conv]);
        convs
    }

    /// Every batch norm of the model, trunk first.
    pub fn batch_norm_layers(&self) -> Vec<&BatchNormLayerDesc> {
        let mut bns = Vec::new();
        for block in &self.trunk.blocks {
            match block {
                BlockDesc::Ordinary(b) => bns.extend([&b.pre_bn, &b.mid_bn]),
                BlockDesc::GlobalPooling(b) => bns.extend([&b.pre_bn, &b.gpool_bn, &b.mid_bn]),
            }
        }

        let (ph, vh) = (&self.policy_head, &self.value_head);
        bns.extend([&self.trunk.trunk_tip_bn, &ph.g1_bn, &ph.p1_bn, &vh.v1_bn]);
        bns
    }
}

impl Weighted for ModelDesc {
    fn tensors(&self) -> Vec<TensorRef<'_>> {
        let mut tensors = self.trunk.tensors();
        tensors.extend(self.policy_head.tensors());
        tensors.extend(self.value_head.tensors());
        tensors
    }

    fn tensors_mut(&mut self) -> Vec<TensorMut<'_>> {
        let mut tensors = self.trunk.tensors_mut();
        tensors.extend(self.policy_head.tensors_mut());
        tensors.extend(self.value_head.tensors_mut());
        tensors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merged_batch_norm_matches_definition() {
        let bn = BatchNormLayerDesc {
            name: "bn".into(),
            num_channels: 2,
            epsilon: 1e-5,
            has_scale: true,
            has_bias: true,
            mean: vec![1.0, -2.0],
            variance: vec![4.0, 0.25],
            scale: vec![2.0, 1.0],
            bias: vec![0.5, 0.0],
        };

        let (scale, bias) = bn.merged();
        for c in 0..2 {
            let x = 3.0;
            let expected =
                (x - bn.mean[c]) / (bn.variance[c] + bn.epsilon).sqrt() * bn.scale[c] + bn.bias[c];
            assert!((x * scale[c] + bias[c] - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn identity_batch_norm_is_identity() {
        let (scale, bias) = BatchNormLayerDesc::identity("bn", 3).merged();
        assert_eq!(scale, vec![1.0; 3]);
        assert_eq!(bias, vec![0.0; 3]);
    }

    #[test]
    fn conv_rejects_even_kernels() {
        let conv = ConvLayerDesc::new("conv", (2, 3), 1, 1, vec![0.0; 6]);
        assert!(matches!(conv.validate(), Err(ModelErr::Inconsistent { .. })));
    }

    #[test]
    fn conv_rejects_short_weights() {
        let conv = ConvLayerDesc::new("conv", (3, 3), 2, 1, vec![0.0; 9]);
        assert!(matches!(
            conv.validate(),
            Err(ModelErr::Inconsistent {
                got: 9,
                expected: 18,
                ..
            })
        ));
    }

    #[test]
    fn batch_norm_skips_absent_tensors() {
        let bn = BatchNormLayerDesc::identity("tip", 4);
        let names: Vec<_> = bn.tensors().into_iter().map(|t| t.name).collect();
        assert_eq!(names, ["tip.mean", "tip.variance"]);
    }

    #[test]
    fn mish_is_close_to_relu_far_from_zero() {
        assert!((ActivationKind::Mish.apply(30.0) - 30.0).abs() < 1e-4);
        assert!(ActivationKind::Mish.apply(-30.0).abs() < 1e-4);
        assert_eq!(ActivationKind::Relu.apply(-1.0), 0.0);
        assert_eq!(ActivationKind::Identity.apply(-1.0), -1.0);
    }
}
