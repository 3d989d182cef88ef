use std::{
    cell::RefCell,
    fmt::{self, Display},
    rc::Rc,
};

use ndarray::{Array1, Array2, Array4, ArrayView4};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{
    Mode, Model,
    hooks::{ForwardHook, HookRegistry},
    layers::{BatchNorm2d, Conv2d, Dense, GlobalAvgPool, ReLU},
};
use crate::{MlErr, Result};

/// The residual networks that can be built, every variant maps to a complete layer plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    Resnet18,
    Resnet34,
}

impl Architecture {
    /// The amount of basic blocks in each of the four stages.
    fn stage_depths(self) -> [usize; 4] {
        match self {
            Architecture::Resnet18 => [2, 2, 2, 2],
            Architecture::Resnet34 => [3, 4, 6, 3],
        }
    }
}

impl Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Architecture::Resnet18 => "resnet18",
            Architecture::Resnet34 => "resnet34",
        };

        f.write_str(name)
    }
}

/// Everything needed to rebuild the same network layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResNetConfig {
    pub architecture: Architecture,
    pub in_channels: usize,
    pub num_classes: usize,
    /// The amount of feature maps of the stem and first stage, doubled on every later stage.
    pub base_width: usize,
}

impl ResNetConfig {
    pub const DEFAULT_BASE_WIDTH: usize = 64;

    pub fn new(architecture: Architecture, in_channels: usize, num_classes: usize) -> Self {
        Self {
            architecture,
            in_channels,
            num_classes,
            base_width: Self::DEFAULT_BASE_WIDTH,
        }
    }

    pub fn with_base_width(mut self, base_width: usize) -> Self {
        self.base_width = base_width;
        self
    }
}

/// Hands out consecutive slices of the flat parameter buffer and normalization layer indices.
#[derive(Default)]
struct Layout {
    offset: usize,
    norms: usize,
}

impl Layout {
    fn conv(&mut self, i: usize, o: usize, kernel: usize, stride: usize, padding: usize) -> Conv2d {
        let conv = Conv2d::new(i, o, kernel, stride, padding, self.offset);
        self.offset += conv.size();
        conv
    }

    fn norm(&mut self, channels: usize) -> BatchNorm2d {
        let bn = BatchNorm2d::new(channels, self.offset, self.norms);
        self.offset += bn.size();
        self.norms += 1;
        bn
    }

    fn dense(&mut self, dim: (usize, usize)) -> Dense {
        let dense = Dense::new(dim, self.offset);
        self.offset += dense.size();
        dense
    }
}

/// Two 3x3 convolutions with a residual connection, projected by a 1x1 convolution when the
/// shape changes.
struct BasicBlock {
    conv1: Conv2d,
    bn1: BatchNorm2d,
    relu1: ReLU,
    conv2: Conv2d,
    bn2: BatchNorm2d,
    shortcut: Option<(Conv2d, BatchNorm2d)>,
    relu2: ReLU,
}

impl BasicBlock {
    fn new(layout: &mut Layout, in_channels: usize, out_channels: usize, stride: usize) -> Self {
        let conv1 = layout.conv(in_channels, out_channels, 3, stride, 1);
        let bn1 = layout.norm(out_channels);
        let conv2 = layout.conv(out_channels, out_channels, 3, 1, 1);
        let bn2 = layout.norm(out_channels);

        let shortcut = (stride != 1 || in_channels != out_channels).then(|| {
            let conv = layout.conv(in_channels, out_channels, 1, stride, 0);
            (conv, layout.norm(out_channels))
        });

        Self {
            conv1,
            bn1,
            relu1: ReLU::default(),
            conv2,
            bn2,
            shortcut,
            relu2: ReLU::default(),
        }
    }

    fn init<R: Rng>(&self, params: &mut [f32], rng: &Rc<RefCell<R>>) -> Result<()> {
        self.conv1.init(params, Rc::clone(rng))?;
        self.bn1.init(params);
        self.conv2.init(params, Rc::clone(rng))?;
        self.bn2.init(params);

        if let Some((conv, bn)) = &self.shortcut {
            conv.init(params, Rc::clone(rng))?;
            bn.init(params);
        }

        Ok(())
    }

    fn norms(&self) -> Vec<&BatchNorm2d> {
        let mut norms = vec![&self.bn1, &self.bn2];
        if let Some((_, bn)) = &self.shortcut {
            norms.push(bn);
        }
        norms
    }

    fn norms_mut(&mut self) -> Vec<&mut BatchNorm2d> {
        let mut norms = vec![&mut self.bn1, &mut self.bn2];
        if let Some((_, bn)) = &mut self.shortcut {
            norms.push(bn);
        }
        norms
    }

    fn forward(
        &mut self,
        params: &[f32],
        x: Array4<f32>,
        mode: Mode,
        hooks: &mut HookRegistry,
    ) -> Result<Array4<f32>> {
        let out = self.conv1.forward(params, x.view(), mode)?;
        let out = self.bn1.forward(params, out, mode, hooks)?;
        let out = self.relu1.forward(out, mode);
        let out = self.conv2.forward(params, out.view(), mode)?;
        let mut out = self.bn2.forward(params, out, mode, hooks)?;

        match &mut self.shortcut {
            Some((conv, bn)) => {
                let skip = conv.forward(params, x.view(), mode)?;
                out += &bn.forward(params, skip, mode, hooks)?;
            }
            None => out += &x,
        }

        Ok(self.relu2.forward(out, mode))
    }

    fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d: Array4<f32>,
        norm_grads: &[Array1<f32>],
    ) -> Result<Array4<f32>> {
        let d = self.relu2.backward(d)?;

        let d_skip = match &mut self.shortcut {
            Some((conv, bn)) => {
                let extra = norm_grads.get(bn.index());
                let d_skip = bn.backward(params, grad, d.clone(), extra)?;
                conv.backward(params, grad, &d_skip)?
            }
            None => d.clone(),
        };

        let extra = norm_grads.get(self.bn2.index());
        let d = self.bn2.backward(params, grad, d, extra)?;
        let d = self.conv2.backward(params, grad, &d)?;
        let d = self.relu1.backward(d)?;
        let extra = norm_grads.get(self.bn1.index());
        let d = self.bn1.backward(params, grad, d, extra)?;
        let d = self.conv1.backward(params, grad, &d)?;

        Ok(d + d_skip)
    }
}

/// A residual convolutional classifier: a 3x3 stem, four stages of basic blocks, global average
/// pooling and a fully connected head.
///
/// The network doesn't own its parameters, they are passed as a flat buffer on every call. The
/// running statistics of the normalization layers are the only state it owns besides the
/// backward caches.
pub struct ResNet {
    config: ResNetConfig,
    stem: Conv2d,
    stem_bn: BatchNorm2d,
    stem_relu: ReLU,
    blocks: Vec<BasicBlock>,
    pool: GlobalAvgPool,
    head: Dense,
    size: usize,
    mode: Mode,
    hooks: HookRegistry,
}

/// Builds a ResNet-18 with the default width.
pub fn resnet18(in_channels: usize, num_classes: usize) -> ResNet {
    ResNet::new(ResNetConfig::new(Architecture::Resnet18, in_channels, num_classes))
}

/// Builds a ResNet-34 with the default width.
pub fn resnet34(in_channels: usize, num_classes: usize) -> ResNet {
    ResNet::new(ResNetConfig::new(Architecture::Resnet34, in_channels, num_classes))
}

impl ResNet {
    pub fn new(config: ResNetConfig) -> Self {
        let mut layout = Layout::default();
        let width = config.base_width;

        let stem = layout.conv(config.in_channels, width, 3, 1, 1);
        let stem_bn = layout.norm(width);

        let mut blocks = Vec::new();
        let mut in_channels = width;
        for (stage, depth) in config.architecture.stage_depths().into_iter().enumerate() {
            let out_channels = width << stage;
            for i in 0..depth {
                let stride = if stage > 0 && i == 0 { 2 } else { 1 };
                blocks.push(BasicBlock::new(&mut layout, in_channels, out_channels, stride));
                in_channels = out_channels;
            }
        }

        let head = layout.dense((in_channels, config.num_classes));

        Self {
            config,
            stem,
            stem_bn,
            stem_relu: ReLU::default(),
            blocks,
            pool: GlobalAvgPool::default(),
            head,
            size: layout.offset,
            mode: Mode::Train,
            hooks: HookRegistry::default(),
        }
    }

    pub fn config(&self) -> ResNetConfig {
        self.config
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Creates a freshly initialized parameter buffer for this network.
    ///
    /// Convolutions get Kaiming normal weights, normalization layers start as the identity and the
    /// head is sampled uniformly in `±1/sqrt(fan_in)`.
    pub fn init_params<R: Rng>(&self, rng: Rc<RefCell<R>>) -> Result<Vec<f32>> {
        let mut params = vec![0.; self.size];

        self.stem.init(&mut params, Rc::clone(&rng))?;
        self.stem_bn.init(&mut params);
        for block in &self.blocks {
            block.init(&mut params, &rng)?;
        }
        self.head.init(&mut params, rng)?;

        Ok(params)
    }

    /// Replaces the classifier head with a freshly initialized one for `num_classes` outputs.
    ///
    /// The head's parameters are the tail of the buffer, so `params` is truncated and regrown.
    pub fn reinit_head<R: Rng>(
        &mut self,
        params: &mut Vec<f32>,
        num_classes: usize,
        rng: Rc<RefCell<R>>,
    ) -> Result<()> {
        self.check_len("params", params.len())?;

        let offset = self.head.offset();
        self.head = Dense::new((self.head.inputs(), num_classes), offset);
        self.config.num_classes = num_classes;
        self.size = offset + self.head.size();

        params.truncate(offset);
        params.resize(self.size, 0.);
        self.head.init(params, rng)
    }

    /// The normalization layers in the order the forward pass runs them.
    pub fn norm_layers(&self) -> Vec<&BatchNorm2d> {
        let mut norms = vec![&self.stem_bn];
        norms.extend(self.blocks.iter().flat_map(BasicBlock::norms));
        norms
    }

    pub fn norm_layers_mut(&mut self) -> Vec<&mut BatchNorm2d> {
        let mut norms = vec![&mut self.stem_bn];
        norms.extend(self.blocks.iter_mut().flat_map(BasicBlock::norms_mut));
        norms
    }

    /// Registers an observer called after every normalization layer of every forward pass.
    pub fn register_forward_hook(&mut self, hook: ForwardHook) {
        self.hooks.register(hook);
    }

    pub fn has_forward_hooks(&self) -> bool {
        !self.hooks.is_empty()
    }

    /// The counter of the latest forward pass, as seen by the forward hooks.
    pub fn passes(&self) -> u64 {
        self.hooks.pass()
    }

    /// Backpropagates the delta of the logits through the network, adding every parameter's
    /// gradient into `grad`.
    ///
    /// # Arguments
    /// * `params` - The model's parameters.
    /// * `grad` - The gradient buffer, it must be zeroed by the caller beforehand.
    /// * `d_logits` - The delta of the last forward pass' output.
    /// * `norm_grads` - Extra per-channel gradients added at the input of the normalization
    ///   layer with the same index, may be shorter than the amount of normalization layers.
    ///
    /// # Errors
    /// An error if the buffers don't match the model size or the last forward wasn't in
    /// `Mode::Train`.
    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d_logits: Array2<f32>,
        norm_grads: &[Array1<f32>],
    ) -> Result<()> {
        self.check_len("params", params.len())?;
        self.check_len("grad", grad.len())?;

        let d = self.head.backward(params, grad, d_logits)?;
        let mut d = self.pool.backward(d)?;
        for block in self.blocks.iter_mut().rev() {
            d = block.backward(params, grad, d, norm_grads)?;
        }

        let d = self.stem_relu.backward(d)?;
        let extra = norm_grads.get(self.stem_bn.index());
        let d = self.stem_bn.backward(params, grad, d, extra)?;
        self.stem.backward_weights(grad, &d)
    }

    fn check_len(&self, what: &'static str, got: usize) -> Result<()> {
        if got != self.size {
            return Err(MlErr::SizeMismatch {
                a: what,
                b: "model",
                got,
                expected: self.size,
            });
        }

        Ok(())
    }
}

impl Model for ResNet {
    fn size(&self) -> usize {
        self.size
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    fn forward(&mut self, params: &[f32], x: ArrayView4<f32>) -> Result<Array2<f32>> {
        self.check_len("params", params.len())?;

        let mode = self.mode;
        self.hooks.begin_pass(mode);

        let out = self.stem.forward(params, x, mode)?;
        let out = self.stem_bn.forward(params, out, mode, &mut self.hooks)?;
        let mut out = self.stem_relu.forward(out, mode);
        for block in &mut self.blocks {
            out = block.forward(params, out, mode, &mut self.hooks)?;
        }

        let pooled = self.pool.forward(out, mode);
        self.head.forward(params, pooled, mode)
    }
}

impl Display for ResNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ResNetConfig {
            architecture,
            in_channels,
            num_classes,
            base_width,
        } = self.config;

        write!(
            f,
            "{architecture}(in_channels={in_channels}, num_classes={num_classes}, base_width={base_width}, blocks={}, norms={})",
            self.blocks.len(),
            self.norm_layers().len()
        )
    }
}
