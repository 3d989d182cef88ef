use std::{
    cell::{Ref, RefCell},
    rc::Rc,
};

use machine_learning::{
    MlErr,
    arch::{Mode, ResNet, hooks::HookCtx},
};
use ndarray::{Array1, ArrayView4, Axis};

use crate::Result;

/// What the tap keeps of a normalization layer's input: its per-channel mean over the batch and
/// spatial axes, tagged with the forward pass that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    pub pass: u64,
    pub mode: Mode,
    pub channel_means: Array1<f32>,
    /// The amount of values averaged per channel, `n * h * w`.
    pub count: usize,
}

impl Capture {
    fn new(ctx: HookCtx, input: ArrayView4<f32>) -> Self {
        let (n, _, h, w) = input.dim();
        let count = n * h * w;
        let channel_means =
            input.sum_axis(Axis(3)).sum_axis(Axis(2)).sum_axis(Axis(0)) / count.max(1) as f32;

        Self {
            pass: ctx.pass,
            mode: ctx.mode,
            channel_means,
            count,
        }
    }
}

/// The latest capture of every normalization layer, indexed by the layer's position.
#[derive(Debug, Default)]
pub struct CaptureBuffer {
    slots: Vec<Option<Capture>>,
}

impl CaptureBuffer {
    pub fn get(&self, layer: usize) -> Option<&Capture> {
        self.slots.get(layer).and_then(Option::as_ref)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn record(&mut self, layer: usize, capture: Capture) {
        if layer >= self.slots.len() {
            self.slots.resize(layer + 1, None);
        }

        self.slots[layer] = Some(capture);
    }
}

/// Read-only instrumentation of a model's normalization layers.
///
/// Once installed, every forward pass of the model overwrites the capture of each normalization
/// layer with a summary of that layer's input.
pub struct ActivationTap {
    buffer: Rc<RefCell<CaptureBuffer>>,
    layers: usize,
}

impl ActivationTap {
    /// Installs the tap on `model`.
    ///
    /// # Errors
    /// `MlErr::HooksAlreadyInstalled` if the model is already being observed.
    pub fn install(model: &mut ResNet) -> Result<Self> {
        if model.has_forward_hooks() {
            return Err(MlErr::HooksAlreadyInstalled.into());
        }

        let layers = model.norm_layers().len();
        let buffer = Rc::new(RefCell::new(CaptureBuffer {
            slots: vec![None; layers],
        }));

        let sink = Rc::clone(&buffer);
        model.register_forward_hook(Box::new(
            move |ctx: HookCtx, input: ArrayView4<f32>, _: ArrayView4<f32>| {
                sink.borrow_mut().record(ctx.layer, Capture::new(ctx, input));
            },
        ));

        Ok(Self { buffer, layers })
    }

    /// The amount of tapped layers.
    pub fn layers(&self) -> usize {
        self.layers
    }

    /// Borrows the captures, the borrow must end before the next forward pass.
    pub fn captures(&self) -> Ref<'_, CaptureBuffer> {
        self.buffer.borrow()
    }
}
