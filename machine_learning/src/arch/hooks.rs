use ndarray::ArrayView4;

use super::Mode;

/// What a forward hook gets to know about the layer invocation it observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookCtx {
    /// The position of the observed layer among the model's normalization layers.
    pub layer: usize,
    /// The forward pass counter, incremented once per model forward.
    pub pass: u64,
    pub mode: Mode,
}

/// An observer called with the input and output of a normalization layer right after it runs.
pub type ForwardHook = Box<dyn FnMut(HookCtx, ArrayView4<f32>, ArrayView4<f32>)>;

/// The registration point of a model's forward hooks.
///
/// Hooks are invoked synchronously, in registration order, every time a normalization layer
/// finishes its forward computation. They only receive read-only views, so they can neither
/// alter the model's output nor reenter it.
#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<ForwardHook>,
    pass: u64,
    mode: Mode,
}

impl HookRegistry {
    pub fn register(&mut self, hook: ForwardHook) {
        self.hooks.push(hook);
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Starts a new forward pass and returns its counter.
    pub fn begin_pass(&mut self, mode: Mode) -> u64 {
        self.pass += 1;
        self.mode = mode;
        self.pass
    }

    /// The counter of the latest forward pass, zero before the first one.
    pub fn pass(&self) -> u64 {
        self.pass
    }

    pub fn notify(&mut self, layer: usize, input: ArrayView4<f32>, output: ArrayView4<f32>) {
        let ctx = HookCtx {
            layer,
            pass: self.pass,
            mode: self.mode,
        };

        for hook in &mut self.hooks {
            hook(ctx, input.view(), output.view());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use ndarray::Array4;

    use super::*;

    #[test]
    fn hooks_run_in_registration_order_with_pass_context() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut registry = HookRegistry::default();

        for id in 0..2 {
            let seen = Rc::clone(&seen);
            registry.register(Box::new(
                move |ctx: HookCtx, _: ArrayView4<f32>, _: ArrayView4<f32>| {
                    seen.borrow_mut().push((id, ctx))
                },
            ));
        }

        let x = Array4::<f32>::zeros((1, 1, 1, 1));
        let pass = registry.begin_pass(Mode::Eval);
        registry.notify(3, x.view(), x.view());

        let ctx = HookCtx {
            layer: 3,
            pass,
            mode: Mode::Eval,
        };
        assert_eq!(pass, 1);
        assert_eq!(*seen.borrow(), vec![(0, ctx), (1, ctx)]);
    }
}
