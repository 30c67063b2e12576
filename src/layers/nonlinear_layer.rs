use crate::vol::{Shape, Vol};

use super::{LayerDetails, NetLayer};

// Implements ReLU nonlinearity elementwise
// x -> max(0, x)
// the output is in [0, inf)
#[derive(Debug, Default, Clone, Copy)]
pub struct ReluLayer;

impl ReluLayer {
    pub fn new() -> Self {
        Self
    }
}

impl NetLayer for ReluLayer {
    fn forward(&mut self, in_act: &Vol, out_act: &mut Vol, _is_training: bool) {
        out_act.ensure_shape(in_act.shape());

        for (in_w, out_w) in in_act.w.iter().copied().zip(out_act.w.iter_mut()) {
            // threshold at 0
            *out_w = in_w.max(0.0);
        }
    }

    fn backward(&mut self, in_act: &mut Vol, out_act: &Vol) {
        assert_eq!(
            in_act.w.len(),
            out_act.w.len(),
            "in and out should have the same length"
        );

        for i in 0..in_act.w.len() {
            if out_act.w[i] <= 0.0 {
                // threshold
                in_act.dw[i] = 0.0;
            } else {
                in_act.dw[i] = out_act.dw[i];
            }
        }
    }

    fn params_and_grads(&mut self) -> Vec<LayerDetails<'_>> {
        Vec::new()
    }

    fn out_shape(&self, input: Shape) -> Shape {
        input
    }
}
