mod concat_layer;
mod conv_layer;
mod deconv_layer;
mod loss_layer;
mod nonlinear_layer;
mod pool_layer;

pub use concat_layer::*;
pub use conv_layer::*;
pub use deconv_layer::*;
pub use loss_layer::*;
pub use nonlinear_layer::*;
pub use pool_layer::*;

use crate::{
    vol::{Shape, Vol},
    Float,
};

/// A single-input layer with a hand-written backward pass.
///
/// Layers do not fix their spatial size at construction: `forward` resizes
/// `out_act` to `out_shape(in_act.shape())`, so one net can be fed images of
/// any size that survives the valid convolutions.
pub trait NetLayer {
    fn forward(&mut self, in_act: &Vol, out_act: &mut Vol, is_training: bool);

    /// Reads the gradient in `out_act.dw` and overwrites `in_act.dw`.
    /// Parameter gradients are accumulated until the optimizer clears them.
    fn backward(&mut self, in_act: &mut Vol, out_act: &Vol);

    fn params_and_grads(&mut self) -> Vec<LayerDetails<'_>>;

    fn out_shape(&self, input: Shape) -> Shape;
}

#[derive(Debug)]
pub struct LayerDetails<'a> {
    pub name: String,
    pub params: &'a mut [Float],
    pub grads: &'a mut [Float],
}

/// Shared by the convolution flavours: one named entry per filter, then the biases.
pub(crate) fn filter_details<'a>(
    prefix: &str,
    filters: &'a mut [Vol],
    biases: &'a mut Vol,
) -> Vec<LayerDetails<'a>> {
    let mut result = Vec::with_capacity(filters.len() + 1);
    for (i, filter) in filters.iter_mut().enumerate() {
        result.push(LayerDetails {
            name: format!("{prefix}/weights/{i}"),
            params: &mut filter.w,
            grads: &mut filter.dw,
        });
    }

    result.push(LayerDetails {
        name: format!("{prefix}/biases"),
        params: &mut biases.w,
        grads: &mut biases.dw,
    });
    result
}
