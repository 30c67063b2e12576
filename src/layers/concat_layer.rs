use crate::{
    error::Result,
    vol::{CropWindow, Shape, Vol},
};

/// Joins a skip connection with the upsampled map along the channel axis.
///
/// The skip activation is larger than the upsampled one (valid convolutions
/// shrink it less), so its centered window is cut out first; see
/// [`CropWindow::centered`] for the rule on odd differences. Channels of the
/// cropped skip come first, the upsampled channels follow.
#[derive(Debug, Default)]
pub struct CropConcatLayer {
    window: Option<CropWindow>,
}

impl CropConcatLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn out_shape(&self, skip: Shape, up: Shape) -> Shape {
        Shape::new(up.sx, up.sy, skip.depth + up.depth)
    }

    /// Fails with a shape error when the skip is smaller than `up`.
    pub fn forward(&mut self, skip: &Vol, up: &Vol, out_act: &mut Vol) -> Result<()> {
        let window = CropWindow::centered(skip.shape(), up.sx(), up.sy())?;
        self.window = Some(window);

        out_act.ensure_shape(self.out_shape(skip.shape(), up.shape()));

        let skip_depth = skip.depth();
        for y in 0..up.sy() {
            for x in 0..up.sx() {
                for d in 0..skip_depth {
                    out_act.set(x, y, d, skip.get(x + window.x, y + window.y, d));
                }
                for d in 0..up.depth() {
                    out_act.set(x, y, skip_depth + d, up.get(x, y, d));
                }
            }
        }
        Ok(())
    }

    /// Splits the incoming gradient: the skip part lands in `skip_grad.dw`
    /// (zero outside the crop window), the rest overwrites `up.dw`.
    pub fn backward(&mut self, skip_grad: &mut Vol, up: &mut Vol, out_act: &Vol) {
        let Some(window) = self.window else {
            return;
        };

        skip_grad.dw.fill(0.0);

        let skip_depth = skip_grad.depth();
        for y in 0..up.sy() {
            for x in 0..up.sx() {
                for d in 0..skip_depth {
                    skip_grad.set_gradiant(
                        x + window.x,
                        y + window.y,
                        d,
                        out_act.get_gradiant(x, y, d),
                    );
                }
                for d in 0..up.depth() {
                    up.set_gradiant(x, y, d, out_act.get_gradiant(x, y, skip_depth + d));
                }
            }
        }
    }
}
