use crate::vol::{Shape, Vol};

use super::{LayerDetails, NetLayer};

/// Max pooling with a square window and a stride equal to the window, so each
/// input pixel feeds at most one output. Trailing rows and columns that do not
/// fill a whole window are dropped.
pub struct PoolLayer {
    sx: usize,

    // store switches for x,y coordinates for where the max comes from, for each output neuron
    switch_x: Vec<usize>,
    switch_y: Vec<usize>,
}

impl PoolLayer {
    pub fn new(sx: usize) -> Self {
        Self {
            sx,
            switch_x: Vec::new(),
            switch_y: Vec::new(),
        }
    }
}

impl NetLayer for PoolLayer {
    fn forward(&mut self, in_act: &Vol, out_act: &mut Vol, _is_training: bool) {
        let v = in_act;
        let shape = self.out_shape(v.shape());
        out_act.ensure_shape(shape);

        self.switch_x.resize(shape.len(), 0);
        self.switch_y.resize(shape.len(), 0);

        // a counter for switches
        let mut n = 0;
        for d in 0..shape.depth {
            for ax in 0..shape.sx {
                let x = ax * self.sx;

                for ay in 0..shape.sy {
                    let y = ay * self.sx;

                    let mut a = v.get(x, y, d);
                    let mut winx = x;
                    let mut winy = y;

                    for fx in 0..self.sx {
                        for fy in 0..self.sx {
                            let ox = x + fx;
                            let oy = y + fy;

                            let value = v.get(ox, oy, d);
                            // perform max pooling and store pointers to where
                            // the max came from. This will speed up backprop
                            if value > a {
                                a = value;
                                winx = ox;
                                winy = oy;
                            }
                        }
                    }

                    self.switch_x[n] = winx;
                    self.switch_y[n] = winy;
                    n += 1;

                    out_act.set(ax, ay, d, a);
                }
            }
        }
    }

    fn backward(&mut self, in_act: &mut Vol, out_act: &Vol) {
        // pooling layers have no parameters, so simply compute
        // gradient wrt data here
        let v = in_act;

        debug_assert_eq!(v.w.len(), v.dw.len());

        v.dw.fill(0.0);

        let mut n = 0;
        for d in 0..out_act.depth() {
            for ax in 0..out_act.sx() {
                for ay in 0..out_act.sy() {
                    let chain_grad = out_act.get_gradiant(ax, ay, d);

                    v.add_gradiant(self.switch_x[n], self.switch_y[n], d, chain_grad);

                    n += 1;
                }
            }
        }
    }

    fn params_and_grads(&mut self) -> Vec<LayerDetails<'_>> {
        Vec::new()
    }

    fn out_shape(&self, input: Shape) -> Shape {
        Shape::new(input.sx / self.sx, input.sy / self.sx, input.depth)
    }
}
