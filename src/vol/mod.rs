mod serde;

use rand::Rng;

use crate::{
    error::{Result, UnetError},
    utils::truncated_normal,
    Float,
};

/// Spatial width (sx), height (sy) and channel count (depth) of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ::serde::Serialize, ::serde::Deserialize)]
pub struct Shape {
    pub sx: usize,
    pub sy: usize,
    pub depth: usize,
}

impl Shape {
    pub fn new(sx: usize, sy: usize, depth: usize) -> Self {
        Self { sx, sy, depth }
    }

    pub fn len(&self) -> usize {
        self.sx * self.sy * self.depth
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.sy, self.sx, self.depth)
    }
}

// Vol is the basic building block of all data in a net.
// it is essentially just a 3D volume of numbers, with a
// width (sx), height (sy), and depth (depth).
// it is used to hold data for all filters, all volumes,
// all weights, and also stores all gradients w.r.t.
// the data. A whole image is one Vol: pixels are rows of
// sx entries, each carrying `depth` channels.
#[derive(Debug, Clone, ::serde::Serialize)]
pub struct Vol {
    sx: usize,
    sy: usize,
    depth: usize,

    pub w: Vec<Float>,

    #[serde(skip)]
    pub dw: Vec<Float>,
}

impl Vol {
    /// Weights drawn from a truncated normal, the initializer used for every
    /// convolution and transpose-convolution filter.
    pub fn truncated_normal<R: Rng + ?Sized>(
        sx: usize,
        sy: usize,
        depth: usize,
        std: Float,
        rng: &mut R,
    ) -> Self {
        let n = sx * sy * depth;
        let w = (0..n).map(|_| truncated_normal(rng, 0.0, std)).collect();
        Self {
            sx,
            sy,
            depth,
            w,
            dw: vec![0.0; n],
        }
    }

    pub fn with_constant(sx: usize, sy: usize, depth: usize, constant: Float) -> Self {
        let n = sx * sy * depth;
        Self {
            sx,
            sy,
            depth,
            w: vec![constant; n],
            dw: vec![0.0; n],
        }
    }

    pub fn zeros(sx: usize, sy: usize, depth: usize) -> Self {
        Self::with_constant(sx, sy, depth, 0.0)
    }

    pub fn from_shape(shape: Shape) -> Self {
        Self::zeros(shape.sx, shape.sy, shape.depth)
    }

    pub fn from_data(sx: usize, sy: usize, depth: usize, w: Vec<Float>) -> Result<Self> {
        if w.len() != sx * sy * depth {
            return Err(UnetError::shape(format!(
                "{} values cannot fill a {}",
                w.len(),
                Shape::new(sx, sy, depth)
            )));
        }
        let n = w.len();
        Ok(Self {
            sx,
            sy,
            depth,
            w,
            dw: vec![0.0; n],
        })
    }

    fn get_index(&self, x: usize, y: usize, d: usize) -> usize {
        ((self.sx * y) + x) * self.depth + d
    }

    pub fn get(&self, x: usize, y: usize, d: usize) -> Float {
        let index = self.get_index(x, y, d);
        self.w[index]
    }

    pub fn set(&mut self, x: usize, y: usize, d: usize, value: Float) {
        let index = self.get_index(x, y, d);
        self.w[index] = value
    }

    pub fn add(&mut self, x: usize, y: usize, d: usize, value: Float) {
        let index = self.get_index(x, y, d);
        self.w[index] += value
    }

    pub fn get_gradiant(&self, x: usize, y: usize, d: usize) -> Float {
        let index = self.get_index(x, y, d);
        self.dw[index]
    }

    pub fn set_gradiant(&mut self, x: usize, y: usize, d: usize, value: Float) {
        let index = self.get_index(x, y, d);
        self.dw[index] = value
    }

    pub fn add_gradiant(&mut self, x: usize, y: usize, d: usize, value: Float) {
        let index = self.get_index(x, y, d);
        self.dw[index] += value
    }

    pub fn clone_and_zero(&self) -> Self {
        Self::zeros(self.sx, self.sy, self.depth)
    }

    /// Reallocates to `shape` when it differs, so layers can follow whatever
    /// input size the net is fed. Contents are unspecified afterwards.
    pub fn ensure_shape(&mut self, shape: Shape) {
        if self.shape() != shape {
            *self = Self::from_shape(shape);
        } else if self.dw.len() != self.w.len() {
            self.dw = vec![0.0; self.w.len()];
        }
    }

    /// Copies values from `other`, resizing if needed, and clears gradients.
    pub fn copy_from(&mut self, other: &Vol) {
        self.ensure_shape(other.shape());
        self.w.copy_from_slice(&other.w);
        self.dw.fill(0.0);
    }

    /// Cuts the centered `sx` by `sy` window out of this volume, keeping every
    /// channel. A volume that already has that size is returned unchanged.
    pub fn crop_center(&self, sx: usize, sy: usize) -> Result<Vol> {
        let window = CropWindow::centered(self.shape(), sx, sy)?;
        if window.is_identity(self.shape()) {
            return Ok(self.clone());
        }

        let mut out = Vol::zeros(sx, sy, self.depth);
        for y in 0..sy {
            let src = self.get_index(window.x, window.y + y, 0);
            let dst = out.get_index(0, y, 0);
            let row = sx * self.depth;
            out.w[dst..dst + row].copy_from_slice(&self.w[src..src + row]);
        }
        Ok(out)
    }

    /// Values of one channel in row-major pixel order.
    pub fn channel(&self, d: usize) -> Vec<Float> {
        self.w.iter().skip(d).step_by(self.depth).copied().collect()
    }

    pub fn from_grayscale_image(img: &[u8], width: u32, height: u32) -> Result<Self> {
        if (width * height) as usize != img.len() {
            return Err(UnetError::shape(format!(
                "image should have 1 component luma, got {} bytes for {width}x{height}",
                img.len()
            )));
        }

        // normalize image pixels to [0, 1]
        let w = img.iter().map(|&pixel| Float::from(pixel) / 255.0).collect();
        Self::from_data(width as usize, height as usize, 1, w)
    }

    pub fn shape(&self) -> Shape {
        Shape::new(self.sx, self.sy, self.depth)
    }

    pub fn sx(&self) -> usize {
        self.sx
    }
    pub fn sy(&self) -> usize {
        self.sy
    }
    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// Offset of the lower edge when a span of `from` is cut down to `to`.
///
/// The window is centered; when the difference is odd the extra row or column
/// is removed from the high side, i.e. the lower offset is rounded down.
pub fn centered_crop_offset(from: usize, to: usize) -> Result<usize> {
    if to > from {
        return Err(UnetError::shape(format!(
            "cannot crop a span of {from} to the larger span {to}"
        )));
    }
    Ok((from - to) / 2)
}

/// Rectangular sub-window used by skip connections and label cropping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropWindow {
    pub x: usize,
    pub y: usize,
    pub sx: usize,
    pub sy: usize,
}

impl CropWindow {
    pub fn centered(from: Shape, sx: usize, sy: usize) -> Result<Self> {
        Ok(Self {
            x: centered_crop_offset(from.sx, sx)?,
            y: centered_crop_offset(from.sy, sy)?,
            sx,
            sy,
        })
    }

    pub fn is_identity(&self, from: Shape) -> bool {
        self.x == 0 && self.y == 0 && self.sx == from.sx && self.sy == from.sy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(sx: usize, sy: usize, depth: usize) -> Vol {
        let n = sx * sy * depth;
        Vol::from_data(sx, sy, depth, (0..n).map(|i| i as Float).collect()).unwrap()
    }

    #[test]
    fn crop_offset_rounds_down_on_odd_difference() {
        assert_eq!(centered_crop_offset(10, 6).unwrap(), 2);
        assert_eq!(centered_crop_offset(11, 6).unwrap(), 2);
        assert_eq!(centered_crop_offset(6, 6).unwrap(), 0);
        assert!(centered_crop_offset(5, 6).is_err());
    }

    #[test]
    fn crop_center_takes_middle_window() {
        let v = ramp(4, 4, 2);
        let c = v.crop_center(2, 2).unwrap();
        assert_eq!(c.shape(), Shape::new(2, 2, 2));
        for y in 0..2 {
            for x in 0..2 {
                for d in 0..2 {
                    assert_eq!(c.get(x, y, d), v.get(x + 1, y + 1, d));
                }
            }
        }
    }

    #[test]
    fn crop_center_is_idempotent() {
        let v = ramp(9, 7, 3);
        let once = v.crop_center(5, 4).unwrap();
        let twice = once.crop_center(5, 4).unwrap();
        assert_eq!(once.w, twice.w);

        let same = v.crop_center(9, 7).unwrap();
        assert_eq!(same.w, v.w);
    }

    #[test]
    fn channel_extracts_interleaved_values() {
        let v = ramp(2, 1, 3);
        assert_eq!(v.channel(0), vec![0.0, 3.0]);
        assert_eq!(v.channel(2), vec![2.0, 5.0]);
    }

    #[test]
    fn from_data_rejects_wrong_length() {
        assert!(Vol::from_data(2, 2, 1, vec![0.0; 3]).is_err());
    }

    #[test]
    fn json_round_trip_restores_gradient_buffer() {
        let v = ramp(3, 2, 2);
        let text = serde_json::to_string(&v).unwrap();
        let back: Vol = serde_json::from_str(&text).unwrap();
        assert_eq!(back.shape(), v.shape());
        assert_eq!(back.w, v.w);
        assert_eq!(back.dw.len(), back.w.len());
    }
}
