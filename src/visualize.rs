//! Grayscale JPEG dumps of verification and prediction maps.

use std::path::{Path, PathBuf};

use image::{GrayImage, ImageFormat};

use crate::{
    error::{Result, UnetError},
    utils::maxmin,
    vol::Vol,
    Float,
};

/// Min/max normalizes `values` to the full 0..=255 range. A constant input
/// maps to black.
pub fn to_gray(values: &[Float]) -> Vec<u8> {
    let Some(mm) = maxmin(values) else {
        return Vec::new();
    };
    if mm.diff_value <= 0.0 || !mm.diff_value.is_finite() {
        return vec![0; values.len()];
    }
    values
        .iter()
        .map(|v| ((v - mm.min_value) / mm.diff_value * 255.0).round() as u8)
        .collect()
}

/// Places equally sized single-channel panels side by side.
fn tile(panels: &[Vec<u8>], sx: usize, sy: usize) -> Result<GrayImage> {
    let width = sx * panels.len();
    let mut buffer = vec![0u8; width * sy];
    for (i, panel) in panels.iter().enumerate() {
        for y in 0..sy {
            let row = &panel[y * sx..(y + 1) * sx];
            let start = y * width + i * sx;
            buffer[start..start + sx].copy_from_slice(row);
        }
    }

    GrayImage::from_raw(width as u32, sy as u32, buffer)
        .ok_or_else(|| UnetError::shape(format!("cannot build a {width}x{sy} image")))
}

/// `[input | ground truth | prediction]` for one class, all cropped to the
/// prediction's spatial size.
pub fn combine_class_image(
    image: &Vol,
    label: &Vol,
    prediction: &Vol,
    class: usize,
) -> Result<GrayImage> {
    let (sx, sy) = (prediction.sx(), prediction.sy());
    let image = image.crop_center(sx, sy)?;
    let label = label.crop_center(sx, sy)?;

    let panels = [
        to_gray(&image.channel(0)),
        to_gray(&label.channel(class)),
        to_gray(&prediction.channel(class)),
    ];
    tile(&panels, sx, sy)
}

fn class_image_path(dir: &Path, tag: &str, class: usize) -> PathBuf {
    dir.join(format!("{tag}_{}.jpg", class + 1))
}

/// Writes `<dir>/<tag>_<class+1>.jpg` for every class of `prediction`.
pub fn save_class_images(
    dir: &Path,
    tag: &str,
    image: &Vol,
    label: &Vol,
    prediction: &Vol,
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::with_capacity(prediction.depth());
    for class in 0..prediction.depth() {
        let img = combine_class_image(image, label, prediction, class)?;
        let path = class_image_path(dir, tag, class);
        img.save_with_format(&path, ImageFormat::Jpeg)?;
        written.push(path);
    }
    Ok(written)
}

/// Like [`save_class_images`] without ground truth: only the probability map
/// of each class.
pub fn save_prediction_images(dir: &Path, tag: &str, prediction: &Vol) -> Result<Vec<PathBuf>> {
    let (sx, sy) = (prediction.sx(), prediction.sy());
    let mut written = Vec::with_capacity(prediction.depth());
    for class in 0..prediction.depth() {
        let img = tile(&[to_gray(&prediction.channel(class))], sx, sy)?;
        let path = class_image_path(dir, tag, class);
        img.save_with_format(&path, ImageFormat::Jpeg)?;
        written.push(path);
    }
    Ok(written)
}
