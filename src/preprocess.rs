//! Image decoding and tensor preprocessing.
//!
//! Every image goes through the same steps before reaching a model:
//! 1. decode to RGB and anchor it top-left on a canvas of at least
//!    `min_canvas` pixels per side,
//! 2. zero-pad bottom/right to a square of the longest side,
//! 3. bilinear resize to the model input resolution,
//! 4. scale channels to `[0, 1]`,
//! 5. add a batch dimension, giving an NHWC tensor `[1, size, size, 3]`.

use crate::error::{Result, SentryError};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage, RgbaImage};
use ndarray::Array4;

/// Decode raw bytes into an RGB bitmap placed on a zero-filled canvas.
pub fn decode_image(src: &str, bytes: &[u8], min_canvas: u32) -> Result<RgbImage> {
    let decoded = image::load_from_memory(bytes).map_err(|e| SentryError::decode(src, e))?;
    let rgb = if decoded.color().has_alpha() {
        drop_alpha(&decoded.to_rgba8())
    } else {
        decoded.to_rgb8()
    };

    let (width, height) = rgb.dimensions();
    if width == 0 || height == 0 {
        return Err(SentryError::decode(src, "image has no pixels"));
    }

    let canvas_width = width.max(min_canvas);
    let canvas_height = height.max(min_canvas);
    if canvas_width == width && canvas_height == height {
        return Ok(rgb);
    }

    let mut canvas = RgbImage::new(canvas_width, canvas_height);
    imageops::replace(&mut canvas, &rgb, 0, 0);
    Ok(canvas)
}

/// RGB of a canvas readback: fully transparent pixels come out black, every
/// other pixel keeps its stored color.
fn drop_alpha(rgba: &RgbaImage) -> RgbImage {
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        if a == 0 {
            Rgb([0, 0, 0])
        } else {
            Rgb([r, g, b])
        }
    })
}

/// Pad bottom and right with zeros so the image becomes `max × max`.
pub fn pad_to_square(image: &RgbImage) -> RgbImage {
    let (width, height) = image.dimensions();
    let max_size = width.max(height);

    let mut square = RgbImage::new(max_size, max_size);
    imageops::replace(&mut square, image, 0, 0);
    square
}

/// Build the model input tensor for `image` at `size × size`.
pub fn preprocess(image: &RgbImage, size: u32) -> Array4<f32> {
    let square = pad_to_square(image);
    let resized = imageops::resize(&square, size, size, FilterType::Triangle);

    let side = size as usize;
    Array4::from_shape_fn((1, side, side, 3), |(_, y, x, c)| {
        f32::from(resized.get_pixel(x as u32, y as u32)[c]) / 255.0
    })
}

/// All-zero tensor used to warm a model up.
pub fn zeros(width: usize, height: usize) -> Array4<f32> {
    Array4::zeros((1, width, height, 3))
}
