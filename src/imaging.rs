use image::{imageops::FilterType, DynamicImage, ImageReader, ImageResult};
use ndarray::{Array, Ix4};
use std::io::Cursor;

/// Grey used for the letterbox border, as the detector saw in training.
pub const PAD_VALUE: f32 = 114. / 255.;

/// Decodes an uploaded payload, guessing the format from its content.
pub fn decode_image(image_data: &[u8]) -> ImageResult<DynamicImage> {
    let image_reader = ImageReader::new(Cursor::new(image_data)).with_guessed_format()?;
    image_reader.decode()
}

/// Aspect-preserving fit of an image into the square network input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub gain: f32,
    pub pad_x: u32,
    pub pad_y: u32,
    pub resized_width: u32,
    pub resized_height: u32,
    pub width: u32,
    pub height: u32,
}

impl Letterbox {
    pub fn new(width: u32, height: u32, size: u32) -> Self {
        let gain = (size as f32 / width as f32).min(size as f32 / height as f32);
        let resized_width = ((width as f32 * gain).round() as u32).clamp(1, size);
        let resized_height = ((height as f32 * gain).round() as u32).clamp(1, size);

        Self {
            gain,
            pad_x: (size - resized_width) / 2,
            pad_y: (size - resized_height) / 2,
            resized_width,
            resized_height,
            width,
            height,
        }
    }

    /// Maps an x coordinate from network input space back to image pixels.
    pub fn restore_x(&self, x: f32) -> f32 {
        ((x - self.pad_x as f32) / self.gain).clamp(0., self.width as f32)
    }

    pub fn restore_y(&self, y: f32) -> f32 {
        ((y - self.pad_y as f32) / self.gain).clamp(0., self.height as f32)
    }
}

/// Letterboxes into a `[1, 3, size, size]` RGB tensor scaled to `[0, 1]`,
/// border filled with [`PAD_VALUE`].
pub fn to_input_tensor(image: &DynamicImage, size: u32) -> (Array<f32, Ix4>, Letterbox) {
    let letterbox = Letterbox::new(image.width(), image.height(), size);
    let img = image
        .resize_exact(
            letterbox.resized_width,
            letterbox.resized_height,
            FilterType::Triangle,
        )
        .to_rgb8();

    let side = size as usize;
    let mut input = Array::from_elem((1, 3, side, side), PAD_VALUE);
    for (x, y, pixel) in img.enumerate_pixels() {
        let x = (x + letterbox.pad_x) as usize;
        let y = (y + letterbox.pad_y) as usize;
        let [r, g, b] = pixel.0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    (input, letterbox)
}
