//! Uploaded and decoded image types: raw uploads and RGB8 frames.

/// An encoded image as submitted by a client (JPEG, PNG, ...).
#[derive(Debug, Clone)]
pub struct RawImage {
    /// Label used in error messages; the uploaded filename when known.
    pub name: String,
    pub bytes: Vec<u8>,
}

impl RawImage {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    /// Label for an upload without a filename, by its position in the request.
    pub fn unnamed_label(index: usize) -> String {
        format!("image #{index}")
    }
}

/// A decoded image as packed RGB8 (width * height * 3 bytes).
#[derive(Debug, Clone)]
pub struct FaceImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl FaceImage {
    /// Decode any format supported by the `image` crate into RGB8.
    pub fn decode(bytes: &[u8]) -> Result<Self, image::ImageError> {
        let rgb = image::load_from_memory(bytes)?.to_rgb8();
        let (width, height) = rgb.dimensions();
        Ok(Self {
            data: rgb.into_raw(),
            width,
            height,
        })
    }

    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Self {
        debug_assert_eq!(data.len(), Self::rgb_len(width, height));
        Self { data, width, height }
    }

    /// Byte length of a packed RGB8 buffer, computed in `usize`.
    pub fn rgb_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 3
    }

    /// RGB value at (x, y). Out-of-bounds reads return black.
    pub fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
        if x >= self.width as usize || y >= self.height as usize {
            return [0, 0, 0];
        }
        let i = (y * self.width as usize + x) * 3;
        match self.data.get(i..i + 3) {
            Some(&[r, g, b]) => [r, g, b],
            _ => [0, 0, 0],
        }
    }

    /// Average luma (0.0–255.0), BT.601 weights.
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: f32 = self
            .data
            .chunks_exact(3)
            .map(|p| 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32)
            .sum();
        sum / (self.data.len() / 3) as f32
    }
}
