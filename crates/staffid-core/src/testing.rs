//! Scripted encoder for service tests.
//!
//! Image bytes are a tiny text script: `face:<f32>,<f32>,...` yields that
//! vector as-is, `noface` yields no face, `broken` yields a decode failure.

use crate::frame::RawImage;
use crate::pipeline::{FaceEncoder, PipelineError};
use crate::types::Embedding;
use std::io;

#[derive(Default)]
pub struct ScriptedEncoder {
    pub calls: usize,
}

impl FaceEncoder for ScriptedEncoder {
    fn encode(&mut self, image: &RawImage) -> Result<Option<Embedding>, PipelineError> {
        self.calls += 1;
        let script = String::from_utf8_lossy(&image.bytes);
        if let Some(values) = script.strip_prefix("face:") {
            let values = values
                .split(',')
                .map(|v| v.trim().parse::<f32>().expect("scripted value"))
                .collect();
            return Ok(Some(Embedding::new(values)));
        }
        if script == "noface" {
            return Ok(None);
        }
        Err(PipelineError::Decode(image::ImageError::IoError(io::Error::other(
            "scripted decode failure",
        ))))
    }
}

pub fn face(name: &str, values: &[f32]) -> RawImage {
    let script = values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(",");
    RawImage::new(name, format!("face:{script}").into_bytes())
}

pub fn no_face(name: &str) -> RawImage {
    RawImage::new(name, b"noface".to_vec())
}

pub fn broken(name: &str) -> RawImage {
    RawImage::new(name, b"broken".to_vec())
}
