use std::fs::File;
use std::io::{BufWriter, Cursor};
use std::path::Path;
use std::sync::Arc;

use image::{DynamicImage, ImageFormat, ImageOutputFormat, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::layer::BlendMode;
use crate::pixels::{CHANNELS, CoverageBuffer, PixelBuffer};
use crate::stack::LayerStack;

// ============================================================================
// PIXEL CODECS
// ============================================================================

/// Boundary to whatever turns encoded image bytes into pixels and back.
pub trait PixelCodec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<(PixelBuffer, ImageFormat)>;
    fn encode(&self, buffer: &PixelBuffer, format: ImageFormat) -> Result<Vec<u8>>;
}

/// [`PixelCodec`] backed by the `image` crate.
#[derive(Clone, Copy, Debug)]
pub struct ImageCodec {
    pub jpeg_quality: u8,
}

impl Default for ImageCodec {
    fn default() -> Self {
        Self { jpeg_quality: 90 }
    }
}

impl PixelCodec for ImageCodec {
    fn decode(&self, bytes: &[u8]) -> Result<(PixelBuffer, ImageFormat)> {
        let format = image::guess_format(bytes)?;
        let img = image::load_from_memory_with_format(bytes, format)?;
        Ok((PixelBuffer::from_rgba_image(img.into_rgba8()), format))
    }

    fn encode(&self, buffer: &PixelBuffer, format: ImageFormat) -> Result<Vec<u8>> {
        let mut out = Cursor::new(Vec::new());
        let rgba: RgbaImage = buffer.to_rgba_image();
        match format {
            // JPEG has no alpha channel
            ImageFormat::Jpeg => {
                let rgb = DynamicImage::ImageRgba8(rgba).to_rgb8();
                DynamicImage::ImageRgb8(rgb).write_to(&mut out, ImageOutputFormat::Jpeg(self.jpeg_quality))?;
            }
            other => DynamicImage::ImageRgba8(rgba).write_to(&mut out, other)?,
        }
        Ok(out.into_inner())
    }
}

/// Pick the image format from a file extension.
pub fn format_from_path(path: &Path) -> Result<ImageFormat> {
    ImageFormat::from_path(path)
        .map_err(|_| EngineError::unsupported(format!("no image format for '{}'", path.display())))
}

pub fn read_image(codec: &dyn PixelCodec, path: &Path) -> Result<PixelBuffer> {
    let bytes = std::fs::read(path)?;
    let (pixels, _) = codec.decode(&bytes)?;
    Ok(pixels)
}

pub fn write_image(codec: &dyn PixelCodec, buffer: &PixelBuffer, path: &Path) -> Result<()> {
    let bytes = codec.encode(buffer, format_from_path(path)?)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

// ============================================================================
// PCP PROJECT FILE FORMAT
// ============================================================================

const PCP_MAGIC: &str = "PCP1";
const PCP_VERSION: u32 = 1;

/// Maximum canvas dimension accepted from a project file (per axis).
pub const MAX_CANVAS_DIM: u32 = 32_768;
/// Maximum number of layers in a project file.
pub const MAX_LAYERS: usize = 256;

#[derive(Serialize, Deserialize)]
struct ProjectFile {
    magic: String,
    version: u32,
    width: u32,
    height: u32,
    layers: Vec<LayerRecord>,
}

#[derive(Serialize, Deserialize)]
struct LayerRecord {
    name: String,
    blend_mode: u8,
    opacity: f32,
    visible: bool,
    mask: Option<Vec<f32>>,
    pixels: Vec<u8>,
}

/// Serialize the layer stack.  Selection and history are session state and
/// are not written.
pub fn encode_project(stack: &LayerStack) -> Result<Vec<u8>> {
    let (width, height) = stack.canvas_size()?;
    let layers = stack
        .iter()
        .map(|layer| LayerRecord {
            name: layer.name().to_string(),
            blend_mode: layer.blend_mode().to_u8(),
            opacity: layer.opacity(),
            visible: layer.is_visible(),
            mask: layer.mask().map(|m| m.as_raw().to_vec()),
            pixels: layer.pixels().as_raw().to_vec(),
        })
        .collect();
    let file = ProjectFile {
        magic: PCP_MAGIC.to_string(),
        version: PCP_VERSION,
        width,
        height,
        layers,
    };
    Ok(bincode::serialize(&file)?)
}

pub fn decode_project(raw: &[u8]) -> Result<LayerStack> {
    // bincode writes a String as an 8-byte length then UTF-8, so the magic
    // sits at 8..12.
    if raw.len() < 12 {
        return Err(EngineError::Format("file too small".into()));
    }
    let magic = std::str::from_utf8(&raw[8..12]).unwrap_or("");
    if magic != PCP_MAGIC {
        return Err(EngineError::Format(format!("unknown magic '{}'", magic)));
    }

    let file: ProjectFile = bincode::deserialize(raw)?;
    if file.version != PCP_VERSION {
        return Err(EngineError::Format(format!(
            "unsupported project version {}",
            file.version
        )));
    }
    if file.width == 0 || file.height == 0 {
        return Err(EngineError::Format("canvas dimensions cannot be zero".into()));
    }
    if file.width > MAX_CANVAS_DIM || file.height > MAX_CANVAS_DIM {
        return Err(EngineError::Format(format!(
            "canvas size {}x{} exceeds maximum allowed {}x{}",
            file.width, file.height, MAX_CANVAS_DIM, MAX_CANVAS_DIM
        )));
    }
    if file.layers.len() > MAX_LAYERS {
        return Err(EngineError::Format(format!(
            "project contains {} layers, which exceeds the maximum of {}",
            file.layers.len(),
            MAX_LAYERS
        )));
    }

    let pixel_len = file.width as usize * file.height as usize * CHANNELS;
    let mask_len = file.width as usize * file.height as usize;
    let mut stack = LayerStack::new(file.width, file.height)?;
    for record in file.layers {
        if record.pixels.len() != pixel_len {
            return Err(EngineError::Format(format!(
                "layer '{}' has {} bytes, expected {}",
                record.name,
                record.pixels.len(),
                pixel_len
            )));
        }
        if !(0.0..=1.0).contains(&record.opacity) {
            return Err(EngineError::Format(format!(
                "layer '{}' has opacity {}",
                record.name, record.opacity
            )));
        }
        let mode = BlendMode::from_u8(record.blend_mode)
            .map_err(|_| EngineError::Format(format!("unknown blend mode id {}", record.blend_mode)))?;
        let pixels = PixelBuffer::from_raw(file.width, file.height, record.pixels)?;
        let mut layer = stack
            .layer_from_pixels(record.name, pixels)?
            .with_opacity(record.opacity)
            .with_blend_mode(mode)
            .with_visible(record.visible);
        if let Some(mask) = record.mask {
            if mask.len() != mask_len {
                return Err(EngineError::Format(format!(
                    "mask of layer '{}' has {} entries, expected {}",
                    layer.name(),
                    mask.len(),
                    mask_len
                )));
            }
            let mask = CoverageBuffer::from_raw(file.width, file.height, mask)?;
            layer.set_mask(Some(Arc::new(mask)));
        }
        let at = stack.len();
        stack.add_layer(at, layer)?;
    }
    Ok(stack)
}

pub fn save_project(stack: &LayerStack, path: &Path) -> Result<()> {
    let bytes = encode_project(stack)?;
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    std::io::Write::write_all(&mut writer, &bytes)?;
    std::io::Write::flush(&mut writer)?;
    Ok(())
}

pub fn load_project(path: &Path) -> Result<LayerStack> {
    let raw = std::fs::read(path)?;
    decode_project(&raw)
}

/// True for paths that should be opened as projects rather than images.
pub fn is_project_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pcp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::pixels::Rect;

    fn sample_stack() -> LayerStack {
        let mut stack = LayerStack::with_background(6, 4, [10, 20, 30, 255]).unwrap();
        let mut top = stack.new_layer("Top", [200, 0, 0, 128]).unwrap();
        top = top.with_opacity(0.5).with_blend_mode(BlendMode::Screen).with_visible(false);
        let mut mask = CoverageBuffer::new(6, 4).unwrap();
        mask.set(1, 1, 0.25);
        top.set_mask(Some(Arc::new(mask)));
        let at = stack.len();
        stack.add_layer(at, top).unwrap();
        stack
    }

    #[test]
    fn project_bytes_round_trip() {
        let stack = sample_stack();
        let loaded = decode_project(&encode_project(&stack).unwrap()).unwrap();
        assert_eq!(loaded.canvas_size().unwrap(), (6, 4));
        assert_eq!(loaded.len(), 2);
        for (a, b) in stack.iter().zip(loaded.iter()) {
            assert_eq!(a.name(), b.name());
            assert_eq!(a.opacity(), b.opacity());
            assert_eq!(a.blend_mode(), b.blend_mode());
            assert_eq!(a.is_visible(), b.is_visible());
            assert_eq!(a.pixels(), b.pixels());
            assert_eq!(a.mask(), b.mask());
        }
    }

    #[test]
    fn bad_magic_is_format_error() {
        let mut bytes = encode_project(&sample_stack()).unwrap();
        bytes[8] = b'X';
        assert_eq!(decode_project(&bytes).unwrap_err().kind(), ErrorKind::Format);
        assert_eq!(decode_project(&[1, 2, 3]).unwrap_err().kind(), ErrorKind::Format);
    }

    #[test]
    fn oversized_canvas_rejected() {
        let file = ProjectFile {
            magic: PCP_MAGIC.into(),
            version: PCP_VERSION,
            width: MAX_CANVAS_DIM + 1,
            height: 1,
            layers: Vec::new(),
        };
        let bytes = bincode::serialize(&file).unwrap();
        assert_eq!(decode_project(&bytes).unwrap_err().kind(), ErrorKind::Format);
    }

    #[test]
    fn short_pixel_data_rejected() {
        let file = ProjectFile {
            magic: PCP_MAGIC.into(),
            version: PCP_VERSION,
            width: 2,
            height: 2,
            layers: vec![LayerRecord {
                name: "bad".into(),
                blend_mode: 0,
                opacity: 1.0,
                visible: true,
                mask: None,
                pixels: vec![0; 15],
            }],
        };
        let bytes = bincode::serialize(&file).unwrap();
        assert_eq!(decode_project(&bytes).unwrap_err().kind(), ErrorKind::Format);
    }

    #[test]
    fn wrong_version_rejected() {
        let file = ProjectFile {
            magic: PCP_MAGIC.into(),
            version: 9,
            width: 1,
            height: 1,
            layers: Vec::new(),
        };
        let bytes = bincode::serialize(&file).unwrap();
        assert_eq!(decode_project(&bytes).unwrap_err().kind(), ErrorKind::Format);
    }

    #[test]
    fn png_codec_round_trip() {
        let mut buf = PixelBuffer::new(3, 2).unwrap();
        buf.put_pixel(2, 1, [1, 2, 3, 4]);
        let codec = ImageCodec::default();
        let bytes = codec.encode(&buf, ImageFormat::Png).unwrap();
        let (back, format) = codec.decode(&bytes).unwrap();
        assert_eq!(format, ImageFormat::Png);
        assert_eq!(back, buf);
        assert_eq!(back.bounds(), Rect::new(0, 0, 3, 2));
    }

    #[test]
    fn garbage_bytes_are_codec_error() {
        let err = ImageCodec::default().decode(b"definitely not an image").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Codec);
    }
}
