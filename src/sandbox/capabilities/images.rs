use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{filetype, success};
use crate::sandbox::config::Config;
use crate::sandbox::convert::require_str;
use crate::sandbox::error::{ErrorCode, SandboxError};
use crate::sandbox::registrar::{CapabilityGroup, HostContext, HostFunction};

pub struct ImagesGroup;

impl CapabilityGroup for ImagesGroup {
    fn name(&self) -> &'static str {
        "images"
    }

    fn functions(&self, host: &HostContext) -> Vec<Arc<dyn HostFunction>> {
        vec![Arc::new(ImageInfoFn {
            config: host.config.clone(),
        })]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

fn be16(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]) as u32)
}

fn le16(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]) as u32)
}

fn be32(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn le_i32(bytes: &[u8], at: usize) -> Option<i32> {
    bytes
        .get(at..at + 4)
        .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub fn png_dimensions(bytes: &[u8]) -> Option<Dimensions> {
    if bytes.get(12..16)? != b"IHDR" {
        return None;
    }
    Some(Dimensions {
        width: be32(bytes, 16)?,
        height: be32(bytes, 20)?,
    })
}

pub fn gif_dimensions(bytes: &[u8]) -> Option<Dimensions> {
    Some(Dimensions {
        width: le16(bytes, 6)?,
        height: le16(bytes, 8)?,
    })
}

pub fn bmp_dimensions(bytes: &[u8]) -> Option<Dimensions> {
    // Negative heights mark top-down bitmaps.
    Some(Dimensions {
        width: le_i32(bytes, 18)?.unsigned_abs(),
        height: le_i32(bytes, 22)?.unsigned_abs(),
    })
}

/// Walk JPEG segments until a start-of-frame marker.
pub fn jpeg_dimensions(bytes: &[u8]) -> Option<Dimensions> {
    let mut pos = 2;
    loop {
        while *bytes.get(pos)? != 0xff {
            pos += 1;
        }
        while *bytes.get(pos)? == 0xff {
            pos += 1;
        }
        let marker = *bytes.get(pos)?;
        pos += 1;
        match marker {
            0xd8 | 0x01 | 0xd0..=0xd7 => continue,
            0xd9 | 0xda => return None,
            0xc0..=0xcf if !matches!(marker, 0xc4 | 0xc8 | 0xcc) => {
                return Some(Dimensions {
                    height: be16(bytes, pos + 3)?,
                    width: be16(bytes, pos + 5)?,
                });
            }
            _ => {
                let length = be16(bytes, pos)? as usize;
                pos += length;
            }
        }
    }
}

pub struct ImageInfoFn {
    config: Arc<Config>,
}

#[async_trait]
impl HostFunction for ImageInfoFn {
    fn name(&self) -> &'static str {
        "imageInfo"
    }

    fn description(&self) -> &'static str {
        "Format and pixel dimensions of a PNG, GIF, JPEG or BMP image"
    }

    async fn call(&self, args: &[Value]) -> Result<Value> {
        let path = PathBuf::from(require_str(args, 0, "path")?);
        let size = tokio::fs::metadata(&path).await?.len();
        if size > self.config.max_file_size {
            return Err(SandboxError::new(
                ErrorCode::ImageError,
                format!("{} is over the {} byte limit", path.display(), self.config.max_file_size),
            )
            .into());
        }
        let bytes = tokio::fs::read(&path).await?;
        let kind = filetype::sniff(&bytes[..bytes.len().min(512)]);
        let dimensions = match kind.extension {
            "png" => png_dimensions(&bytes),
            "gif" => gif_dimensions(&bytes),
            "jpg" => jpeg_dimensions(&bytes),
            "bmp" => bmp_dimensions(&bytes),
            _ => {
                return Err(SandboxError::new(
                    ErrorCode::ImageError,
                    format!("{} is not a supported image ({})", path.display(), kind.mime),
                )
                .into())
            }
        }
        .ok_or_else(|| {
            SandboxError::new(
                ErrorCode::ImageError,
                format!("{} has a truncated or corrupt {} header", path.display(), kind.extension),
            )
        })?;

        Ok(success(json!({
            "path": path.display().to_string(),
            "format": kind.extension,
            "mime": kind.mime,
            "width": dimensions.width,
            "height": dimensions.height,
            "size": size,
        })))
    }
}
