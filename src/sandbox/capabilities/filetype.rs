//! Content sniffing from leading magic bytes.

use std::path::Path;

use serde::Serialize;
use tokio::io::AsyncReadExt;

use crate::sandbox::error::Result;

const SNIFF_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileKind {
    pub mime: &'static str,
    pub extension: &'static str,
    pub category: &'static str,
}

const fn kind(mime: &'static str, extension: &'static str, category: &'static str) -> FileKind {
    FileKind {
        mime,
        extension,
        category,
    }
}

const SIGNATURES: &[(&[u8], FileKind)] = &[
    (b"\x89PNG\r\n\x1a\n" as &[u8], kind("image/png", "png", "image")),
    (b"\xff\xd8\xff" as &[u8], kind("image/jpeg", "jpg", "image")),
    (b"GIF87a" as &[u8], kind("image/gif", "gif", "image")),
    (b"GIF89a" as &[u8], kind("image/gif", "gif", "image")),
    (b"%PDF-" as &[u8], kind("application/pdf", "pdf", "document")),
    (b"PK\x03\x04" as &[u8], kind("application/zip", "zip", "archive")),
    (b"\x1f\x8b" as &[u8], kind("application/gzip", "gz", "archive")),
    (b"<?xml" as &[u8], kind("application/xml", "xml", "document")),
];

pub const BINARY: FileKind = kind("application/octet-stream", "bin", "binary");
pub const TEXT: FileKind = kind("text/plain", "txt", "text");
const WEBP: FileKind = kind("image/webp", "webp", "image");
const BMP: FileKind = kind("image/bmp", "bmp", "image");
const HTML: FileKind = kind("text/html", "html", "document");
const JSON: FileKind = kind("application/json", "json", "text");

pub fn sniff(bytes: &[u8]) -> FileKind {
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return WEBP;
    }
    // BMP files carry a 14-byte file header and a DIB header of at least 12 bytes.
    if bytes.len() >= 26 && bytes.starts_with(b"BM") && bytes[14..18].iter().any(|b| *b != 0) {
        return BMP;
    }
    if let Some((_, found)) = SIGNATURES.iter().find(|(magic, _)| bytes.starts_with(magic)) {
        return *found;
    }
    if bytes.contains(&0) {
        return BINARY;
    }
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text,
        // A multi-byte character may be cut at the sniff boundary.
        Err(e) if e.error_len().is_none() => {
            std::str::from_utf8(&bytes[..e.valid_up_to()]).unwrap_or_default()
        }
        Err(_) => return BINARY,
    };
    let head = text.trim_start().to_ascii_lowercase();
    if head.starts_with("<!doctype html") || head.starts_with("<html") {
        HTML
    } else if head.starts_with('{') || head.starts_with('[') {
        JSON
    } else {
        TEXT
    }
}

pub async fn sniff_path(path: &Path) -> Result<FileKind> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; SNIFF_LEN];
    let mut filled = 0;
    while filled < SNIFF_LEN {
        let read = file.read(&mut buf[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    buf.truncate(filled);
    Ok(sniff(&buf))
}
