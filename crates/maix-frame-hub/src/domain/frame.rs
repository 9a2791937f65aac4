//! The image frame and its wire renderings.
//!
//! One [`ImageFrame`] is kept per device key.  Each delivery style renders it
//! differently:
//!
//! | Style      | Rendering                                                    |
//! |------------|--------------------------------------------------------------|
//! | pull       | raw bytes plus `X-Image-*` headers                           |
//! | push       | raw bytes immediately followed by the ASCII ms timestamp     |
//! | stream     | one `multipart/x-mixed-replace` part with boundary `frame`   |

use std::io::Cursor;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use maix_core::ImageFormat;

/// Multipart boundary used by continuous streams.
pub const STREAM_BOUNDARY: &str = "frame";

/// Color space reported for every probed frame.  The device only emits RGB.
pub const DEFAULT_COLOR_SPACE: &str = "RGB";

/// Header facts about a frame, either supplied by the producer or probed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    pub color_space: String,
    pub format: ImageFormat,
}

/// The latest frame published under one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFrame {
    pub key: String,
    pub bytes: Bytes,
    /// Milliseconds since the Unix epoch when the hub accepted the frame.
    pub timestamp_ms: u64,
    pub metadata: Option<ImageMetadata>,
}

impl ImageFrame {
    pub fn new(key: impl Into<String>, bytes: Bytes, metadata: Option<ImageMetadata>) -> Self {
        Self {
            key: key.into(),
            bytes,
            timestamp_ms: now_ms(),
            metadata,
        }
    }

    /// MIME type of the frame.  Unprobed frames are assumed to be JPEG, the
    /// device's default encoding.
    pub fn content_type(&self) -> &'static str {
        self.metadata
            .as_ref()
            .map(|m| m.format.mime_type())
            .unwrap_or(ImageFormat::Jpeg.mime_type())
    }

    /// Push rendering: frame bytes then the decimal timestamp.
    pub fn push_message(&self) -> Vec<u8> {
        let stamp = self.timestamp_ms.to_string();
        let mut out = Vec::with_capacity(self.bytes.len() + stamp.len());
        out.extend_from_slice(&self.bytes);
        out.extend_from_slice(stamp.as_bytes());
        out
    }

    /// Stream rendering: one multipart part.
    pub fn multipart_chunk(&self) -> Bytes {
        let head = format!(
            "--{STREAM_BOUNDARY}\r\nContent-Type: {}\r\n\r\n",
            self.content_type()
        );
        let mut out = BytesMut::with_capacity(head.len() + self.bytes.len() + 2);
        out.put_slice(head.as_bytes());
        out.put_slice(&self.bytes);
        out.put_slice(b"\r\n");
        out.freeze()
    }
}

/// Reads width, height and format from the image header without decoding
/// pixels.  Returns `None` for anything that is not a JPEG or PNG header.
pub fn probe_metadata(bytes: &[u8]) -> Option<ImageMetadata> {
    let reader = image::io::Reader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?;
    let format = match reader.format()? {
        image::ImageFormat::Jpeg => ImageFormat::Jpeg,
        image::ImageFormat::Png => ImageFormat::Png,
        _ => return None,
    };
    let (width, height) = reader.into_dimensions().ok()?;
    Some(ImageMetadata {
        width,
        height,
        color_space: DEFAULT_COLOR_SPACE.to_string(),
        format,
    })
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(format: image::ImageOutputFormat, width: u32, height: u32) -> Vec<u8> {
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::new(width, height));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), format).unwrap();
        buf
    }

    #[test]
    fn test_probe_png_dimensions() {
        // Arrange
        let png = encode(image::ImageOutputFormat::Png, 4, 3);

        // Act
        let meta = probe_metadata(&png).expect("png header must probe");

        // Assert
        assert_eq!((meta.width, meta.height), (4, 3));
        assert_eq!(meta.format, ImageFormat::Png);
        assert_eq!(meta.color_space, "RGB");
    }

    #[test]
    fn test_probe_jpeg_dimensions() {
        let jpeg = encode(image::ImageOutputFormat::Jpeg(80), 16, 8);
        let meta = probe_metadata(&jpeg).expect("jpeg header must probe");
        assert_eq!((meta.width, meta.height), (16, 8));
        assert_eq!(meta.format, ImageFormat::Jpeg);
    }

    #[test]
    fn test_probe_garbage_is_none() {
        assert_eq!(probe_metadata(b"definitely not an image"), None);
        assert_eq!(probe_metadata(&[]), None);
    }

    #[test]
    fn test_push_message_appends_ascii_timestamp() {
        // Arrange
        let mut frame = ImageFrame::new("cam", Bytes::from_static(b"\xFF\xD8img"), None);
        frame.timestamp_ms = 1_700_000_000_123;

        // Act
        let msg = frame.push_message();

        // Assert
        assert_eq!(msg, b"\xFF\xD8img1700000000123".to_vec());
    }

    #[test]
    fn test_multipart_chunk_layout() {
        let frame = ImageFrame::new("cam", Bytes::from_static(b"JPEGDATA"), None);
        assert_eq!(
            frame.multipart_chunk(),
            Bytes::from_static(b"--frame\r\nContent-Type: image/jpeg\r\n\r\nJPEGDATA\r\n")
        );
    }

    #[test]
    fn test_content_type_follows_metadata() {
        let meta = ImageMetadata {
            width: 1,
            height: 1,
            color_space: "RGB".into(),
            format: ImageFormat::Png,
        };
        let frame = ImageFrame::new("cam", Bytes::new(), Some(meta));
        assert_eq!(frame.content_type(), "image/png");
    }

    #[test]
    fn test_new_frame_is_timestamped() {
        let frame = ImageFrame::new("cam", Bytes::new(), None);
        assert!(frame.timestamp_ms > 0);
    }
}
