//! Conversion of raw device buffers to packed RGB24.

use image::imageops::FilterType;
use image::RgbImage;
use zune_jpeg::JpegDecoder;

use super::frame::PixelFormat;
use crate::error::CaptureError;

/// Decoded RGB24 pixels together with their actual dimensions.
pub struct RgbPixels {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

pub fn decode_frame(
    data: &[u8],
    format: PixelFormat,
    width: u32,
    height: u32,
) -> Result<RgbPixels, CaptureError> {
    match format {
        PixelFormat::Mjpeg => {
            let mut decoder = JpegDecoder::new(data);
            let pixels = decoder
                .decode()
                .map_err(|e| CaptureError::Decode(format!("mjpeg: {e:?}")))?;
            let (w, h) = decoder
                .dimensions()
                .ok_or_else(|| CaptureError::Decode("mjpeg: missing dimensions".into()))?;
            Ok(RgbPixels {
                data: pixels,
                width: w as u32,
                height: h as u32,
            })
        }
        PixelFormat::Rgb24 => {
            expect_len(data, width as usize * height as usize * 3)?;
            Ok(RgbPixels {
                data: data.to_vec(),
                width,
                height,
            })
        }
        PixelFormat::Bgr24 => {
            expect_len(data, width as usize * height as usize * 3)?;
            let mut rgb = Vec::with_capacity(data.len());
            for px in data.chunks_exact(3) {
                rgb.extend_from_slice(&[px[2], px[1], px[0]]);
            }
            Ok(RgbPixels {
                data: rgb,
                width,
                height,
            })
        }
        PixelFormat::Yuyv4 => {
            expect_len(data, width as usize * height as usize * 2)?;
            Ok(RgbPixels {
                data: yuyv_to_rgb(data),
                width,
                height,
            })
        }
    }
}

fn expect_len(data: &[u8], expected: usize) -> Result<(), CaptureError> {
    if data.len() < expected {
        return Err(CaptureError::Decode(format!(
            "short buffer: {} bytes, expected {}",
            data.len(),
            expected
        )));
    }
    Ok(())
}

/// YUYV (4:2:2) to RGB24 with integer BT.601 coefficients.
fn yuyv_to_rgb(data: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(data.len() / 2 * 3);
    for quad in data.chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        rgb.extend_from_slice(&yuv_pixel(y0, u, v));
        rgb.extend_from_slice(&yuv_pixel(y1, u, v));
    }
    rgb
}

fn yuv_pixel(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}

/// Rescales RGB24 pixels to the configured output resolution.
pub fn resize_rgb(pixels: RgbPixels, width: u32, height: u32) -> Result<Vec<u8>, CaptureError> {
    if pixels.width == width && pixels.height == height {
        return Ok(pixels.data);
    }
    let image = RgbImage::from_raw(pixels.width, pixels.height, pixels.data)
        .ok_or_else(|| CaptureError::Decode("pixel buffer does not match its dimensions".into()))?;
    Ok(image::imageops::resize(&image, width, height, FilterType::Triangle).into_raw())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgr_is_swapped_to_rgb() {
        let out = decode_frame(&[1, 2, 3, 4, 5, 6], PixelFormat::Bgr24, 2, 1).unwrap();
        assert_eq!(out.data, vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn yuyv_white_and_black() {
        // Two white pixels followed by two black pixels.
        let data = [235, 128, 235, 128, 16, 128, 16, 128];
        let out = decode_frame(&data, PixelFormat::Yuyv4, 4, 1).unwrap();
        assert_eq!(out.data.len(), 12);
        assert!(out.data[..6].iter().all(|&c| c >= 250));
        assert!(out.data[6..].iter().all(|&c| c <= 2));
    }

    #[test]
    fn short_buffers_are_rejected() {
        let err = decode_frame(&[0; 5], PixelFormat::Rgb24, 2, 1).err().unwrap();
        assert!(matches!(err, CaptureError::Decode(_)));
    }

    #[test]
    fn resize_changes_dimensions() {
        let pixels = RgbPixels {
            data: vec![200; 4 * 4 * 3],
            width: 4,
            height: 4,
        };
        let out = resize_rgb(pixels, 2, 2).unwrap();
        assert_eq!(out.len(), 2 * 2 * 3);
        assert!(out.iter().all(|&c| c == 200));
    }
}
