//! Device payload decoding into packed RGB24

use color_eyre::{eyre::eyre, Result};

use super::frame::CaptureFormat;

/// Packed RGB24 pixels produced from a device payload
#[derive(Debug)]
pub struct Decoded {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

/// Decode a raw device buffer into RGB24.
///
/// `width`/`height` are the negotiated capture dimensions. MJPEG payloads carry
/// their own dimensions, which take precedence.
pub fn decode_frame(data: &[u8], format: CaptureFormat, width: u32, height: u32) -> Result<Decoded> {
    match format {
        CaptureFormat::Mjpeg => decode_mjpeg(data),
        CaptureFormat::Rgb24 => {
            let expected = width as usize * height as usize * 3;
            if data.len() < expected {
                return Err(eyre!(
                    "short RGB24 payload: {} bytes for {}x{}",
                    data.len(),
                    width,
                    height
                ));
            }
            Ok(Decoded {
                width,
                height,
                rgb: data[..expected].to_vec(),
            })
        }
        CaptureFormat::Yuyv4 => Ok(Decoded {
            width,
            height,
            rgb: yuyv_to_rgb(data, width, height)?,
        }),
    }
}

#[cfg(feature = "fast-jpeg")]
fn decode_mjpeg(data: &[u8]) -> Result<Decoded> {
    let mut decoder = zune_jpeg::JpegDecoder::new(data);
    let rgb = decoder
        .decode()
        .map_err(|e| eyre!("MJPEG decode failed: {:?}", e))?;
    let (width, height) = decoder
        .dimensions()
        .ok_or_else(|| eyre!("MJPEG decoder reported no dimensions"))?;

    check_rgb_len(rgb, width as u32, height as u32)
}

#[cfg(all(feature = "std-jpeg", not(feature = "fast-jpeg")))]
fn decode_mjpeg(data: &[u8]) -> Result<Decoded> {
    use jpeg_decoder::{Decoder, PixelFormat as JpegPixelFormat};

    let mut decoder = Decoder::new(data);
    let pixels = decoder.decode()?;
    let info = decoder
        .info()
        .ok_or_else(|| eyre!("MJPEG decoder reported no image info"))?;

    let rgb = match info.pixel_format {
        JpegPixelFormat::RGB24 => pixels,
        JpegPixelFormat::L8 => pixels.iter().flat_map(|&l| [l, l, l]).collect(),
        other => return Err(eyre!("unsupported JPEG pixel format: {:?}", other)),
    };

    check_rgb_len(rgb, info.width as u32, info.height as u32)
}

#[cfg(not(any(feature = "fast-jpeg", feature = "std-jpeg")))]
fn decode_mjpeg(_data: &[u8]) -> Result<Decoded> {
    Err(eyre!(
        "MJPEG decoding needs the `fast-jpeg` or `std-jpeg` feature"
    ))
}

fn check_rgb_len(rgb: Vec<u8>, width: u32, height: u32) -> Result<Decoded> {
    if rgb.len() != width as usize * height as usize * 3 {
        return Err(eyre!(
            "decoded {} bytes, expected RGB24 for {}x{}",
            rgb.len(),
            width,
            height
        ));
    }
    Ok(Decoded { width, height, rgb })
}

/// Convert packed YUYV 4:2:2 into RGB24 using BT.601 limited-range coefficients.
pub fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    if width % 2 != 0 {
        return Err(eyre!("YUYV frames need an even width, got {}", width));
    }
    let expected = width as usize * height as usize * 2;
    if data.len() < expected {
        return Err(eyre!(
            "short YUYV payload: {} bytes for {}x{}",
            data.len(),
            width,
            height
        ));
    }

    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for chunk in data[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = (y as i32 - 16) * 298;
    let d = u as i32 - 128;
    let e = v as i32 - 128;

    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(c + 409 * e),
        clamp(c - 100 * d - 208 * e),
        clamp(c + 516 * d),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuyv_grey_maps_to_grey() {
        // Y=126 with neutral chroma is mid grey in limited range.
        let data = [126, 128, 126, 128];
        let rgb = yuyv_to_rgb(&data, 2, 1).unwrap();
        assert_eq!(rgb.len(), 6);
        assert!(rgb.iter().all(|&c| (127..=129).contains(&c)), "{:?}", rgb);
    }

    #[test]
    fn yuyv_black_and_white_clamp() {
        let data = [16, 128, 235, 128];
        let rgb = yuyv_to_rgb(&data, 2, 1).unwrap();
        assert_eq!(&rgb[..3], &[0, 0, 0]);
        assert_eq!(&rgb[3..], &[255, 255, 255]);
    }

    #[test]
    fn yuyv_rejects_odd_width_and_short_payload() {
        assert!(yuyv_to_rgb(&[0; 8], 3, 1).is_err());
        assert!(yuyv_to_rgb(&[0; 4], 4, 1).is_err());
    }

    #[cfg(any(feature = "fast-jpeg", feature = "std-jpeg"))]
    #[test]
    fn mjpeg_payload_decodes_with_embedded_dimensions() {
        use image::codecs::jpeg::JpegEncoder;
        use image::{ExtendedColorType, RgbImage};

        let image = RgbImage::from_pixel(8, 4, image::Rgb([200, 40, 40]));
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, 95)
            .encode(image.as_raw(), 8, 4, ExtendedColorType::Rgb8)
            .unwrap();

        // Negotiated dimensions are ignored for MJPEG.
        let decoded = decode_frame(&jpeg, CaptureFormat::Mjpeg, 1, 1).unwrap();
        assert_eq!((decoded.width, decoded.height), (8, 4));
        assert_eq!(decoded.rgb.len(), 8 * 4 * 3);
        let red = decoded.rgb[0];
        assert!(red > 150, "red channel was {}", red);
    }

    #[cfg(not(any(feature = "fast-jpeg", feature = "std-jpeg")))]
    #[test]
    fn mjpeg_without_a_decoder_is_an_error() {
        let err = decode_frame(&[0xff, 0xd8], CaptureFormat::Mjpeg, 2, 2).unwrap_err();
        assert!(err.to_string().contains("fast-jpeg"));
    }

    #[test]
    fn rgb_payload_is_trimmed_to_frame() {
        let decoded = decode_frame(&[1u8; 14], CaptureFormat::Rgb24, 2, 2).unwrap();
        assert_eq!(decoded.rgb.len(), 12);
        assert!(decode_frame(&[1u8; 5], CaptureFormat::Rgb24, 2, 2).is_err());
    }
}
