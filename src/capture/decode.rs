//! Pixel format conversion to packed BGR
//!
//! Decoders hand back planar or semi-planar YUV depending on the backend, cameras hand back
//! YUYV or MJPEG. Everything leaves this module as tightly packed BGR24.

use jpeg_decoder::{Decoder, PixelFormat as JpegPixelFormat};

/// One image plane and its row stride in bytes
#[derive(Debug, Clone, Copy)]
pub struct Plane<'a> {
    pub data: &'a [u8],
    pub stride: usize,
}

impl<'a> Plane<'a> {
    pub fn new(data: &'a [u8], stride: usize) -> Self {
        Self { data, stride }
    }
}

#[inline]
fn clamp(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// ITU-R BT.601 limited range, fixed point (x1024)
#[inline]
fn yuv_to_bgr(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = (y as i32 - 16).max(0) * 1192;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let r = (c + 1634 * e) >> 10;
    let g = (c - 833 * e - 400 * d) >> 10;
    let b = (c + 2066 * d) >> 10;
    [clamp(b), clamp(g), clamp(r)]
}

/// Planar 4:2:0 (I420 / YUV420P)
pub fn i420_to_bgr(y: Plane, u: Plane, v: Plane, width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let mut bgr = vec![0u8; w * h * 3];
    for row in 0..h {
        let y_row = &y.data[row * y.stride..];
        let u_row = &u.data[(row / 2) * u.stride..];
        let v_row = &v.data[(row / 2) * v.stride..];
        let out = &mut bgr[row * w * 3..(row + 1) * w * 3];
        for col in 0..w {
            let px = yuv_to_bgr(y_row[col], u_row[col / 2], v_row[col / 2]);
            out[col * 3..col * 3 + 3].copy_from_slice(&px);
        }
    }
    bgr
}

/// Semi-planar 4:2:0 with interleaved UV (NV12)
pub fn nv12_to_bgr(y: Plane, uv: Plane, width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let mut bgr = vec![0u8; w * h * 3];
    for row in 0..h {
        let y_row = &y.data[row * y.stride..];
        let uv_row = &uv.data[(row / 2) * uv.stride..];
        let out = &mut bgr[row * w * 3..(row + 1) * w * 3];
        for col in 0..w {
            let pair = (col / 2) * 2;
            let px = yuv_to_bgr(y_row[col], uv_row[pair], uv_row[pair + 1]);
            out[col * 3..col * 3 + 3].copy_from_slice(&px);
        }
    }
    bgr
}

/// Packed 4:2:2 YUYV as delivered by UVC cameras
pub fn yuyv_to_bgr(src: Plane, width: u32, height: u32) -> Vec<u8> {
    const RV: f32 = 1.403;
    const GU: f32 = -0.344;
    const GV: f32 = -0.714;
    const BU: f32 = 1.77;
    const BIAS: f32 = 127.5;

    let (w, h) = (width as usize, height as usize);
    let mut bgr = vec![0u8; w * h * 3];
    for row in 0..h {
        let line = &src.data[row * src.stride..];
        let out = &mut bgr[row * w * 3..(row + 1) * w * 3];
        for pair in 0..w / 2 {
            let y1 = line[pair * 4] as f32;
            let u = line[pair * 4 + 1] as f32 - BIAS;
            let y2 = line[pair * 4 + 2] as f32;
            let v = line[pair * 4 + 3] as f32 - BIAS;

            let (db, dg, dr) = (BU * u, GU * u + GV * v, RV * v);
            let o = pair * 6;
            out[o] = clamp((db + y1) as i32);
            out[o + 1] = clamp((dg + y1) as i32);
            out[o + 2] = clamp((dr + y1) as i32);
            out[o + 3] = clamp((db + y2) as i32);
            out[o + 4] = clamp((dg + y2) as i32);
            out[o + 5] = clamp((dr + y2) as i32);
        }
    }
    bgr
}

/// Packed 32-bit BGRx/BGRA, alpha dropped
pub fn bgrx_to_bgr(src: Plane, width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let mut bgr = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        let line = &src.data[row * src.stride..row * src.stride + w * 4];
        for px in line.chunks_exact(4) {
            bgr.extend_from_slice(&px[..3]);
        }
    }
    bgr
}

/// Packed BGR with row padding removed
pub fn bgr_packed(src: Plane, width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    if src.stride == w * 3 {
        return src.data[..w * h * 3].to_vec();
    }
    let mut bgr = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        bgr.extend_from_slice(&src.data[row * src.stride..row * src.stride + w * 3]);
    }
    bgr
}

/// Decode one MJPEG frame into BGR, returning `(pixels, width, height)`
pub fn mjpeg_to_bgr(data: &[u8]) -> Result<(Vec<u8>, u32, u32), jpeg_decoder::Error> {
    let mut decoder = Decoder::new(data);
    let pixels = decoder.decode()?;
    let info = decoder
        .info()
        .ok_or_else(|| jpeg_decoder::Error::Format("missing JPEG header".into()))?;
    let (w, h) = (info.width as u32, info.height as u32);

    let bgr = match info.pixel_format {
        JpegPixelFormat::RGB24 => {
            let mut out = pixels;
            for px in out.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            out
        }
        JpegPixelFormat::L8 => pixels.iter().flat_map(|&l| [l, l, l]).collect(),
        JpegPixelFormat::L16 => pixels
            .chunks_exact(2)
            .flat_map(|p| [p[0], p[0], p[0]])
            .collect(),
        JpegPixelFormat::CMYK32 => pixels
            .chunks_exact(4)
            .flat_map(|p| {
                let k = 255 - p[3] as u32;
                let c = |v: u8| ((255 - v as u32) * k / 255) as u8;
                [c(p[2]), c(p[1]), c(p[0])]
            })
            .collect(),
    };
    Ok((bgr, w, h))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grey_yuv_maps_to_grey_bgr() {
        let y = vec![126u8; 4 * 2];
        let u = vec![128u8; 2];
        let v = vec![128u8; 2];
        let bgr = i420_to_bgr(
            Plane::new(&y, 4),
            Plane::new(&u, 2),
            Plane::new(&v, 2),
            4,
            2,
        );
        assert_eq!(bgr.len(), 24);
        assert!(bgr.iter().all(|&c| (c as i32 - 128).abs() <= 2));
    }

    #[test]
    fn nv12_respects_stride() {
        // 2x2 image with 8-byte row padding
        let y = [235, 235, 0, 0, 0, 0, 0, 0, 235, 235, 0, 0, 0, 0, 0, 0];
        let uv = [128, 128, 0, 0, 0, 0, 0, 0];
        let bgr = nv12_to_bgr(Plane::new(&y, 8), Plane::new(&uv, 8), 2, 2);
        assert!(bgr.iter().all(|&c| c >= 250));
    }

    #[test]
    fn yuyv_neutral_chroma_keeps_luma() {
        let line = [100u8, 128, 200, 128];
        let bgr = yuyv_to_bgr(Plane::new(&line, 4), 2, 1);
        assert!(bgr[..3].iter().all(|&c| (c as i32 - 100).abs() <= 1));
        assert!(bgr[3..].iter().all(|&c| (c as i32 - 200).abs() <= 1));
    }

    #[test]
    fn bgrx_drops_padding_byte() {
        let src = [1, 2, 3, 255, 4, 5, 6, 255];
        assert_eq!(bgrx_to_bgr(Plane::new(&src, 8), 2, 1), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn bgr_packed_strips_row_padding() {
        let src = [1, 2, 3, 0, 4, 5, 6, 0];
        assert_eq!(bgr_packed(Plane::new(&src, 4), 1, 2), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn truncated_jpeg_is_an_error() {
        assert!(mjpeg_to_bgr(&[0xff, 0xd8, 0xff]).is_err());
    }
}
