//! QR rendering: token payload → square greyscale bitmap.
//!
//! The symbol is rendered without the library's quiet zone, then padded
//! with exactly `border` white modules, so the configured border is what
//! ends up on the page. Module size is an integer number of pixels chosen
//! so the full bitmap is at least `size_px` wide.

use crate::config::{EcLevel, QrConfig};
use crate::error::RenderError;
use image::{DynamicImage, ImageBuffer, Luma};
use qrcode::QrCode;
use std::io::Cursor;
use tracing::debug;

/// Longest payload accepted, in bytes.
pub const MAX_QR_PAYLOAD: usize = 2000;

impl From<EcLevel> for qrcode::EcLevel {
    fn from(level: EcLevel) -> Self {
        match level {
            EcLevel::L => qrcode::EcLevel::L,
            EcLevel::M => qrcode::EcLevel::M,
            EcLevel::Q => qrcode::EcLevel::Q,
            EcLevel::H => qrcode::EcLevel::H,
        }
    }
}

/// Render `payload` as a QR bitmap.
pub fn render_qr(payload: &str, config: &QrConfig) -> Result<DynamicImage, RenderError> {
    if payload.len() > MAX_QR_PAYLOAD {
        return Err(RenderError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_QR_PAYLOAD,
        });
    }

    let code = QrCode::with_error_correction_level(payload.as_bytes(), config.ec_level.into())
        .map_err(|e| RenderError::Qr(e.to_string()))?;

    let total_modules = code.width() as u32 + 2 * config.border;
    let module_px = config.size_px.div_ceil(total_modules).max(1);

    let symbol = code
        .render::<Luma<u8>>()
        .quiet_zone(false)
        .module_dimensions(module_px, module_px)
        .build();

    let side = total_modules * module_px;
    let mut canvas = ImageBuffer::from_pixel(side, side, Luma([255u8]));
    let offset = i64::from(config.border * module_px);
    image::imageops::overlay(&mut canvas, &symbol, offset, offset);

    debug!(
        "QR: {} bytes → {} modules, {}px/module, {}x{} px",
        payload.len(),
        code.width(),
        module_px,
        side,
        side
    );
    Ok(DynamicImage::ImageLuma8(canvas))
}

/// PNG bytes of a rendered QR, for previews.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, RenderError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| RenderError::Qr(format!("PNG encoding failed: {e}")))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = r#"{"student_id":123,"course_id":45,"completion_date":"2025-01-15","verification_code":"v1.0707070707070707.00112233445566778899aabbccddeeff","timestamp":1736946000,"institution":"Example University"}"#;

    #[test]
    fn bitmap_is_square_and_at_least_requested_size() {
        let img = render_qr(PAYLOAD, &QrConfig::default()).unwrap();
        assert_eq!(img.width(), img.height());
        assert!(img.width() >= 200);
    }

    #[test]
    fn border_is_white_and_symbol_starts_after_it() {
        let config = QrConfig {
            size_px: 64,
            border: 4,
            ec_level: EcLevel::L,
        };
        let img = render_qr("hello", &config).unwrap().to_luma8();
        // Version 1 is 21 modules; 29 with the border, so 3 px per module.
        let module = img.width() / 29;
        assert_eq!(img.get_pixel(0, 0).0[0], 255);
        assert_eq!(img.get_pixel(4 * module - 1, 4 * module - 1).0[0], 255);
        // Top-left finder pattern is dark.
        assert_eq!(img.get_pixel(4 * module, 4 * module).0[0], 0);
    }

    #[test]
    fn zero_border_starts_with_finder_pattern() {
        let config = QrConfig {
            size_px: 64,
            border: 0,
            ec_level: EcLevel::M,
        };
        let img = render_qr("hello", &config).unwrap().to_luma8();
        assert_eq!(img.get_pixel(0, 0).0[0], 0);
    }

    #[test]
    fn higher_ec_needs_more_modules() {
        // One pixel per module, so width counts modules.
        let small = |ec| {
            render_qr(
                PAYLOAD,
                &QrConfig {
                    size_px: 1,
                    border: 0,
                    ec_level: ec,
                },
            )
            .unwrap()
            .width()
        };
        assert!(small(EcLevel::H) > small(EcLevel::L));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let big = "x".repeat(MAX_QR_PAYLOAD + 1);
        assert_eq!(
            render_qr(&big, &QrConfig::default()).unwrap_err(),
            RenderError::PayloadTooLarge {
                len: MAX_QR_PAYLOAD + 1,
                max: MAX_QR_PAYLOAD
            }
        );
    }

    #[test]
    fn rendered_token_scans_back_to_the_same_token() {
        use crate::directory::{CompletionFact, DirectoryRecord};
        use crate::pipeline::token::{Issuer, VerificationToken};

        let record = DirectoryRecord {
            id: 123,
            username: "jsilva".into(),
            firstname: "João".into(),
            lastname: "Silva".into(),
            fullname: "João Silva".into(),
            email: String::new(),
            suspended: false,
            courses: vec![],
        };
        let fact = CompletionFact {
            identity_id: 123,
            course_id: 45,
            course_name: "Engenharia Civil".into(),
            course_shortname: "ENG".into(),
            completed: true,
            time_completed: Some(1736942400),
            grade: None,
        };
        let token = Issuer::new("Example University", b"0123456789abcdef0123".to_vec())
            .issue_at(&record, &fact, 1736942400, [9; 8])
            .unwrap();
        let payload = token.to_qr_payload().unwrap();

        let gray = render_qr(&payload, &QrConfig::default()).unwrap().to_luma8();
        let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(
            gray.width() as usize,
            gray.height() as usize,
            |x, y| gray.get_pixel(x as u32, y as u32).0[0],
        );
        let grids = prepared.detect_grids();
        assert_eq!(grids.len(), 1);
        let (_, decoded) = grids[0].decode().unwrap();

        assert!(decoded.starts_with(r#"{"student_id":123,"course_id":45,"#), "{decoded}");
        assert_eq!(VerificationToken::from_qr_payload(&decoded).unwrap(), token);
    }

    #[test]
    fn png_has_magic() {
        let img = render_qr("hello", &QrConfig::default()).unwrap();
        let png = encode_png(&img).unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }
}
