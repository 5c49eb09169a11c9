// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::io::Cursor;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::{ImageFormat, Luma};
use qrcode::render::unicode;
use qrcode::types::QrError;
use qrcode::QrCode;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("payload too large for a QR code ({0} bytes)")]
    TooLarge(usize),

    #[error("QR encoding failed: {0}")]
    Qr(String),

    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

type Result<T> = std::result::Result<T, EncodeError>;

/// PNG image of an encoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedVisual {
    png: Vec<u8>,
}

impl EncodedVisual {
    pub fn from_png(png: Vec<u8>) -> Self {
        Self { png }
    }

    pub fn png(&self) -> &[u8] {
        &self.png
    }

    pub fn into_png(self) -> Vec<u8> {
        self.png
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.png)
    }

    /// Suitable for an `<img src=...>` attribute.
    pub fn data_url(&self) -> String {
        format!("data:image/png;base64,{}", self.to_base64())
    }
}

pub trait Encoder {
    fn encode(&self, text: &str) -> Result<EncodedVisual>;
}

#[derive(Debug, Clone, Copy)]
pub struct QrPngEncoder {
    pub min_size: u32,
}

impl Default for QrPngEncoder {
    fn default() -> Self {
        Self { min_size: 250 }
    }
}

fn qr_code(text: &str) -> Result<QrCode> {
    QrCode::new(text.as_bytes()).map_err(|e| match e {
        QrError::DataTooLong => EncodeError::TooLarge(text.len()),
        other => EncodeError::Qr(other.to_string()),
    })
}

impl Encoder for QrPngEncoder {
    fn encode(&self, text: &str) -> Result<EncodedVisual> {
        let code = qr_code(text)?;
        let image = code
            .render::<Luma<u8>>()
            .quiet_zone(true)
            .min_dimensions(self.min_size, self.min_size)
            .build();

        let mut png = Cursor::new(Vec::new());
        image.write_to(&mut png, ImageFormat::Png)?;
        let png = png.into_inner();
        debug!(
            payload_len = text.len(),
            width = image.width(),
            png_len = png.len(),
            "encoded QR code"
        );
        Ok(EncodedVisual::from_png(png))
    }
}

/// Render the payload as a QR code made of unicode half blocks.
pub fn render_terminal(text: &str) -> Result<String> {
    let code = qr_code(text)?;
    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .quiet_zone(true)
        .build())
}
