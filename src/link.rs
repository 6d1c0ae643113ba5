// Profile links and their QR encoding

use eyre::{Context, Result};
use qrcode::QrCode;
use qrcode::render::{svg, unicode};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Minimum rendered size of the SVG code, in pixels
const SVG_MIN_SIZE: u32 = 150;

/// URL of the profile page for a UFI
pub fn profile_url(origin: &str, id: &str) -> String {
    format!("{}/farmer/{}", origin.trim_end_matches('/'), id)
}

/// Extract the UFI from a profile URL or path (`.../farmer/<UFI>`)
pub fn id_from_path(path: &str) -> Option<&str> {
    let rest = path.trim_end_matches('/');
    let (prefix, id) = rest.rsplit_once('/')?;
    if !prefix.ends_with("/farmer") && prefix != "farmer" {
        return None;
    }
    if id.is_empty() { None } else { Some(id) }
}

/// Scannable code for one profile link
pub struct ProfileCode {
    url: String,
    code: QrCode,
}

impl ProfileCode {
    pub fn new(origin: &str, id: &str) -> Result<Self> {
        let url = profile_url(origin, id);
        let code = QrCode::new(url.as_bytes()).context("Failed to encode profile link as QR code")?;
        debug!(url = %url, modules = code.width(), "Encoded profile link");
        Ok(Self { url, code })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Modules per side, quiet zone excluded
    pub fn width(&self) -> usize {
        self.code.width()
    }

    /// Half-block rendering for terminals with a dark background
    pub fn to_terminal(&self) -> String {
        self.code
            .render::<unicode::Dense1x2>()
            .dark_color(unicode::Dense1x2::Light)
            .light_color(unicode::Dense1x2::Dark)
            .build()
    }

    pub fn to_svg(&self) -> String {
        self.code
            .render::<svg::Color>()
            .min_dimensions(SVG_MIN_SIZE, SVG_MIN_SIZE)
            .dark_color(svg::Color("#000000"))
            .light_color(svg::Color("#ffffff"))
            .build()
    }

    pub fn write_svg(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_svg()).with_context(|| format!("Failed to write QR code to {}", path.display()))
    }
}
