use qrcode::QrCode;
use qrcode::render::svg;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QrError {
    #[error("invalid link: {0}")]
    InvalidLink(String),
    #[error("encoding failed: {0}")]
    Encode(String),
}

/// SVG render of a shareable link, sized for a listing card.
pub fn render_svg(link: &str) -> Result<String, QrError> {
    let link = link.trim();
    if link.is_empty() {
        return Err(QrError::InvalidLink("empty link".into()));
    }
    if !link.starts_with("http://") && !link.starts_with("https://") {
        return Err(QrError::InvalidLink(format!("unsupported scheme in `{link}`")));
    }
    let code = QrCode::new(link).map_err(|err| QrError::Encode(err.to_string()))?;
    Ok(code
        .render::<svg::Color>()
        .min_dimensions(240, 240)
        .build())
}
