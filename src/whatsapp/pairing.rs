//! Pairing artifact presentation: terminal QR and a PNG on disk.

use super::transport::PairingArtifact;
use base64::Engine;
use std::path::{Path, PathBuf};

pub const PAIRING_IMAGE_FILE: &str = "pairing-qr.png";

/// Render a raw QR payload as terminal text.
pub fn render_terminal_qr(code: &str) -> Option<String> {
    let payload = code.trim();
    if payload.is_empty() {
        return None;
    }
    match qrcode::QrCode::new(payload.as_bytes()) {
        Ok(qr) => Some(
            qr.render::<qrcode::render::unicode::Dense1x2>()
                .quiet_zone(true)
                .build(),
        ),
        Err(e) => {
            tracing::warn!("WhatsApp: could not encode pairing QR: {}", e);
            None
        }
    }
}

/// Decode a `data:image/png;base64,...` (or bare base64) image.
pub fn decode_image(image: &str) -> Option<Vec<u8>> {
    let encoded = match image.split_once(',') {
        Some((header, data)) if header.starts_with("data:") => data,
        _ => image,
    };
    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()
}

/// Print and persist a freshly issued artifact. Returns the PNG path if written.
pub async fn present(artifact: &PairingArtifact, data_dir: &Path) -> Option<PathBuf> {
    tracing::info!("WhatsApp: pairing required, scan the QR code with your phone");

    if let Some(rendered) = artifact.code.as_deref().and_then(render_terminal_qr) {
        // Straight to stdout so it is scannable regardless of log format
        println!("\n{}\n", rendered);
    }

    let bytes = artifact.image.as_deref().and_then(decode_image)?;
    let path = data_dir.join(PAIRING_IMAGE_FILE);
    if let Err(e) = tokio::fs::create_dir_all(data_dir).await {
        tracing::warn!("WhatsApp: cannot create {}: {}", data_dir.display(), e);
        return None;
    }
    match tokio::fs::write(&path, bytes).await {
        Ok(()) => {
            tracing::info!("WhatsApp: pairing QR saved to {}", path.display());
            Some(path)
        }
        Err(e) => {
            tracing::warn!("WhatsApp: failed to save pairing QR: {}", e);
            None
        }
    }
}
