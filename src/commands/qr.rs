//! QR payload inspection for homeserver-auth

use std::path::Path;

use anyhow::Context as _;
use base64::Engine as _;
use serde_json::json;

use crate::error::{HomeserverAuthError, Result};
use crate::qr_code::{QrCodeData, QrCodeMode};

/// Decode the QR login payload stored in `file`
///
/// # Errors
///
/// Returns error if the file cannot be read or the payload is invalid.
pub fn qr_decode(file: &Path, json: bool) -> Result<()> {
    let bytes = std::fs::read(file).map_err(HomeserverAuthError::from)?;
    let data = QrCodeData::from_bytes(&bytes)
        .with_context(|| format!("Invalid QR login payload in {}", file.display()))?;

    let mode = match data.mode() {
        QrCodeMode::Login => "login",
        QrCodeMode::Reciprocate { .. } => "reciprocate",
    };
    let public_key = base64::engine::general_purpose::STANDARD_NO_PAD.encode(data.public_key());

    if json {
        let value = json!({
            "mode": mode,
            "server_name": data.server_name(),
            "rendezvous_url": data.rendezvous_url().as_str(),
            "public_key": public_key,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("Mode:           {}", mode);
        println!("Server name:    {}", data.server_name().unwrap_or("-"));
        println!("Rendezvous URL: {}", data.rendezvous_url());
        println!("Public key:     {}", public_key);
    }
    Ok(())
}
