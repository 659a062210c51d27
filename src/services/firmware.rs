//! Firmware targets and image checks.

use crate::config::FirmwareTarget;
use crate::error::SessionError;
use crate::services::FirmwareImage;

/// Parse the decimal target index the engine reports and check it exists.
pub(crate) fn select_target<'a>(
    targets: &'a [FirmwareTarget],
    target: Option<&str>,
) -> Result<(u8, &'a FirmwareTarget), SessionError> {
    let index: u8 = target
        .and_then(|t| t.parse().ok())
        .ok_or(SessionError::InvalidFirmwareTarget)?;
    targets
        .get(usize::from(index))
        .map(|t| (index, t))
        .ok_or(SessionError::InvalidFirmwareTarget)
}

/// Digest of a received image, attached to the request handed to the handler.
pub fn inspect(target: u8, image: &[u8]) -> FirmwareImage {
    FirmwareImage {
        target,
        sha256: hmac_sha256::Hash::hash(image),
    }
}

/// `1.2.3.4`
pub fn format_version(version: [u8; 4]) -> String {
    format!("{}.{}.{}.{}", version[0], version[1], version[2], version[3])
}
