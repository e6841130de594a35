//! Encode resolution and bitrate policies.

use anyhow::{bail, Result};
use tracing::info;

/// Long edge of the encode bounding box
pub const MAX_LONG_EDGE: u32 = 1920;
/// Short edge of the encode bounding box
pub const MAX_SHORT_EDGE: u32 = 1080;

/// Scale a native display resolution to fit the 1920×1080 box (1080×1920
/// when the display is taller than wide), preserving aspect ratio.
///
/// Both axes are divided by the larger of the two per-axis scale factors.
pub fn scale_to_fit(native_width: u32, native_height: u32) -> Result<(u32, u32)> {
    if native_width == 0 || native_height == 0 {
        bail!(
            "Display resolution must be non-zero, got {}x{}",
            native_width,
            native_height
        );
    }

    let (box_w, box_h) = if native_width > native_height {
        (MAX_LONG_EDGE, MAX_SHORT_EDGE)
    } else {
        (MAX_SHORT_EDGE, MAX_LONG_EDGE)
    };

    // scale_x >= scale_y  <=>  w / box_w >= h / box_h, compared in integers so
    // the bound axis lands exactly on the box edge.
    let (w, h) = (u64::from(native_width), u64::from(native_height));
    let (bw, bh) = (u64::from(box_w), u64::from(box_h));
    let (width, height) = if w * bh >= h * bw {
        (bw, h * bw / w)
    } else {
        (w * bh / h, bh)
    };

    let width = (width as u32).clamp(1, box_w);
    let height = (height as u32).clamp(1, box_h);

    info!(
        "Encode size: {}x{} -> {}x{}",
        native_width, native_height, width, height
    );

    Ok((width, height))
}

/// Target video bitrate in bits/second: `0.25 × frame_rate × width × height`
pub fn calc_bitrate(frame_rate: u32, width: u32, height: u32) -> u32 {
    let bitrate = (0.25 * frame_rate as f64 * width as f64 * height as f64) as u32;
    info!(
        "bitrate={:.2}[Mbps]",
        bitrate as f64 / 1024.0 / 1024.0
    );
    bitrate
}
