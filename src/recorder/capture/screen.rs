use image::RgbaImage;
use xcap::Monitor;

use super::FrameSource;
use crate::recorder::errors::CaptureError;
use crate::recorder::types::Rect;

/// Captures from the physical display through xcap.
///
/// Monitors are enumerated on every grab so hot-plugging between frames is
/// picked up. The area is cropped out of the monitor containing its origin and
/// clamped to that monitor's bounds.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScreenSource;

impl ScreenSource {
    pub fn new() -> Self {
        Self
    }

    fn monitors() -> Result<Vec<Monitor>, CaptureError> {
        Monitor::all().map_err(|e| CaptureError::DeviceRead(e.to_string()))
    }
}

fn monitor_rect(monitor: &Monitor) -> Rect {
    Rect::new(monitor.x(), monitor.y(), monitor.width(), monitor.height())
}

/// Area relative to the monitor origin, clamped to the monitor size.
fn local_crop(monitor: Rect, area: Rect) -> Option<(u32, u32, u32, u32)> {
    let x = (area.x - monitor.x).max(0) as u32;
    let y = (area.y - monitor.y).max(0) as u32;
    if x >= monitor.width || y >= monitor.height {
        return None;
    }

    let width = area.width.min(monitor.width - x);
    let height = area.height.min(monitor.height - y);
    if width == 0 || height == 0 {
        return None;
    }
    Some((x, y, width, height))
}

/// `area` (logical, global) mapped onto a capture of `bounds` that came back
/// `shot_width`x`shot_height` pixels. Scaled monitors capture more pixels than
/// their logical size.
fn physical_crop(
    bounds: Rect,
    area: Rect,
    shot_width: u32,
    shot_height: u32,
) -> Option<(u32, u32, u32, u32)> {
    let (x, y, width, height) = local_crop(bounds, area)?;
    if shot_width == 0 || shot_height == 0 {
        return None;
    }

    let scale_x = shot_width as f64 / bounds.width as f64;
    let scale_y = shot_height as f64 / bounds.height as f64;
    let to_pixels = |v: u32, scale: f64| (v as f64 * scale).round() as u32;

    let px = to_pixels(x, scale_x).min(shot_width - 1);
    let py = to_pixels(y, scale_y).min(shot_height - 1);
    let pw = to_pixels(width, scale_x).clamp(1, shot_width - px);
    let ph = to_pixels(height, scale_y).clamp(1, shot_height - py);
    Some((px, py, pw, ph))
}

impl FrameSource for ScreenSource {
    fn screen_frame(&self) -> Result<Rect, CaptureError> {
        let monitors = Self::monitors()?;
        monitors
            .iter()
            .find(|m| m.is_primary())
            .or_else(|| monitors.first())
            .map(monitor_rect)
            .ok_or(CaptureError::MonitorNotFound(0, 0))
    }

    fn grab(&self, area: Rect) -> Result<RgbaImage, CaptureError> {
        let monitor = Self::monitors()?
            .into_iter()
            .find(|m| monitor_rect(m).contains_point(area.x, area.y))
            .ok_or(CaptureError::MonitorNotFound(area.x, area.y))?;
        let bounds = monitor_rect(&monitor);

        let shot = monitor
            .capture_image()
            .map_err(|e| CaptureError::DeviceRead(e.to_string()))?;
        let (shot_width, shot_height) = (shot.width(), shot.height());
        let full = RgbaImage::from_raw(shot_width, shot_height, shot.into_raw()).ok_or_else(|| {
            CaptureError::DeviceRead("monitor image has an unexpected buffer size".to_string())
        })?;

        let (x, y, width, height) = physical_crop(bounds, area, shot_width, shot_height)
            .ok_or(CaptureError::MonitorNotFound(area.x, area.y))?;

        if (x, y, width, height) == (0, 0, shot_width, shot_height) {
            return Ok(full);
        }
        Ok(image::imageops::crop_imm(&full, x, y, width, height).to_image())
    }
}
