//! Pull interface to the device being observed. The daemon only consumes two capabilities:
//! "which application is in the foreground" and "give me one frame of the screen".
//! [platform_sources] picks the implementation compiled in through the `x11` or `win` feature.

#[cfg(feature = "win")]
pub mod win;
#[cfg(feature = "x11")]
pub mod x11;

#[cfg(feature = "win")]
extern crate windows;

#[cfg(feature = "x11")]
extern crate xcb;

use std::sync::Arc;

use anyhow::Result;
use image::RgbImage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForegroundApp {
    /// Stable identifier of the application. On desktops this is the full executable path, for
    /// example /usr/lib/firefox/firefox
    pub application_id: Arc<str>,
    /// Human readable label. Absent when the platform can't resolve one.
    pub display_name: Option<Arc<str>>,
}

impl ForegroundApp {
    pub fn new(application_id: impl Into<Arc<str>>) -> Self {
        Self {
            application_id: application_id.into(),
            display_name: None,
        }
    }

    pub fn with_display_name(self, display_name: impl Into<Arc<str>>) -> Self {
        Self {
            display_name: Some(display_name.into()),
            ..self
        }
    }

    /// Label to show for the application, falling back to the raw identifier.
    pub fn label(&self) -> Arc<str> {
        self.display_name
            .clone()
            .unwrap_or_else(|| self.application_id.clone())
    }
}

/// Reports the application currently in the foreground. Best effort: `Ok(None)` means the
/// platform couldn't tell this time.
#[cfg_attr(test, mockall::automock)]
pub trait ForegroundSource {
    fn current_foreground_application(&mut self) -> Result<Option<ForegroundApp>>;
}

/// Captures a single frame of the screen. `Ok(None)` means capture is unavailable right now.
#[cfg_attr(test, mockall::automock)]
pub trait FrameSource {
    fn capture_frame(&mut self) -> Result<Option<RgbImage>>;
}

/// Creates the foreground and frame sources of the current platform. Each source gets its own
/// connection because the sampling and capture tasks poll them independently.
pub fn platform_sources() -> Result<(Box<dyn ForegroundSource>, Box<dyn FrameSource>)> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "win")] {
            use win::WindowsSource;
            Ok((Box::new(WindowsSource::new()), Box::new(WindowsSource::new())))
        }
        else if #[cfg(feature = "x11")] {
            use x11::X11Source;
            Ok((Box::new(X11Source::new()?), Box::new(X11Source::new()?)))
        }
        else {
            Err(anyhow::anyhow!(
                "No sample source was compiled in. Enable the `x11` or `win` feature"
            ))
        }
    }
}

/// Converts a 32 bits-per-pixel BGRX buffer (the usual X server ZPixmap layout) into RGB.
/// Returns `None` when the buffer is too short for the given dimensions.
pub fn bgrx_to_rgb(data: &[u8], width: u32, height: u32) -> Option<RgbImage> {
    let pixels = width as usize * height as usize;
    if data.len() < pixels * 4 {
        return None;
    }
    let mut rgb = Vec::with_capacity(pixels * 3);
    for pixel in data[..pixels * 4].chunks_exact(4) {
        rgb.extend_from_slice(&[pixel[2], pixel[1], pixel[0]]);
    }
    RgbImage::from_raw(width, height, rgb)
}

#[cfg(test)]
mod tests {
    use super::{bgrx_to_rgb, ForegroundApp};

    #[test]
    fn label_falls_back_to_identifier() {
        let app = ForegroundApp::new("com.example.mail");
        assert_eq!(&*app.label(), "com.example.mail");

        let app = app.with_display_name("Mail");
        assert_eq!(&*app.label(), "Mail");
    }

    #[test]
    fn bgrx_conversion_swaps_channels() {
        let data = [1, 2, 3, 0, 10, 20, 30, 0];
        let image = bgrx_to_rgb(&data, 2, 1).unwrap();
        assert_eq!(image.get_pixel(0, 0).0, [3, 2, 1]);
        assert_eq!(image.get_pixel(1, 0).0, [30, 20, 10]);
    }

    #[test]
    fn bgrx_conversion_rejects_short_buffers() {
        assert!(bgrx_to_rgb(&[0; 7], 2, 1).is_none());
    }
}
