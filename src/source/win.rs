use std::path::Path;

use anyhow::{anyhow, Result};
use image::RgbImage;
use tracing::{debug, error};
use windows::{
    core::PWSTR,
    Win32::{
        Foundation::{CloseHandle, GetLastError, BOOL, HANDLE},
        System::{
            Diagnostics::Debug::{
                FormatMessageW, FORMAT_MESSAGE_FROM_SYSTEM, FORMAT_MESSAGE_IGNORE_INSERTS,
            },
            SystemServices::{LANG_ENGLISH, SUBLANG_ENGLISH_US},
            Threading::{
                OpenProcess, QueryFullProcessImageNameW, PROCESS_NAME_WIN32,
                PROCESS_QUERY_INFORMATION, PROCESS_VM_READ,
            },
        },
        UI::WindowsAndMessaging::{GetForegroundWindow, GetWindowThreadProcessId},
    },
};

use super::{ForegroundApp, ForegroundSource, FrameSource};

fn last_error_message() -> String {
    let err = unsafe { GetLastError() };
    let mut message_buffer = [0u16; 2048];
    let size = unsafe {
        FormatMessageW(
            FORMAT_MESSAGE_FROM_SYSTEM | FORMAT_MESSAGE_IGNORE_INSERTS,
            None,
            err.0,
            LANG_ENGLISH | (SUBLANG_ENGLISH_US << 10),
            PWSTR::from_raw(message_buffer.as_mut_ptr()),
            2048,
            None,
        )
    };
    String::from_utf16_lossy(&message_buffer[0..size as usize])
}

#[tracing::instrument]
pub fn get_foreground() -> Result<Option<ForegroundApp>> {
    let window = unsafe { GetForegroundWindow() };

    if window.is_invalid() {
        // Happens while the desktop switches, e.g. on the lock screen.
        return Ok(None);
    }

    let mut id = 0u32;
    unsafe { GetWindowThreadProcessId(window, Some(&mut id)) };
    if id == 0 {
        return Err(anyhow!(
            "Failed to get foreground process {}",
            last_error_message()
        ));
    }
    let process_handle = unsafe {
        OpenProcess(
            PROCESS_QUERY_INFORMATION | PROCESS_VM_READ,
            BOOL::from(false),
            id,
        )
    }
    .inspect_err(|e| error!("Failed to open process {e:?}"))?;

    let mut text: [u16; 4096] = [0; 4096];
    let executable = unsafe { get_process_path(process_handle, &mut text) };

    unsafe { CloseHandle(process_handle) }
        .inspect_err(|e| error!("Failed to close handle {e:?}"))?;

    let executable = executable?;
    let display_name = Path::new(&executable)
        .file_stem()
        .and_then(|v| v.to_str())
        .map(str::to_string);
    let app = ForegroundApp::new(executable);
    Ok(Some(match display_name {
        Some(name) => app.with_display_name(name),
        None => app,
    }))
}

unsafe fn get_process_path(process_handle: HANDLE, text: &mut [u16]) -> Result<String> {
    unsafe {
        let mut length = text.len() as u32;
        QueryFullProcessImageNameW(
            process_handle,
            PROCESS_NAME_WIN32,
            windows::core::PWSTR(text.as_mut_ptr()),
            &mut length,
        )?;
        Ok(String::from_utf16_lossy(&text[..length as usize]))
    }
}

pub struct WindowsSource {}

impl WindowsSource {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for WindowsSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ForegroundSource for WindowsSource {
    fn current_foreground_application(&mut self) -> Result<Option<ForegroundApp>> {
        get_foreground().inspect_err(|e| error!("Failed to get foreground application {e:?}"))
    }
}

impl FrameSource for WindowsSource {
    fn capture_frame(&mut self) -> Result<Option<RgbImage>> {
        debug!("Screen capture is not available on Windows");
        Ok(None)
    }
}
