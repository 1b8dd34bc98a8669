use std::path::Path;

use anyhow::{anyhow, Result};
use image::RgbImage;
use sysinfo::Pid;
use tracing::{instrument, warn};
use xcb::{
    x::{
        self, Atom, Drawable, GetProperty, GrabServer, InternAtom, Screen, UngrabServer, Window,
        ATOM_ANY,
    },
    Connection,
};

use super::{bgrx_to_rgb, ForegroundApp, ForegroundSource, FrameSource};

fn intern_atom(conn: &Connection, name: &[u8]) -> Result<Atom> {
    let reply = conn.wait_for_reply(conn.send_request(&InternAtom {
        only_if_exists: false,
        name,
    }))?;
    Ok(reply.atom())
}

fn get_pid(conn: &Connection, window: Window, pid_atom: Atom) -> Result<Option<u32>> {
    let result = conn.wait_for_reply(conn.send_request(&GetProperty {
        delete: false,
        window,
        property: pid_atom,
        r#type: ATOM_ANY,
        long_offset: 0,
        long_length: 1,
    }))?;
    Ok(result.value::<u32>().first().copied())
}

fn get_active_window(conn: &Connection, root: Window, active_window_atom: Atom) -> Result<Option<Window>> {
    let result = conn.wait_for_reply(conn.send_request(&GetProperty {
        delete: false,
        window: root,
        property: active_window_atom,
        r#type: ATOM_ANY,
        long_offset: 0,
        long_length: 1,
    }))?;
    Ok(result.value::<Window>().first().copied())
}

fn get_process_executable(id: u32) -> Option<String> {
    let system = sysinfo::System::new_all();
    let process = system.process(Pid::from_u32(id))?;
    process
        .exe()
        .and_then(|v| v.to_str())
        .map(|v| v.to_string())
}

/// X11 backed source. The foreground application is the executable owning
/// `_NET_ACTIVE_WINDOW`; frames are read straight from the root window.
pub struct X11Source {
    connection: Connection,
    preferred_screen: i32,
    active_window_atom: Atom,
    pid_atom: Atom,
}

impl X11Source {
    pub fn new() -> Result<Self> {
        let (connection, preferred_screen) = xcb::Connection::connect(None)?;
        let active_window_atom = intern_atom(&connection, b"_NET_ACTIVE_WINDOW")?;
        let pid_atom = intern_atom(&connection, b"_NET_WM_PID")?;
        Ok(Self {
            connection,
            preferred_screen,
            active_window_atom,
            pid_atom,
        })
    }

    // Only one X11 screen is observed.
    fn screen(&self) -> Result<&Screen> {
        self.connection
            .get_setup()
            .roots()
            .nth(self.preferred_screen.max(0) as usize)
            .ok_or_else(|| anyhow!("X server reported no screen {}", self.preferred_screen))
    }

    fn foreground_inner(&self) -> Result<Option<ForegroundApp>> {
        let root = self.screen()?.root();
        let Some(active_window) = get_active_window(&self.connection, root, self.active_window_atom)?
        else {
            return Ok(None);
        };
        let Some(pid) = get_pid(&self.connection, active_window, self.pid_atom)? else {
            return Ok(None);
        };
        let Some(executable) = get_process_executable(pid) else {
            return Ok(None);
        };
        let display_name = Path::new(&executable)
            .file_name()
            .and_then(|v| v.to_str())
            .map(str::to_string);

        let app = ForegroundApp::new(executable);
        Ok(Some(match display_name {
            Some(name) => app.with_display_name(name),
            None => app,
        }))
    }
}

impl ForegroundSource for X11Source {
    #[instrument(skip(self))]
    fn current_foreground_application(&mut self) -> Result<Option<ForegroundApp>> {
        let _ = self.connection.send_request(&GrabServer {});
        let result = self.foreground_inner();
        let _ = self.connection.send_request(&UngrabServer {});
        result
    }
}

impl FrameSource for X11Source {
    #[instrument(skip(self))]
    fn capture_frame(&mut self) -> Result<Option<RgbImage>> {
        let screen = self.screen()?;
        let (width, height) = (screen.width_in_pixels(), screen.height_in_pixels());
        let reply = self.connection.wait_for_reply(self.connection.send_request(&x::GetImage {
            format: x::ImageFormat::ZPixmap,
            drawable: Drawable::Window(screen.root()),
            x: 0,
            y: 0,
            width,
            height,
            plane_mask: u32::MAX,
        }))?;

        if !matches!(reply.depth(), 24 | 32) {
            warn!("Unsupported root window depth {}", reply.depth());
            return Ok(None);
        }

        Ok(bgrx_to_rgb(reply.data(), width as u32, height as u32))
    }
}
