//! Direct `reis` (libei) backend for key injection.
//!
//! Connects to the compositor through `LIBEI_SOCKET` or the `RemoteDesktop`
//! XDG portal (`ashpd`), binds a keyboard device and keeps the keyboard's
//! xkb keymap up to date while keys are being sent.

use std::collections::HashMap;
use std::fs::File;
use std::os::fd::OwnedFd;
use std::os::unix::fs::FileExt;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant, SystemTime};

use reis::ei;
use reis::handshake::ei_handshake_blocking;
use reis::{Interface, PendingRequestResult};

use crate::keymap::{LayoutTable, LiveKeymap};
use crate::sequencer::{Injector, KeyAction};

/// Upper bound for a single poll while waiting for the device.
const DISCOVERY_POLL: Duration = Duration::from_millis(50);

/// Interfaces announced for one device.
#[derive(Default)]
struct DeviceData {
    interfaces: HashMap<String, reis::Object>,
    resumed: bool,
}

impl DeviceData {
    fn interface<T: reis::Interface>(&self) -> Option<T> {
        self.interfaces.get(T::NAME)?.clone().downcast()
    }
}

/// Keyboard injector backed by `reis` (direct libei protocol).
///
/// Only exists once the compositor has accepted the handshake, resumed a
/// keyboard device and sent its keymap.
pub struct EiInjector {
    context: ei::Context,
    device: ei::Device,
    keyboard: ei::Keyboard,
    layout: LiveKeymap,
    serial: u32,
    sequence: u32,
    emulating: bool,
    paused: bool,
    frame_pending: bool,
}

impl EiInjector {
    /// Connect to the compositor and wait until keys can be typed.
    ///
    /// `app_name` is announced to the EIS server during the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`InputError::NotReady`] if no keyboard with a keymap shows
    /// up within `timeout`, or [`InputError::Init`] if the portal session
    /// or the handshake fails.
    pub async fn connect(app_name: &str, timeout: Duration) -> Result<Self, InputError> {
        let deadline = Instant::now() + timeout;

        let (context, serial) = tokio::time::timeout(timeout, setup_ei_context(app_name))
            .await
            .map_err(|_| InputError::NotReady("timed out connecting to EIS".to_string()))??;

        tokio::task::spawn_blocking(move || discover_keyboard(context, serial, deadline))
            .await
            .map_err(|e| InputError::Init(format!("discovery task panicked: {e}")))?
    }

    /// Handle to the keymap of the bound keyboard.
    ///
    /// Updated whenever the compositor announces a new keymap or layout
    /// group while events are flushed.
    #[must_use]
    pub fn layout(&self) -> LiveKeymap {
        self.layout.clone()
    }

    /// Get the current timestamp in microseconds for frame events.
    #[allow(clippy::cast_possible_truncation)]
    fn timestamp_us() -> u64 {
        SystemTime::UNIX_EPOCH
            .elapsed()
            .map_or(0, |d| d.as_micros() as u64)
    }

    /// Ensure we are in emulating mode before sending events.
    fn ensure_emulating(&mut self) {
        if !self.emulating {
            self.device.start_emulating(self.serial, self.sequence);
            self.sequence += 1;
            self.emulating = true;
        }
    }

    /// Read and handle whatever the server sent since the last call.
    fn dispatch_pending(&mut self) -> Result<(), InputError> {
        let ready = rustix::event::poll(
            &mut [rustix::event::PollFd::new(
                &self.context,
                rustix::event::PollFlags::IN,
            )],
            0,
        )
        .map_err(|e| InputError::Channel(format!("poll error: {e}")))?;

        if ready > 0 {
            self.context
                .read()
                .map_err(|e| InputError::Channel(format!("read error: {e}")))?;
        }

        while let Some(result) = self.context.pending_event() {
            match result {
                PendingRequestResult::Request(event) => self.handle_event(event)?,
                PendingRequestResult::ParseError(e) => {
                    tracing::warn!("Parse error from EIS: {e:?}");
                }
                PendingRequestResult::InvalidObject(id) => {
                    tracing::warn!(id, "Invalid object from EIS");
                }
            }
        }
        Ok(())
    }

    fn handle_event(&mut self, event: ei::Event) -> Result<(), InputError> {
        match event {
            ei::Event::Connection(_connection, conn_event) => match conn_event {
                ei::connection::Event::Ping { ping } => ping.done(0),
                ei::connection::Event::Disconnected { .. } => {
                    return Err(InputError::Channel("EIS server disconnected".to_string()));
                }
                _ => {}
            },
            ei::Event::Device(device, dev_event) if device == self.device => match dev_event {
                ei::device::Event::Paused { serial } => {
                    tracing::warn!("Keyboard device paused by compositor");
                    self.serial = serial;
                    self.paused = true;
                    self.emulating = false;
                }
                ei::device::Event::Resumed { serial } => {
                    tracing::debug!("Keyboard device resumed");
                    self.serial = serial;
                    self.paused = false;
                }
                _ => {}
            },
            ei::Event::Keyboard(keyboard, kbd_event) if keyboard == self.keyboard => {
                match kbd_event {
                    ei::keyboard::Event::Keymap {
                        keymap_type,
                        size,
                        keymap,
                    } => match read_keymap(keymap_type, keymap, size) {
                        Ok(table) => {
                            tracing::info!("Keymap changed");
                            self.layout.replace(table);
                        }
                        Err(e) => tracing::warn!("Ignoring new keymap: {e}"),
                    },
                    ei::keyboard::Event::Modifiers { group, .. } => {
                        self.layout.set_group(group);
                    }
                    _ => {}
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl Injector for EiInjector {
    fn send(&mut self, action: KeyAction) -> Result<(), InputError> {
        if self.paused {
            return Err(InputError::Channel(
                "keyboard device is paused".to_string(),
            ));
        }
        self.ensure_emulating();
        let (code, state) = match action {
            KeyAction::Press(code) => (code, ei::keyboard::KeyState::Press),
            KeyAction::Release(code) => (code, ei::keyboard::KeyState::Released),
        };
        tracing::trace!(code, ?state, "Key event");
        self.keyboard.key(code, state);
        self.frame_pending = true;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), InputError> {
        if self.frame_pending {
            self.device.frame(self.serial, Self::timestamp_us());
            self.frame_pending = false;
        }
        self.context
            .flush()
            .map_err(|e| InputError::Channel(format!("flush error: {e}")))?;
        self.dispatch_pending()
    }
}

impl Drop for EiInjector {
    fn drop(&mut self) {
        if self.emulating {
            self.device.stop_emulating(self.serial);
            let _ = self.context.flush();
        }
    }
}

/// Establish an EIS connection and perform the libei handshake.
///
/// Returns the context and initial serial number.
async fn setup_ei_context(app_name: &str) -> Result<(ei::Context, u32), InputError> {
    use ashpd::desktop::remote_desktop::{DeviceType, RemoteDesktop};
    use ashpd::desktop::PersistMode;

    // Try LIBEI_SOCKET env var first (direct socket, no portal needed).
    if let Ok(Some(context)) = ei::Context::connect_to_env() {
        tracing::info!("Connected to ei via LIBEI_SOCKET");
        return handshake(context, app_name.to_string()).await;
    }

    tracing::info!("No LIBEI_SOCKET, using RemoteDesktop portal");

    let remote_desktop = RemoteDesktop::new()
        .await
        .map_err(|e| InputError::Init(format!("RemoteDesktop proxy: {e}")))?;

    let session = remote_desktop
        .create_session()
        .await
        .map_err(|e| InputError::Init(format!("create session: {e}")))?;

    remote_desktop
        .select_devices(
            &session,
            DeviceType::Keyboard.into(),
            None,
            PersistMode::DoNot,
        )
        .await
        .map_err(|e| InputError::Init(format!("select devices: {e}")))?;

    let _response = remote_desktop
        .start(&session, None)
        .await
        .map_err(|e| InputError::Init(format!("start session: {e}")))?
        .response()
        .map_err(|e| InputError::Init(format!("start response: {e}")))?;

    let fd = remote_desktop
        .connect_to_eis(&session)
        .await
        .map_err(|e| InputError::Init(format!("connect to EIS: {e}")))?;

    let stream = UnixStream::from(fd);
    let context = ei::Context::new(stream)
        .map_err(|e| InputError::Init(format!("ei context: {e}")))?;

    tracing::info!("Connected to ei via RemoteDesktop portal");
    handshake(context, app_name.to_string()).await
}

async fn handshake(context: ei::Context, name: String) -> Result<(ei::Context, u32), InputError> {
    let (context, resp) = tokio::task::spawn_blocking(move || {
        ei_handshake_blocking(&context, &name, ei::handshake::ContextType::Sender)
            .map(|resp| (context, resp))
    })
    .await
    .map_err(|e| InputError::Init(format!("handshake task panicked: {e}")))?
    .map_err(|e| InputError::Init(format!("handshake failed: {e}")))?;

    Ok((context, resp.serial))
}

/// Decode an `ei_keyboard.keymap` payload.
fn read_keymap(
    keymap_type: ei::keyboard::KeymapType,
    fd: OwnedFd,
    size: u32,
) -> Result<LayoutTable, InputError> {
    if !matches!(keymap_type, ei::keyboard::KeymapType::Xkb) {
        return Err(InputError::Keymap(format!(
            "unsupported keymap type {keymap_type:?}"
        )));
    }

    let mut buf = vec![0u8; size as usize];
    File::from(fd)
        .read_exact_at(&mut buf, 0)
        .map_err(|e| InputError::Keymap(format!("read keymap: {e}")))?;
    while buf.last() == Some(&0) {
        buf.pop();
    }
    let text = String::from_utf8(buf)
        .map_err(|e| InputError::Keymap(format!("keymap is not UTF-8: {e}")))?;

    LayoutTable::from_xkb_text(text)
}

/// Process events after the handshake until a keyboard device is resumed
/// and its keymap has arrived, or `deadline` passes.
#[allow(clippy::too_many_lines)]
fn discover_keyboard(
    context: ei::Context,
    mut serial: u32,
    deadline: Instant,
) -> Result<EiInjector, InputError> {
    let mut seats: HashMap<ei::Seat, HashMap<String, u64>> = HashMap::new();
    let mut devices: HashMap<ei::Device, DeviceData> = HashMap::new();
    let mut keymaps: HashMap<ei::Keyboard, LayoutTable> = HashMap::new();
    let mut groups: HashMap<ei::Keyboard, u32> = HashMap::new();

    loop {
        // The handshake may have buffered seat info already, so pending
        // events are drained even when the poll times out.
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            let reason = if devices.is_empty() {
                "no keyboard device offered by compositor"
            } else if keymaps.is_empty() {
                "no keymap received for keyboard"
            } else {
                "keyboard device was not resumed"
            };
            return Err(InputError::NotReady(reason.to_string()));
        }

        #[allow(clippy::cast_possible_truncation)]
        let timeout_ms = remaining.min(DISCOVERY_POLL).as_millis() as i32;
        let poll_result = rustix::event::poll(
            &mut [rustix::event::PollFd::new(
                &context,
                rustix::event::PollFlags::IN,
            )],
            timeout_ms,
        );

        match poll_result {
            Ok(0) => {}
            Ok(_) => {
                context
                    .read()
                    .map_err(|e| InputError::Init(format!("read error: {e}")))?;
            }
            Err(e) => {
                return Err(InputError::Init(format!("poll error: {e}")));
            }
        }

        while let Some(result) = context.pending_event() {
            let event = match result {
                PendingRequestResult::Request(event) => event,
                PendingRequestResult::ParseError(e) => {
                    tracing::warn!("Parse error during device discovery: {e:?}");
                    continue;
                }
                PendingRequestResult::InvalidObject(id) => {
                    tracing::warn!(id, "Invalid object during device discovery");
                    continue;
                }
            };

            match event {
                ei::Event::Connection(_connection, conn_event) => match conn_event {
                    ei::connection::Event::Seat { seat } => {
                        seats.insert(seat, HashMap::new());
                    }
                    ei::connection::Event::Ping { ping } => {
                        ping.done(0);
                    }
                    ei::connection::Event::Disconnected { .. } => {
                        return Err(InputError::Init(
                            "disconnected during discovery".to_string(),
                        ));
                    }
                    _ => {}
                },
                ei::Event::Seat(seat, seat_event) => match seat_event {
                    ei::seat::Event::Capability { mask, interface } => {
                        if let Some(caps) = seats.get_mut(&seat) {
                            caps.insert(interface, mask);
                        }
                    }
                    ei::seat::Event::Done => {
                        match seats.get(&seat).and_then(|caps| caps.get(ei::Keyboard::NAME)) {
                            Some(mask) => {
                                seat.bind(*mask);
                                let _ = context.flush();
                            }
                            None => tracing::debug!("Seat has no keyboard capability"),
                        }
                    }
                    ei::seat::Event::Device { device } => {
                        devices.insert(device, DeviceData::default());
                    }
                    _ => {}
                },
                ei::Event::Device(device, dev_event) => {
                    if let Some(data) = devices.get_mut(&device) {
                        match dev_event {
                            ei::device::Event::Interface { object } => {
                                data.interfaces
                                    .insert(object.interface().to_string(), object);
                            }
                            ei::device::Event::Resumed { serial: s } => {
                                serial = s;
                                data.resumed = true;
                            }
                            ei::device::Event::Paused { serial: s } => {
                                serial = s;
                                data.resumed = false;
                            }
                            _ => {}
                        }
                    }
                }
                ei::Event::Keyboard(keyboard, kbd_event) => match kbd_event {
                    ei::keyboard::Event::Keymap {
                        keymap_type,
                        size,
                        keymap,
                    } => match read_keymap(keymap_type, keymap, size) {
                        Ok(table) => {
                            tracing::debug!(size, "Received keymap");
                            keymaps.insert(keyboard, table);
                        }
                        Err(e) => tracing::warn!("Ignoring keymap: {e}"),
                    },
                    ei::keyboard::Event::Modifiers { group, .. } => {
                        groups.insert(keyboard, group);
                    }
                    _ => {}
                },
                _ => {}
            }
        }

        let _ = context.flush();

        let ready = devices.iter().find_map(|(device, data)| {
            let keyboard = data.interface::<ei::Keyboard>()?;
            (data.resumed && keymaps.contains_key(&keyboard)).then(|| (device.clone(), keyboard))
        });

        if let Some((device, keyboard)) = ready {
            let Some(table) = keymaps.remove(&keyboard) else {
                continue;
            };
            let layout = LiveKeymap::new(table);
            if let Some(&group) = groups.get(&keyboard) {
                layout.set_group(group);
            }
            tracing::info!(seats = seats.len(), "Keyboard ready");
            return Ok(EiInjector {
                context,
                device,
                keyboard,
                layout,
                serial,
                sequence: 0,
                emulating: false,
                paused: false,
                frame_pending: false,
            });
        }
    }
}

/// Errors from the input injection backend.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    /// Failed to initialize the reis/libei backend.
    #[error("failed to initialize input backend: {0}")]
    Init(String),

    /// The compositor did not provide a usable keyboard in time.
    #[error("input backend not ready: {0}")]
    NotReady(String),

    /// A keymap could not be decoded or compiled.
    #[error("invalid keymap: {0}")]
    Keymap(String),

    /// Sending events to the compositor failed.
    #[error("input channel failed: {0}")]
    Channel(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL_KEYMAP: &str = r#"xkb_keymap {
        xkb_keycodes { minimum = 8; maximum = 255; <AC01> = 38; };
        xkb_types { type "ONE_LEVEL" { modifiers = none; level_name[Level1] = "Any"; }; };
        xkb_compat { };
        xkb_symbols { key <AC01> { type = "ONE_LEVEL", [ a ] }; };
    };"#;

    fn keymap_fd(bytes: &[u8]) -> OwnedFd {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(bytes).unwrap();
        OwnedFd::from(file)
    }

    #[test]
    fn rejects_truncated_keymap() {
        let fd = keymap_fd(b"xkb");
        let err = read_keymap(ei::keyboard::KeymapType::Xkb, fd, 64).unwrap_err();
        assert!(matches!(err, InputError::Keymap(_)));
    }

    #[test]
    fn rejects_non_utf8_keymap() {
        let fd = keymap_fd(&[0xff, 0xfe, 0x00]);
        let err = read_keymap(ei::keyboard::KeymapType::Xkb, fd, 3).unwrap_err();
        assert!(err.to_string().contains("UTF-8"));
    }

    #[test]
    fn reads_padded_keymap() {
        let mut bytes = MINIMAL_KEYMAP.as_bytes().to_vec();
        bytes.extend_from_slice(&[0; 16]);
        let size = u32::try_from(bytes.len()).unwrap();
        let table = read_keymap(ei::keyboard::KeymapType::Xkb, keymap_fd(&bytes), size).unwrap();
        assert_eq!(table.num_groups(), 1);
    }

    #[test]
    fn rejects_garbage_keymap() {
        let fd = keymap_fd(b"not a keymap\0");
        let err = read_keymap(ei::keyboard::KeymapType::Xkb, fd, 13).unwrap_err();
        assert!(matches!(err, InputError::Keymap(_)));
    }
}
