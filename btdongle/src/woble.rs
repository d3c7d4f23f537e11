//! Wake-over-BLE power management.
//!
//! Entering standby programs the controller's advertising packet
//! content filters (APCF) so only the configured wake patterns reach
//! the host, then turns the radio off with scanning left alive.
//! Filter and radio command tables come from a text settings image;
//! built-in defaults are used when no settings are configured.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::chip::ChipFamily;
use crate::error::{Error, HardwareErrorCode, Result};
use crate::protocol::wmt::{
    WmtFrame, HCI_RESET_CMD, HCI_RESET_EVENT, READ_BDADDR_CMD, READ_BDADDR_EVENT, TCI_SLEEP_CMD,
    TCI_SLEEP_EVENT, VENDOR_CAP_CMD, VENDOR_CAP_EVENT,
};
use crate::protocol::{CommandDescriptor, ProtocolEngine};
use crate::session::PowerState;
use crate::supervisor::{FaultSupervisor, WakeLock};
use crate::transport::Transport;

/// Filter slots addressable through the settings image.
pub const SETTING_COUNT: usize = 10;

/// Bound for a standby completion event arriving after the status reply.
const COMP_EVENT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Radio-off command with scanning kept alive (unify command set).
const UNIFY_SUSPEND_CMD: [u8; 23] = [
    0xC9, 0xFC, 0x14, 0x01, 0x20, 0x02, 0x00, 0x01, 0x02, 0x01, 0x00, 0x05, 0x10, 0x01, 0x00,
    0x40, 0x06, 0x02, 0x40, 0x5A, 0x02, 0x41, 0x0F,
];

/// Radio-on command leaving standby (unify command set).
const LEAVE_SUSPEND_CMD: [u8; 8] = [0xC9, 0xFC, 0x05, 0x01, 0x21, 0x02, 0x00, 0x00];

/// Command status reply shared by both radio commands.
const WOBLE_STATUS_EVENT: [u8; 6] = [0x0F, 0x04, 0x00, 0x01, 0xC9, 0xFC];

/// Vendor completion event closing the radio-off sequence.
const SUSPEND_COMP_EVENT: [u8; 4] = [0xE6, 0x02, 0x08, 0x00];

/// Vendor completion event closing the radio-on sequence.
const RESUME_COMP_EVENT: [u8; 4] = [0xE6, 0x02, 0x08, 0x01];

/// Legacy one-shot suspend command; no reply is defined for it.
const LEGACY_SUSPEND_CMD: [u8; 16] = [
    0xC9, 0xFC, 0x0D, 0x01, 0x0E, 0x00, 0x05, 0x43, 0x52, 0x4B, 0x54, 0x4D, 0x20, 0x04, 0x32,
    0x00,
];

/// Completion prefix acknowledging each APCF command.
const APCF_COMPLETION: [u8; 6] = [0x0E, 0x07, 0x01, 0x57, 0xFD, 0x00];

/// APCF filtering parameter command paired with the default filter.
const APCF_FILTER_PARAM_CMD: [u8; 13] = [
    0x57, 0xFD, 0x0A, 0x01, 0x00, 0x5A, 0x20, 0x00, 0x20, 0x00, 0x01, 0x80, 0x00,
];

/// Clears filter index 01 when no resume blocks are configured.
const APCF_DELETE_CMD: [u8; 6] = [0x57, 0xFD, 0x03, 0x01, 0x01, 0x5A];

/// Default APCF manufacturer-data filter; the controller address is
/// copied in at [`DEFAULT_APCF_ADDR_OFFSET`] before sending.
const DEFAULT_APCF_CMD: [u8; 42] = [
    0x57, 0xFD, 0x27, 0x06, 0x00, 0x5A, 0x46, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x43, 0x52, 0x4B, 0x54, 0x4D, 0xFF, 0xFF, 0x00, 0xFF, 0xFF, 0xFF,
    0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

/// Address fill offset of the default manufacturer-data filter.
const DEFAULT_APCF_ADDR_OFFSET: usize = 9;

/// Which standby command set the controller speaks. Fixed when the
/// manager is built; never probed at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WobleMode {
    /// Unify command set: APCF programming plus radio off/on with
    /// status and completion events.
    Unify,
    /// Legacy single-command suspend, no events.
    Legacy,
}

impl WobleMode {
    /// Command set a chip family speaks. Decided once, at construction.
    pub fn for_chip(chip: ChipFamily) -> Self {
        if chip.supports_unify_woble() {
            Self::Unify
        } else {
            Self::Legacy
        }
    }
}

/// Command tables loaded from the text settings image.
///
/// A block line reads `APCF00: 0x57,0xFD,...`; absent blocks fall back
/// to the built-in defaults.
#[derive(Default)]
pub struct WobleSettings {
    apcf: Vec<Option<Vec<u8>>>,
    apcf_fill_mac: Vec<Option<Vec<u8>>>,
    apcf_fill_mac_location: Vec<Option<Vec<u8>>>,
    apcf_resume: Vec<Option<Vec<u8>>>,
    radio_off: Option<Vec<u8>>,
    radio_off_status_event: Option<Vec<u8>>,
    radio_off_comp_event: Option<Vec<u8>>,
    radio_on: Option<Vec<u8>>,
    radio_on_status_event: Option<Vec<u8>>,
    radio_on_comp_event: Option<Vec<u8>>,
}

impl WobleSettings {
    /// Load and parse a settings image through the firmware provider.
    pub fn load(provider: &dyn crate::firmware::FirmwareProvider, name: &str) -> Result<Self> {
        let raw = provider.load_image(name)?;
        let text = String::from_utf8(raw)
            .map_err(|_| Error::Config(format!("settings image {name} is not valid UTF-8")))?;
        Ok(Self::parse(&text))
    }

    /// Parse the text settings image. Unknown lines are ignored;
    /// malformed hex lists void the block.
    pub fn parse(text: &str) -> Self {
        let slot = |name: &str| -> Vec<Option<Vec<u8>>> {
            (0..SETTING_COUNT)
                .map(|i| find_block(text, name, i))
                .collect()
        };
        Self {
            apcf: slot("APCF"),
            apcf_fill_mac: slot("APCF_ADD_MAC"),
            apcf_fill_mac_location: slot("APCF_ADD_MAC_LOCATION"),
            apcf_resume: slot("APCF_RESUME"),
            radio_off: find_block(text, "RADIOOFF", 0),
            radio_off_status_event: find_block(text, "RADIOOFF_STATUS_EVENT", 0),
            radio_off_comp_event: find_block(text, "RADIOOFF_COMPLETE_EVENT", 0),
            radio_on: find_block(text, "RADIOON", 0),
            radio_on_status_event: find_block(text, "RADIOON_STATUS_EVENT", 0),
            radio_on_comp_event: find_block(text, "RADIOON_COMPLETE_EVENT", 0),
        }
    }

    fn has_apcf(&self) -> bool {
        self.apcf.iter().any(Option::is_some)
    }
}

/// Locate `NAME%02d:` in the image and parse its `0xXX` list.
fn find_block(text: &str, name: &str, index: usize) -> Option<Vec<u8>> {
    let label = format!("{name}{index:02}:");
    for line in text.lines() {
        let Some(rest) = line.trim_start().strip_prefix(&label) else {
            continue;
        };
        let mut bytes = Vec::new();
        for token in rest.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) else {
                warn!("malformed byte {token:?} in {label}");
                return None;
            };
            match u8::from_str_radix(hex, 16) {
                Ok(value) => bytes.push(value),
                Err(_) => {
                    warn!("malformed byte {token:?} in {label}");
                    return None;
                },
            }
        }
        if !bytes.is_empty() {
            debug!("settings block {label} {} bytes", bytes.len());
            return Some(bytes);
        }
    }
    None
}

/// Drives standby entry/exit and the power on/off sequences.
pub struct WobleManager<T: Transport> {
    engine: Arc<ProtocolEngine<T>>,
    settings: WobleSettings,
    mode: WobleMode,
    wake_lock: Arc<dyn WakeLock>,
    reset_pending: AtomicBool,
}

impl<T: Transport> WobleManager<T> {
    /// Create a manager for the given command set.
    pub fn new(
        engine: Arc<ProtocolEngine<T>>,
        settings: WobleSettings,
        mode: WobleMode,
        wake_lock: Arc<dyn WakeLock>,
    ) -> Self {
        Self {
            engine,
            settings,
            mode,
            wake_lock,
            reset_pending: AtomicBool::new(false),
        }
    }

    /// Whether a failed standby transition left a reset scheduled.
    pub fn reset_pending(&self) -> bool {
        self.reset_pending.load(Ordering::Acquire)
    }

    /// Clear the scheduled-reset flag once recovery ran.
    pub fn clear_reset_pending(&self) {
        self.reset_pending.store(false, Ordering::Release);
    }

    /// Resume-side recovery hook. A failed standby entry leaves a reset
    /// scheduled; the next resume runs it through the supervisor before
    /// traffic restarts, then lets the system sleep again.
    pub fn on_resume(&self, supervisor: &FaultSupervisor) -> Result<()> {
        if !self.reset_pending.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        warn!("running reset scheduled by failed standby entry");
        let result = supervisor.force_chip_reset(HardwareErrorCode::WobleFailure);
        self.wake_lock.release();
        result
    }

    /// Power the radio on and run the bring-up sequence. No-op when
    /// already on or in standby.
    pub fn power_on(&self) -> Result<()> {
        let session = self.engine.session();
        match session.wait_power_settled(Duration::from_millis(1000))? {
            PowerState::PowerOn | PowerState::Woble => return Ok(()),
            PowerState::Error => return Err(Error::NotReady),
            _ => {},
        }

        info!("powering radio on");
        session.set_power_state(PowerState::PoweringOn);
        if let Err(err) = self.engine.send_wmt(&WmtFrame::power_on(), 3) {
            session.set_power_state(PowerState::Error);
            session.latch_error(HardwareErrorCode::PowerOnFailure);
            return Err(err);
        }
        session.set_power_state(PowerState::PowerOn);

        if let Err(err) = self
            .engine
            .send_command(&CommandDescriptor::new(TCI_SLEEP_CMD, TCI_SLEEP_EVENT))
        {
            session.set_power_state(PowerState::Error);
            session.latch_error(HardwareErrorCode::SleepCommandFailure);
            return Err(err);
        }
        self.engine
            .send_command(&CommandDescriptor::new(HCI_RESET_CMD, HCI_RESET_EVENT))?;
        Ok(())
    }

    /// Power the radio off. No-op when already off.
    pub fn power_off(&self) -> Result<()> {
        let session = self.engine.session();
        if session.power_state() == PowerState::PowerOff {
            return Ok(());
        }

        info!("powering radio off");
        session.set_power_state(PowerState::PoweringOff);
        match self.engine.send_wmt(&WmtFrame::power_off(), 3) {
            Ok(_) => {
                session.set_power_state(PowerState::PowerOff);
                Ok(())
            },
            Err(err) => {
                session.set_power_state(PowerState::Error);
                session.latch_error(HardwareErrorCode::PowerOffFailure);
                Err(err)
            },
        }
    }

    /// Enter WoBLE standby. Idempotent: already in standby means no
    /// wire traffic. On failure the chip is flagged for reset and the
    /// wake lock is held so the system cannot sleep over a half-dead
    /// radio.
    pub fn enter_standby(&self) -> Result<()> {
        let session = self.engine.session();

        if session.power_state() == PowerState::Woble {
            debug!("already in standby");
            return Ok(());
        }

        if self.mode == WobleMode::Legacy {
            // One-shot, no reply defined. The stack must restart after
            // resume, which the sticky code tells it.
            self.engine
                .send_command(&CommandDescriptor::without_reply(LEGACY_SUSPEND_CMD.to_vec()))?;
            session.latch_error(HardwareErrorCode::LegacyWoble);
            session.set_power_state(PowerState::Woble);
            return Ok(());
        }

        let result = self.enter_standby_unify();
        match result {
            Ok(()) => {
                session.set_power_state(PowerState::Woble);
                info!("standby entered");
                Ok(())
            },
            Err(err) => {
                warn!("standby entry failed: {err}");
                session.set_power_state(PowerState::Error);
                self.wake_lock.acquire();
                self.reset_pending.store(true, Ordering::Release);
                Err(Error::WobleFailure(err.to_string()))
            },
        }
    }

    fn enter_standby_unify(&self) -> Result<()> {
        self.power_on()?;

        self.engine
            .send_command(&CommandDescriptor::new(VENDOR_CAP_CMD, VENDOR_CAP_EVENT))?;
        let bdaddr = self.read_bdaddr()?;
        self.program_filters(bdaddr)?;
        self.radio_off()
    }

    /// Read the controller address once; later entries reuse it.
    fn read_bdaddr(&self) -> Result<[u8; 6]> {
        let session = self.engine.session();
        if let Some(addr) = session.bdaddr() {
            return Ok(addr);
        }
        let reply = self
            .engine
            .send_command(&CommandDescriptor::new(READ_BDADDR_CMD, READ_BDADDR_EVENT))?;
        if reply.len() < 12 {
            return Err(Error::Transport(format!(
                "short BD_ADDR reply ({} bytes)",
                reply.len()
            )));
        }
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&reply[6..12]);
        info!(
            "local address {:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            addr[5], addr[4], addr[3], addr[2], addr[1], addr[0]
        );
        session.set_bdaddr(addr);
        Ok(addr)
    }

    /// Program the wake filters, copying the controller address into
    /// each filter at its configured fill offset.
    fn program_filters(&self, bdaddr: [u8; 6]) -> Result<()> {
        if self.settings.has_apcf() {
            for i in 0..SETTING_COUNT {
                let Some(filter) = &self.settings.apcf[i] else {
                    continue;
                };
                let mut cmd = filter.clone();

                let fill_wanted = self.settings.apcf_fill_mac[i]
                    .as_ref()
                    .is_some_and(|flag| flag.first() == Some(&0x01));
                let location = self.settings.apcf_fill_mac_location[i]
                    .as_ref()
                    .and_then(|loc| loc.first().copied());
                if fill_wanted {
                    if let Some(offset) = location {
                        let offset = offset as usize;
                        if offset + 6 <= cmd.len() {
                            cmd[offset..offset + 6].copy_from_slice(&bdaddr);
                            debug!("filter {i}: address filled at offset {offset}");
                        } else {
                            warn!("filter {i}: fill offset {offset} out of range");
                        }
                    }
                }

                self.engine
                    .send_command(&CommandDescriptor::new(cmd, APCF_COMPLETION))?;
            }
            Ok(())
        } else {
            debug!("no filters configured, using default manufacturer data");
            let mut cmd = DEFAULT_APCF_CMD.to_vec();
            cmd[DEFAULT_APCF_ADDR_OFFSET..DEFAULT_APCF_ADDR_OFFSET + 6].copy_from_slice(&bdaddr);
            self.engine
                .send_command(&CommandDescriptor::new(cmd, APCF_COMPLETION))?;
            self.engine.send_command(&CommandDescriptor::new(
                APCF_FILTER_PARAM_CMD,
                APCF_COMPLETION,
            ))?;
            Ok(())
        }
    }

    /// Radio off: status reply first, then the asynchronous completion
    /// event within its own bound.
    fn radio_off(&self) -> Result<()> {
        if let Some(cmd) = &self.settings.radio_off {
            let status = self
                .settings
                .radio_off_status_event
                .clone()
                .unwrap_or_else(|| WOBLE_STATUS_EVENT.to_vec());
            self.engine
                .send_command(&CommandDescriptor::new(cmd.clone(), status))?;
            if let Some(comp) = &self.settings.radio_off_comp_event {
                self.engine.wait_for_event(comp, COMP_EVENT_TIMEOUT)?;
            }
        } else {
            self.engine.send_command(&CommandDescriptor::new(
                UNIFY_SUSPEND_CMD.to_vec(),
                WOBLE_STATUS_EVENT,
            ))?;
            self.engine
                .wait_for_event(&SUSPEND_COMP_EVENT, COMP_EVENT_TIMEOUT)?;
        }
        Ok(())
    }

    /// Leave WoBLE standby. Idempotent: not being in standby means no
    /// wire traffic. Failure is surfaced for the supervisor to escalate
    /// into a chip reset.
    pub fn leave_standby(&self) -> Result<()> {
        let session = self.engine.session();

        if self.mode == WobleMode::Legacy {
            // No leave command exists; the sticky code already told the
            // stack to restart. Drop the standby marker so a later
            // suspend sends again.
            if session.power_state() == PowerState::Woble {
                session.set_power_state(PowerState::Unknown);
            }
            return Ok(());
        }
        match session.power_state() {
            PowerState::Woble => {},
            PowerState::Error => {
                return Err(Error::WobleFailure("chip in error state after standby".into()))
            },
            _ => {
                debug!("not in standby");
                return Ok(());
            },
        }

        let result = self.leave_standby_unify();
        match result {
            Ok(()) => {
                session.set_power_state(PowerState::PowerOn);
                self.wake_lock.release();
                info!("standby left");
                Ok(())
            },
            Err(err) => {
                warn!("standby exit failed: {err}");
                Err(Error::WobleFailure(err.to_string()))
            },
        }
    }

    fn leave_standby_unify(&self) -> Result<()> {
        if let Some(cmd) = &self.settings.radio_on {
            let status = self
                .settings
                .radio_on_status_event
                .clone()
                .unwrap_or_else(|| WOBLE_STATUS_EVENT.to_vec());
            self.engine
                .send_command(&CommandDescriptor::new(cmd.clone(), status))?;
            if let Some(comp) = &self.settings.radio_on_comp_event {
                self.engine.wait_for_event(comp, COMP_EVENT_TIMEOUT)?;
            }
        } else {
            self.engine.send_command(&CommandDescriptor::new(
                LEAVE_SUSPEND_CMD.to_vec(),
                WOBLE_STATUS_EVENT,
            ))?;
            self.engine
                .wait_for_event(&RESUME_COMP_EVENT, COMP_EVENT_TIMEOUT)?;
        }
        self.resume_filters()
    }

    /// Undo the wake filters: configured resume blocks, or clearing the
    /// default filter index.
    fn resume_filters(&self) -> Result<()> {
        let configured: Vec<&Vec<u8>> = self
            .settings
            .apcf_resume
            .iter()
            .flatten()
            .collect();
        if configured.is_empty() {
            self.engine.send_command(&CommandDescriptor::new(
                APCF_DELETE_CMD.to_vec(),
                APCF_COMPLETION,
            ))?;
        } else {
            for cmd in configured {
                self.engine
                    .send_command(&CommandDescriptor::new(cmd.clone(), APCF_COMPLETION))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::ResetLine;
    use crate::testutil::{engine_fixture, MockTransport};
    use std::sync::atomic::AtomicU32;

    struct NullWakeLock;

    impl WakeLock for NullWakeLock {
        fn acquire(&self) {}
        fn release(&self) {}
    }

    #[derive(Default)]
    struct PulseCountingResetLine {
        pulses: AtomicU32,
    }

    impl ResetLine for PulseCountingResetLine {
        fn assert(&self) -> Result<()> {
            self.pulses.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn release(&self) -> Result<()> {
            Ok(())
        }
    }

    fn manager(
        mode: WobleMode,
        settings: WobleSettings,
    ) -> (WobleManager<MockTransport>, Arc<MockTransport>) {
        let (engine, transport) = engine_fixture();
        let manager = WobleManager::new(Arc::new(engine), settings, mode, Arc::new(NullWakeLock));
        (manager, transport)
    }

    fn queue_vendor_cap(transport: &MockTransport) {
        let mut ev = VENDOR_CAP_EVENT.to_vec();
        ev.resize(20, 0x00);
        transport.queue_event(&ev);
    }

    fn queue_bdaddr(transport: &MockTransport, addr: [u8; 6]) {
        let mut ev = READ_BDADDR_EVENT.to_vec();
        ev.extend_from_slice(&addr);
        transport.queue_event(&ev);
    }

    fn queue_apcf_completion(transport: &MockTransport) {
        transport.queue_event(&[0x0E, 0x07, 0x01, 0x57, 0xFD, 0x00, 0x00, 0x00, 0x63]);
    }

    #[test]
    fn test_settings_parser_blocks() {
        let text = "\
APCF00: 0x57,0xFD,0x0A,0x01\n\
APCF_ADD_MAC00: 0x01\n\
APCF_ADD_MAC_LOCATION00: 0x02\n\
RADIOOFF00: 0xC9,0xFC,0x02,0x01,0x0B\n\
RADIOOFF_STATUS_EVENT00: 0x0F,0x04,0x00,0x01,0xC9,0xFC\n";
        let settings = WobleSettings::parse(text);
        assert_eq!(
            settings.apcf[0].as_deref(),
            Some(&[0x57, 0xFD, 0x0A, 0x01][..])
        );
        assert_eq!(settings.apcf_fill_mac[0].as_deref(), Some(&[0x01][..]));
        assert!(settings.apcf[1].is_none());
        assert_eq!(settings.radio_off.as_ref().unwrap().len(), 5);
        assert!(settings.radio_on.is_none());
    }

    #[test]
    fn test_settings_parser_rejects_malformed_bytes() {
        let settings = WobleSettings::parse("APCF00: 0x57,banana\n");
        assert!(settings.apcf[0].is_none());
    }

    #[test]
    fn test_enter_standby_idempotent() {
        let (manager, transport) = manager(WobleMode::Unify, WobleSettings::default());
        manager
            .engine
            .session()
            .set_power_state(PowerState::Woble);

        manager.enter_standby().unwrap();
        assert!(transport.control_writes().is_empty());
    }

    #[test]
    fn test_enter_standby_default_path_fills_address() {
        let (manager, transport) = manager(WobleMode::Unify, WobleSettings::default());
        manager
            .engine
            .session()
            .set_power_state(PowerState::PowerOn);
        let addr = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];

        queue_vendor_cap(&transport);
        queue_bdaddr(&transport, addr);
        queue_apcf_completion(&transport); // manufacturer data
        queue_apcf_completion(&transport); // filter parameter
        transport.queue_event(&WOBLE_STATUS_EVENT);
        transport.queue_event(&SUSPEND_COMP_EVENT);

        manager.enter_standby().unwrap();

        let writes = transport.control_writes();
        assert_eq!(writes[0], VENDOR_CAP_CMD.to_vec());
        assert_eq!(writes[1], READ_BDADDR_CMD.to_vec());
        // Default manufacturer-data filter with the address at offset 9.
        assert_eq!(&writes[2][..2], &[0x57, 0xFD]);
        assert_eq!(&writes[2][9..15], &addr);
        assert_eq!(writes[3], APCF_FILTER_PARAM_CMD.to_vec());
        assert_eq!(writes[4], UNIFY_SUSPEND_CMD.to_vec());
        assert_eq!(
            manager.engine.session().power_state(),
            PowerState::Woble
        );
    }

    #[test]
    fn test_enter_standby_configured_filter_fill_offset() {
        let text = "\
APCF00: 0x57,0xFD,0x10,0x06,0x00,0x5A,0x00,0x00,0x00,0x00,0x00,0x00,0x00,0x00,0x00,0x00,0x00,0x00,0x00\n\
APCF_ADD_MAC00: 0x01\n\
APCF_ADD_MAC_LOCATION00: 0x06\n";
        let (manager, transport) = manager(WobleMode::Unify, WobleSettings::parse(text));
        manager
            .engine
            .session()
            .set_power_state(PowerState::PowerOn);
        let addr = [0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6];

        queue_vendor_cap(&transport);
        queue_bdaddr(&transport, addr);
        queue_apcf_completion(&transport);
        transport.queue_event(&WOBLE_STATUS_EVENT);
        transport.queue_event(&SUSPEND_COMP_EVENT);

        manager.enter_standby().unwrap();

        let writes = transport.control_writes();
        // Address copied at the configured offset 6.
        assert_eq!(&writes[2][6..12], &addr);
    }

    #[test]
    fn test_enter_standby_failure_schedules_reset() {
        let (manager, transport) = manager(WobleMode::Unify, WobleSettings::default());
        manager
            .engine
            .session()
            .set_power_state(PowerState::PowerOn);

        queue_vendor_cap(&transport);
        queue_bdaddr(&transport, [0; 6]);
        // No APCF completion queued: programming times out.

        let err = manager.enter_standby().unwrap_err();
        assert!(matches!(err, Error::WobleFailure(_)));
        assert_eq!(
            manager.engine.session().power_state(),
            PowerState::Error
        );
        assert!(manager.reset_pending());
    }

    #[test]
    fn test_legacy_enter_latches_sticky_code() {
        let (manager, transport) = manager(WobleMode::Legacy, WobleSettings::default());
        manager.enter_standby().unwrap();

        assert_eq!(transport.control_writes(), vec![LEGACY_SUSPEND_CMD.to_vec()]);
        assert_eq!(
            manager.engine.session().take_error(),
            Some(HardwareErrorCode::LegacyWoble)
        );
        // Legacy leave sends nothing.
        manager.leave_standby().unwrap();
        assert_eq!(transport.control_writes().len(), 1);
    }

    #[test]
    fn test_legacy_enter_idempotent() {
        let (manager, transport) = manager(WobleMode::Legacy, WobleSettings::default());
        manager.enter_standby().unwrap();
        manager.enter_standby().unwrap();
        assert_eq!(transport.control_writes().len(), 1);

        // Leaving clears the standby marker; a fresh suspend sends again.
        manager.leave_standby().unwrap();
        manager.enter_standby().unwrap();
        assert_eq!(transport.control_writes().len(), 2);
    }

    #[test]
    fn test_failed_enter_reset_runs_on_resume() {
        let (manager, transport) = manager(WobleMode::Unify, WobleSettings::default());
        let session = Arc::clone(manager.engine.session());
        session.set_power_state(PowerState::PowerOn);

        queue_vendor_cap(&transport);
        queue_bdaddr(&transport, [0; 6]);
        // No APCF completion queued: programming times out.
        assert!(manager.enter_standby().is_err());
        assert!(manager.reset_pending());

        let reset = Arc::new(PulseCountingResetLine::default());
        let supervisor = FaultSupervisor::new(
            Arc::clone(&session),
            Arc::clone(&reset) as Arc<dyn ResetLine>,
            Arc::new(NullWakeLock),
        );
        manager.on_resume(&supervisor).unwrap();

        assert!(!manager.reset_pending());
        assert_eq!(reset.pulses.load(Ordering::SeqCst), 1);
        assert_eq!(session.take_error(), Some(HardwareErrorCode::WobleFailure));

        // A second resume has nothing scheduled.
        manager.on_resume(&supervisor).unwrap();
        assert_eq!(reset.pulses.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mode_follows_chip_capability() {
        assert_eq!(WobleMode::for_chip(ChipFamily::Unify7668), WobleMode::Unify);
        assert_eq!(WobleMode::for_chip(ChipFamily::Legacy7662), WobleMode::Legacy);
    }

    #[test]
    fn test_leave_standby_default_path() {
        let (manager, transport) = manager(WobleMode::Unify, WobleSettings::default());
        manager
            .engine
            .session()
            .set_power_state(PowerState::Woble);

        transport.queue_event(&WOBLE_STATUS_EVENT);
        transport.queue_event(&RESUME_COMP_EVENT);
        queue_apcf_completion(&transport); // delete filter index

        manager.leave_standby().unwrap();

        let writes = transport.control_writes();
        assert_eq!(writes[0], LEAVE_SUSPEND_CMD.to_vec());
        assert_eq!(writes[1], APCF_DELETE_CMD.to_vec());
        assert_eq!(
            manager.engine.session().power_state(),
            PowerState::PowerOn
        );
        // A second leave is a no-op.
        manager.leave_standby().unwrap();
        assert_eq!(transport.control_writes().len(), 2);
    }

    #[test]
    fn test_leave_standby_after_error_escalates() {
        let (manager, _transport) = manager(WobleMode::Unify, WobleSettings::default());
        manager
            .engine
            .session()
            .set_power_state(PowerState::Error);

        assert!(matches!(
            manager.leave_standby(),
            Err(Error::WobleFailure(_))
        ));
    }

    #[test]
    fn test_power_on_sequence() {
        let (manager, transport) = manager(WobleMode::Unify, WobleSettings::default());
        manager
            .engine
            .session()
            .set_power_state(PowerState::PowerOff);

        transport.queue_event(&[0xE4, 0x05, 0x02, 0x06, 0x01, 0x00, 0x00]);
        transport.queue_event(&[0x0E, 0x04, 0x01, 0x7A, 0xFC, 0x00]);
        transport.queue_event(&HCI_RESET_EVENT);

        manager.power_on().unwrap();

        let writes = transport.control_writes();
        assert_eq!(writes[0], WmtFrame::power_on().build());
        assert_eq!(writes[1], TCI_SLEEP_CMD.to_vec());
        assert_eq!(writes[2], HCI_RESET_CMD.to_vec());
        assert_eq!(
            manager.engine.session().power_state(),
            PowerState::PowerOn
        );
    }

    #[test]
    fn test_power_off_failure_latches_code() {
        let (manager, _transport) = manager(WobleMode::Unify, WobleSettings::default());
        manager
            .engine
            .session()
            .set_power_state(PowerState::PowerOn);

        // No WMT reply queued: the power-off times out.
        assert!(manager.power_off().is_err());
        assert_eq!(
            manager.engine.session().power_state(),
            PowerState::Error
        );
        assert_eq!(
            manager.engine.session().take_error(),
            Some(HardwareErrorCode::PowerOffFailure)
        );
    }
}
