//! Firmware patch image handling and the chunked patch loader.
//!
//! A patch image is a 30-byte header followed by the payload streamed to
//! the controller. Uploads go over the data pipe in phase-tagged chunks;
//! each chunk is acknowledged through a result readback before the next
//! one is sent, and a WMT reset activates the loaded patch.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};

use crate::chip::ChipFamily;
use crate::error::{Error, Result};
use crate::protocol::wmt::{
    self, build_patch_chunk, PatchPhase, WmtFrame, MAX_CHUNK_BODY, PATCH_RESULT_EVENT,
};
use crate::protocol::{CommandDescriptor, ProtocolEngine};
use crate::session::PowerState;
use crate::transport::Transport;

/// Bytes of header preceding the patch payload.
pub const PATCH_INFO_SIZE: usize = 30;

/// Bound for one chunk's bulk write and acknowledgement.
const CHUNK_ACK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Delay between chunk write and result readback, and again before the
/// next chunk.
const CHUNK_SETTLE: Duration = Duration::from_millis(1);

/// A parsed firmware patch image.
pub struct PatchImage {
    build: String,
    platform: String,
    hw_sw_version: String,
    payload: Vec<u8>,
}

impl PatchImage {
    /// Parse a raw image: 16-byte build string, 4-byte platform id,
    /// 4-byte hw/sw version, 4-byte patch version, then the payload.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() <= PATCH_INFO_SIZE {
            return Err(Error::InvalidPatch(format!(
                "image is {} bytes, need more than {PATCH_INFO_SIZE}",
                raw.len()
            )));
        }
        let text = |range: std::ops::Range<usize>| -> String {
            raw[range]
                .iter()
                .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
                .collect()
        };
        Ok(Self {
            build: text(0..16),
            platform: text(16..20),
            hw_sw_version: text(20..24),
            payload: raw[PATCH_INFO_SIZE..].to_vec(),
        })
    }

    /// Build/version string from the header.
    pub fn build_info(&self) -> &str {
        &self.build
    }

    /// Platform id string from the header.
    pub fn platform(&self) -> &str {
        &self.platform
    }

    /// Hardware/software version string from the header.
    pub fn hw_sw_version(&self) -> &str {
        &self.hw_sw_version
    }

    /// The payload streamed to the controller.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// One's-complement 16-bit checksum over the payload.
    pub fn checksum(&self) -> u16 {
        checksum16(&self.payload)
    }
}

/// Internet-style one's-complement sum of 16-bit little-endian words,
/// odd trailing byte added as-is.
pub fn checksum16(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_le_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    #[allow(clippy::cast_possible_truncation)]
    !(sum as u16)
}

/// Source of patch images, injected so tests and alternate firmware
/// stores do not touch the filesystem layout.
pub trait FirmwareProvider: Send + Sync {
    /// Load the raw bytes of the named image.
    fn load_image(&self, name: &str) -> Result<Vec<u8>>;
}

/// Loads images from a firmware directory.
pub struct FsFirmwareProvider {
    dir: PathBuf,
}

impl FsFirmwareProvider {
    /// Provider rooted at the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl FirmwareProvider for FsFirmwareProvider {
    fn load_image(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.dir.join(Path::new(name));
        debug!("loading patch image from {}", path.display());
        Ok(fs::read(path)?)
    }
}

/// Streams a patch image to the controller and activates it.
pub struct PatchLoader<T: Transport, P: FirmwareProvider> {
    engine: Arc<ProtocolEngine<T>>,
    provider: P,
    cache: Mutex<Option<(ChipFamily, Arc<PatchImage>)>>,
}

impl<T: Transport, P: FirmwareProvider> PatchLoader<T, P> {
    /// Create a loader over the shared engine.
    pub fn new(engine: Arc<ProtocolEngine<T>>, provider: P) -> Self {
        Self {
            engine,
            provider,
            cache: Mutex::new(None),
        }
    }

    /// Parsed image for the chip, reloaded only when the identity
    /// changes.
    pub fn image_for(&self, chip: ChipFamily) -> Result<Arc<PatchImage>> {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((cached_chip, image)) = cache.as_ref() {
            if *cached_chip == chip {
                return Ok(Arc::clone(image));
            }
        }
        let raw = self.provider.load_image(chip.patch_image_name())?;
        let image = Arc::new(PatchImage::parse(&raw)?);
        info!(
            "patch image for {chip}: build {}, platform {}, hw/sw {}",
            image.build_info(),
            image.platform(),
            image.hw_sw_version()
        );
        *cache = Some((chip, Arc::clone(&image)));
        Ok(image)
    }

    /// Ask the controller whether its resident patch is adequate.
    /// A missing or unknown reply means a load is needed.
    pub fn needs_patch(&self) -> bool {
        match self.engine.send_wmt(&WmtFrame::patch_query(), 0) {
            Ok(reply) => {
                let status = reply.get(6).copied();
                // 0x00 / 0x01 means the resident patch is usable.
                !matches!(status, Some(0x00 | 0x01))
            },
            Err(err) => {
                debug!("patch query failed ({err}), loading patch");
                true
            },
        }
    }

    /// Load and activate the patch for `chip`. Skips the upload when
    /// the resident patch is adequate; always leaves the chip reset so
    /// the active patch is live.
    pub fn load(&self, chip: ChipFamily) -> Result<()> {
        let image = self.image_for(chip)?;

        if !self.needs_patch() {
            info!("resident patch is current, skipping download");
            return Ok(());
        }

        info!("uploading {} byte patch payload", image.payload().len());
        self.upload(image.payload())?;

        if chip.verifies_patch_checksum() {
            self.verify_checksum(&image)?;
        }

        // Chip reset reactivates the ROM with the fresh patch.
        self.engine.send_wmt(&WmtFrame::reset(), 0)?;
        if chip.has_power_control() {
            self.engine.session().set_power_state(PowerState::PowerOff);
        }
        info!("patch activated");
        Ok(())
    }

    /// Post-activation bring-up: HCI reset, then enable controller
    /// low-power mode.
    pub fn post_activation(&self) -> Result<()> {
        self.engine
            .send_command(&CommandDescriptor::new(wmt::HCI_RESET_CMD, wmt::HCI_RESET_EVENT))?;
        match self
            .engine
            .send_command(&CommandDescriptor::new(wmt::TCI_SLEEP_CMD, wmt::TCI_SLEEP_EVENT))
        {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!("sleep enable rejected: {err}");
                Err(err)
            },
        }
    }

    fn upload(&self, payload: &[u8]) -> Result<()> {
        let transport = Arc::clone(self.engine.transport());
        let mut cursor = 0usize;
        let mut first_block = true;

        while cursor < payload.len() {
            let body_len = MAX_CHUNK_BODY.min(payload.len() - cursor);
            let remaining = payload.len() - cursor;

            // A full-length first chunk is always tagged First, even
            // when nothing follows; only a short first chunk is Last.
            let phase = if first_block {
                first_block = false;
                if body_len < MAX_CHUNK_BODY {
                    PatchPhase::Last
                } else {
                    PatchPhase::First
                }
            } else if body_len == MAX_CHUNK_BODY && remaining != MAX_CHUNK_BODY {
                PatchPhase::Middle
            } else {
                PatchPhase::Last
            };

            let chunk = build_patch_chunk(phase, &payload[cursor..cursor + body_len]);
            debug!(
                "chunk phase {phase:?}, {} bytes at offset {cursor}",
                body_len
            );

            transport
                .send_bulk(&chunk, CHUNK_ACK_TIMEOUT)
                .map_err(|err| Error::LoadTimeout(format!("chunk at offset {cursor}: {err}")))?;

            thread::sleep(CHUNK_SETTLE);
            self.read_chunk_result(cursor)?;
            thread::sleep(CHUNK_SETTLE);

            cursor += body_len;
        }
        Ok(())
    }

    /// Every chunk is confirmed through a control-pipe readback of the
    /// download result event.
    fn read_chunk_result(&self, offset: usize) -> Result<()> {
        let reply = self
            .engine
            .transport()
            .control_read(CHUNK_ACK_TIMEOUT)
            .map_err(|err| Error::LoadTimeout(format!("result after offset {offset}: {err}")))?;
        if reply.starts_with(&PATCH_RESULT_EVENT) {
            Ok(())
        } else {
            Err(Error::LoadTimeout(format!(
                "unexpected download result {:02x?} after offset {offset}",
                &reply[..reply.len().min(8)]
            )))
        }
    }

    /// Legacy families report a payload checksum after the upload; a
    /// mismatch means the stored patch is corrupt.
    fn verify_checksum(&self, image: &PatchImage) -> Result<()> {
        let expected = image.checksum();
        let reply = self.engine.send_wmt(&WmtFrame::checksum_query(), 0)?;
        if reply.len() < 8 {
            return Err(Error::InvalidPatch(format!(
                "short checksum reply: {:02x?}",
                reply
            )));
        }
        let actual = LittleEndian::read_u16(&reply[6..8]);
        if actual == expected {
            debug!("patch checksum {expected:#06x} verified");
            Ok(())
        } else {
            Err(Error::ChecksumMismatch { expected, actual })
        }
    }
}
