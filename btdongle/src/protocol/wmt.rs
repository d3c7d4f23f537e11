//! WMT vendor command frames and fixed HCI command tables.
//!
//! WMT is the vendor command class for chip lifecycle control (power,
//! reset, patch phases), distinct from standard host-controller commands.
//!
//! ## Frame Format
//!
//! Control-pipe WMT commands use the HCI vendor command form:
//!
//! ```text
//! +------+------+-----+-----+----+----------+----------+
//! | 0x6F | 0xFC | Len | Dir | Op | ParamLen |  Params  |
//! +------+------+-----+-----+----+----------+----------+
//! | 1    | 1    | 1   | 1   | 1  | 2 (LE)   | variable |
//! +------+------+-----+-----+----+----------+----------+
//! ```
//!
//! Patch chunks ride the bulk pipe with a 16-bit length instead:
//!
//! ```text
//! +------+------+---------+-----+-----+----------+-------+------+
//! | 0x6F | 0xFC | Len(LE) | Dir | Op  | ParamLen | Phase | Body |
//! +------+------+---------+-----+-----+----------+-------+------+
//! | 1    | 1    | 2       | 1   | 1   | 2 (LE)   | 1     | ...  |
//! +------+------+---------+-----+-----+----------+-------+------+
//! ```

use byteorder::{LittleEndian, WriteBytesExt};

/// Vendor opcode bytes common to every WMT frame.
pub const WMT_OPCODE: [u8; 2] = [0x6F, 0xFC];

/// WMT direction byte for host-to-controller frames.
pub const WMT_DIR_HOST: u8 = 0x01;

/// Reply prefix bytes of a WMT event.
pub const WMT_EVENT_CODE: u8 = 0xE4;

/// Size of the bulk patch chunk header (HCI vendor header + WMT header
/// + phase byte).
pub const PATCH_HEADER_SIZE: usize = 9;

/// Maximum patch chunk body carried by one bulk frame.
pub const MAX_CHUNK_BODY: usize = 2043;

/// WMT operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WmtOp {
    /// Patch download phase frame (0x01).
    PatchDownload = 0x01,
    /// Firmware assert / core dump trigger (0x02).
    Assert = 0x02,
    /// Patch payload checksum readback (0x04).
    ChecksumQuery = 0x04,
    /// Controller power control (0x06).
    PowerCtrl = 0x06,
    /// Chip reset, activates a freshly loaded patch (0x07).
    Reset = 0x07,
    /// Resident patch query (0x17).
    PatchQuery = 0x17,
}

/// Phase tag marking a firmware chunk as first, middle or last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PatchPhase {
    /// First of several chunks.
    First = 0x01,
    /// Neither first nor last.
    Middle = 0x02,
    /// The only or final chunk.
    Last = 0x03,
}

/// WMT command frame builder.
#[derive(Debug)]
pub struct WmtFrame {
    op: WmtOp,
    params: Vec<u8>,
}

impl WmtFrame {
    /// Create a new frame with the given operation.
    pub fn new(op: WmtOp) -> Self {
        Self {
            op,
            params: Vec::new(),
        }
    }

    /// Build a power-on frame.
    pub fn power_on() -> Self {
        let mut frame = Self::new(WmtOp::PowerCtrl);
        frame.params.extend_from_slice(&[0x00, 0x01]);
        frame
    }

    /// Build a power-off frame.
    pub fn power_off() -> Self {
        let mut frame = Self::new(WmtOp::PowerCtrl);
        frame.params.extend_from_slice(&[0x00, 0x00]);
        frame
    }

    /// Build a chip reset frame.
    pub fn reset() -> Self {
        let mut frame = Self::new(WmtOp::Reset);
        frame.params.push(0x04);
        frame
    }

    /// Build a checksum readback frame; the reply carries the 16-bit
    /// payload checksum after the status bytes.
    pub fn checksum_query() -> Self {
        let mut frame = Self::new(WmtOp::ChecksumQuery);
        frame.params.push(0x00);
        frame
    }

    /// Build a resident-patch query frame. The reply's status byte
    /// tells whether the resident patch is adequate.
    pub fn patch_query() -> Self {
        let mut frame = Self::new(WmtOp::PatchQuery);
        frame.params.push(0x01);
        frame
    }

    /// Build a firmware assert frame (forces a core dump).
    pub fn assert_firmware() -> Self {
        let mut frame = Self::new(WmtOp::Assert);
        frame.params.push(0x08);
        frame
    }

    /// Build the control-pipe command bytes.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    #[allow(clippy::cast_possible_truncation)]
    pub fn build(&self) -> Vec<u8> {
        // Len covers Dir + Op + ParamLen + Params; frames are tiny.
        let body_len = 4 + self.params.len();
        let mut buf = Vec::with_capacity(3 + body_len);

        buf.extend_from_slice(&WMT_OPCODE);
        buf.push(body_len as u8);
        buf.push(WMT_DIR_HOST);
        buf.push(self.op as u8);
        buf.write_u16::<LittleEndian>(self.params.len() as u16 + 1)
            .unwrap();
        buf.extend_from_slice(&self.params);

        buf
    }

    /// Expected success reply prefix for this operation.
    pub fn expected_reply(&self) -> Vec<u8> {
        match self.op {
            // Checksum readback carries two extra result bytes.
            WmtOp::ChecksumQuery => vec![WMT_EVENT_CODE, 0x07, 0x02, self.op as u8, 0x03, 0x00],
            _ => vec![WMT_EVENT_CODE, 0x05, 0x02, self.op as u8, 0x01, 0x00],
        }
    }

    /// Get the operation code.
    pub fn op(&self) -> WmtOp {
        self.op
    }
}

/// Build one bulk-pipe patch chunk frame: vendor header, WMT header,
/// phase tag, then up to [`MAX_CHUNK_BODY`] payload bytes.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
#[allow(clippy::cast_possible_truncation)]
pub fn build_patch_chunk(phase: PatchPhase, body: &[u8]) -> Vec<u8> {
    debug_assert!(body.len() <= MAX_CHUNK_BODY);

    let mut buf = Vec::with_capacity(PATCH_HEADER_SIZE + body.len());
    buf.extend_from_slice(&WMT_OPCODE);
    buf.write_u16::<LittleEndian>(body.len() as u16 + 5).unwrap();
    buf.push(WMT_DIR_HOST);
    buf.push(WmtOp::PatchDownload as u8);
    buf.write_u16::<LittleEndian>(body.len() as u16 + 1).unwrap();
    buf.push(phase as u8);
    buf.extend_from_slice(body);
    buf
}

/// Expected WMT reply confirming patch activation.
pub const PATCH_RESULT_EVENT: [u8; 7] = [0xE4, 0x05, 0x02, 0x01, 0x01, 0x00, 0x00];

/// Standard HCI reset command and its completion event.
pub const HCI_RESET_CMD: [u8; 3] = [0x03, 0x0C, 0x00];
/// Completion event for [`HCI_RESET_CMD`].
pub const HCI_RESET_EVENT: [u8; 6] = [0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00];

/// Read the controller's public address.
pub const READ_BDADDR_CMD: [u8; 3] = [0x09, 0x10, 0x00];
/// Completion prefix for [`READ_BDADDR_CMD`]; the six address bytes follow.
pub const READ_BDADDR_EVENT: [u8; 6] = [0x0E, 0x0A, 0x01, 0x09, 0x10, 0x00];

/// Vendor capability query; confirms the unify WoBLE command set.
pub const VENDOR_CAP_CMD: [u8; 3] = [0x53, 0xFD, 0x00];
/// Completion prefix for [`VENDOR_CAP_CMD`].
pub const VENDOR_CAP_EVENT: [u8; 6] = [0x0E, 0x12, 0x01, 0x53, 0xFD, 0x00];

/// Vendor TCI sleep parameters (controller low-power enable).
pub const TCI_SLEEP_CMD: [u8; 10] = [0x7A, 0xFC, 0x07, 0x05, 0x40, 0x06, 0x40, 0x06, 0x00, 0x00];
/// Completion event for [`TCI_SLEEP_CMD`].
pub const TCI_SLEEP_EVENT: [u8; 6] = [0x0E, 0x04, 0x01, 0x7A, 0xFC, 0x00];
