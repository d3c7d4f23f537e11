//! Chip identity and per-family capabilities.

use std::fmt;

/// Supported controller families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChipFamily {
    /// Legacy family: patch checksum readback, radio on/off commands.
    Legacy7662,
    /// Legacy family, T revision.
    Legacy7662T,
    /// Unify family with WMT power control and unify WoBLE.
    #[default]
    Unify7668,
    /// Unify family sibling.
    Unify7663,
}

impl ChipFamily {
    /// Map a reported chip id to a family, if known.
    pub fn from_chip_id(chip_id: u32) -> Option<Self> {
        match chip_id & 0xFFFF {
            0x7662 => Some(Self::Legacy7662),
            0x7632 => Some(Self::Legacy7662T),
            0x7668 => Some(Self::Unify7668),
            0x7663 => Some(Self::Unify7663),
            _ => None,
        }
    }

    /// Whether the family speaks the unify WoBLE command set.
    pub fn supports_unify_woble(&self) -> bool {
        matches!(self, Self::Unify7668 | Self::Unify7663)
    }

    /// Whether the family has WMT power on/off control.
    pub fn has_power_control(&self) -> bool {
        matches!(self, Self::Unify7668 | Self::Unify7663)
    }

    /// Whether patch loading must verify the device-reported checksum.
    pub fn verifies_patch_checksum(&self) -> bool {
        matches!(self, Self::Legacy7662 | Self::Legacy7662T)
    }

    /// Default patch image name for this family.
    pub fn patch_image_name(&self) -> &'static str {
        match self {
            Self::Legacy7662 => "mt7662_patch_e3_hdr.bin",
            Self::Legacy7662T => "mt7662t_patch_e1_hdr.bin",
            Self::Unify7668 => "mt7668_patch_e2_hdr.bin",
            Self::Unify7663 => "mt7663_patch_e2_hdr.bin",
        }
    }
}

impl fmt::Display for ChipFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Legacy7662 => "7662",
            Self::Legacy7662T => "7662T",
            Self::Unify7668 => "7668",
            Self::Unify7663 => "7663",
        };
        write!(f, "{name}")
    }
}
