//! Creation, access and relocation flag sets.

use bitflags::bitflags;

bitflags! {
    /// Buffer object creation and access flags.
    ///
    /// The low bits double as access modes for waits and references
    /// (`RD`, `WR`, `NOBLOCK`) and as relocation selectors (`LOW`, `HIGH`, `OR`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BoFlags: u32 {
        /// Place in video memory
        const VRAM = 0x0000_0001;
        /// Place in GART (system memory visible to the GPU)
        const GART = 0x0000_0002;
        /// Either aperture
        const APER = Self::VRAM.bits() | Self::GART.bits();
        /// Read access
        const RD = 0x0000_0004;
        /// Write access
        const WR = 0x0000_0008;
        /// Read and write access
        const RDWR = Self::RD.bits() | Self::WR.bits();
        /// Do not block on waits, report `WouldBlock` instead
        const NOBLOCK = 0x0000_0010;
        /// Relocate the low 32 bits of the address
        const LOW = 0x0000_0020;
        /// Relocate the high 32 bits of the address
        const HIGH = 0x0000_0040;
        /// OR in a domain-dependent value
        const OR = 0x0000_0080;
        /// CPU mapping must be coherent
        const COHERENT = 0x1000_0000;
        /// Disable snooping
        const NOSNOOP = 0x2000_0000;
        /// Physically contiguous
        const CONTIG = 0x4000_0000;
        /// Will be mapped by the CPU
        const MAP = 0x8000_0000;
    }
}

impl BoFlags {
    /// Placement bits only.
    pub fn placement(self) -> Domain {
        let mut domain = Domain::empty();
        if self.contains(BoFlags::VRAM) {
            domain |= Domain::VRAM;
        }
        if self.contains(BoFlags::GART) {
            domain |= Domain::GART;
        }
        domain
    }

    /// Access bits only.
    pub fn access(self) -> BoFlags {
        self & BoFlags::RDWR
    }

    /// Relocation selector bits, translated.
    pub fn reloc(self) -> RelocFlags {
        let mut flags = RelocFlags::empty();
        if self.contains(BoFlags::LOW) {
            flags |= RelocFlags::LOW;
        }
        if self.contains(BoFlags::HIGH) {
            flags |= RelocFlags::HIGH;
        }
        if self.contains(BoFlags::OR) {
            flags |= RelocFlags::OR;
        }
        flags
    }
}

bitflags! {
    /// Memory domains as seen by the kernel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Domain: u32 {
        /// CPU-only
        const CPU = 0x1;
        /// Video memory
        const VRAM = 0x2;
        /// GART
        const GART = 0x4;
        /// CPU-mappable
        const MAPPABLE = 0x8;
    }
}

bitflags! {
    /// Relocation selectors as seen by the kernel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RelocFlags: u32 {
        /// Low half of the address
        const LOW = 0x1;
        /// High half of the address
        const HIGH = 0x2;
        /// OR in `vor`/`tor`
        const OR = 0x4;
    }
}

/// Memory kind (tiling) hint passed through to the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MemoryKind(pub u8);

impl MemoryKind {
    /// Pitch-linear
    pub const PITCH: MemoryKind = MemoryKind(0x00);
    /// Generic 16-byte-by-2 tiled
    pub const GENERIC_16BX2: MemoryKind = MemoryKind(0xfe);

    /// Whether this is a linear layout.
    pub fn is_pitch(self) -> bool {
        self == Self::PITCH
    }
}

/// Per-object configuration supplied at creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoConfig {
    /// Memory kind hint
    pub kind: MemoryKind,
    /// Tile mode, opaque to the engine
    pub tile_mode: u32,
}

impl BoConfig {
    /// Configuration with a memory kind.
    pub fn with_kind(kind: MemoryKind) -> Self {
        Self { kind, tile_mode: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placement_bits() {
        assert_eq!(BoFlags::VRAM.placement(), Domain::VRAM);
        assert_eq!(BoFlags::APER.placement(), Domain::VRAM | Domain::GART);
        assert_eq!((BoFlags::RD | BoFlags::MAP).placement(), Domain::empty());
    }

    #[test]
    fn test_reloc_translation() {
        let flags = BoFlags::LOW | BoFlags::OR | BoFlags::RD;
        assert_eq!(flags.reloc(), RelocFlags::LOW | RelocFlags::OR);
        assert_eq!(flags.access(), BoFlags::RD);
    }

    #[test]
    fn test_kind() {
        assert!(MemoryKind::default().is_pitch());
        assert!(!MemoryKind::GENERIC_16BX2.is_pitch());
    }
}
