//! Translation entry types

use bitflags::bitflags;

use crate::core::types::Mfn;

bitflags! {
    /// Access rights granted to the guest by a translation entry
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u8 {
        /// Guest may read the frame
        const READ = 1 << 0;
        /// Guest may write the frame
        const WRITE = 1 << 1;
        /// Guest may execute from the frame
        const EXEC = 1 << 2;
        /// Read and write
        const RW = Self::READ.bits() | Self::WRITE.bits();
        /// Read, write and execute
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

/// Type of a translation entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    /// No mapping
    Invalid,
    /// Ordinary backed, writable page
    RamRW,
    /// Populate-on-demand, not yet materialized
    Lazy,
    /// Passthrough device memory, never subject to PoD
    MmioDirect,
}

/// What a lazy entry currently points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// Never resolved; a clone consults its template, others use zero
    Unresolved,
    /// Resolved to the shared zero frame
    Zero,
    /// Resolved to a read-only frame owned by the template
    SharedTemplate(Mfn),
}

/// Target of a translation entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mapping {
    /// No mapping
    Invalid,
    /// Private frame owned by this address space
    Ram(Mfn),
    /// Populate-on-demand entry
    Lazy(Resolution),
    /// Device memory frame, not owned by this address space
    Mmio(Mfn),
}

/// One frame-granular translation entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Entry {
    /// Mapping target
    pub mapping: Mapping,
    /// Access rights
    pub access: Access,
}

impl Entry {
    /// The entry every unmapped frame implicitly holds.
    pub const INVALID: Entry = Entry {
        mapping: Mapping::Invalid,
        access: Access::empty(),
    };

    /// Creates a backed RAM entry.
    pub const fn ram(mfn: Mfn, access: Access) -> Self {
        Self { mapping: Mapping::Ram(mfn), access }
    }

    /// Creates a populate-on-demand entry.
    pub const fn lazy(resolution: Resolution, access: Access) -> Self {
        Self { mapping: Mapping::Lazy(resolution), access }
    }

    /// Creates a passthrough device memory entry.
    pub const fn mmio(mfn: Mfn, access: Access) -> Self {
        Self { mapping: Mapping::Mmio(mfn), access }
    }

    /// Returns the entry type.
    pub const fn entry_type(&self) -> EntryType {
        match self.mapping {
            Mapping::Invalid => EntryType::Invalid,
            Mapping::Ram(_) => EntryType::RamRW,
            Mapping::Lazy(_) => EntryType::Lazy,
            Mapping::Mmio(_) => EntryType::MmioDirect,
        }
    }

    /// Returns the frame the entry references, if any.
    ///
    /// Lazy entries only reference a frame while template-shared; the zero
    /// frame is a resolution, not a frame number.
    pub const fn mfn(&self) -> Option<Mfn> {
        match self.mapping {
            Mapping::Ram(mfn) | Mapping::Mmio(mfn) => Some(mfn),
            Mapping::Lazy(Resolution::SharedTemplate(mfn)) => Some(mfn),
            _ => None,
        }
    }

    /// Returns the lazy resolution, if this is a lazy entry.
    pub const fn resolution(&self) -> Option<Resolution> {
        match self.mapping {
            Mapping::Lazy(resolution) => Some(resolution),
            _ => None,
        }
    }

    /// Returns true for populate-on-demand entries.
    pub const fn is_lazy(&self) -> bool {
        matches!(self.mapping, Mapping::Lazy(_))
    }

    /// Returns true for entries with no mapping.
    pub const fn is_invalid(&self) -> bool {
        matches!(self.mapping, Mapping::Invalid)
    }

    /// Returns the same entry with different access rights.
    pub const fn with_access(self, access: Access) -> Self {
        Self { mapping: self.mapping, access }
    }

    /// Entry for the frame `index` frames into a larger mapping.
    ///
    /// Frame-backed mappings of higher order cover contiguous machine
    /// frames, so the frame number advances with the index.
    pub const fn at_offset(self, index: u64) -> Self {
        let mapping = match self.mapping {
            Mapping::Ram(mfn) => Mapping::Ram(mfn.offset(index)),
            Mapping::Mmio(mfn) => Mapping::Mmio(mfn.offset(index)),
            Mapping::Lazy(Resolution::SharedTemplate(mfn)) => {
                Mapping::Lazy(Resolution::SharedTemplate(mfn.offset(index)))
            }
            other => other,
        };
        Self { mapping, access: self.access }
    }
}

impl Default for Entry {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Kind of guest access that raised a nested page fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Data read
    Read,
    /// Data write
    Write,
    /// Instruction fetch
    Exec,
    /// Request to confirm that a lazy page may stay backed by the zero frame
    ConfirmZero,
}

impl FaultKind {
    /// Returns true if the fault needs a writable private frame.
    pub const fn is_write(self) -> bool {
        matches!(self, FaultKind::Write)
    }

    /// Access right the fault requires.
    pub const fn required_access(self) -> Access {
        match self {
            FaultKind::Read | FaultKind::ConfirmZero => Access::READ,
            FaultKind::Write => Access::WRITE,
            FaultKind::Exec => Access::EXEC,
        }
    }
}
