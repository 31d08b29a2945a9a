//! API tests

use pod_api::error::{Error, FatalReason};
use pod_api::{
    Access, Entry, EntryType, FaultKind, Gfn, GfnRange, Mapping, Mfn, PageOrder, Resolution,
};

#[test]
fn test_gfn_alignment() {
    let gfn = Gfn::new(0x40123);
    assert_eq!(gfn.align_down(PageOrder::Order2M), Gfn::new(0x40000));
    assert_eq!(gfn.align_down(PageOrder::Order1G), Gfn::new(0x40000));
    assert_eq!(gfn.offset_in(PageOrder::Order2M), 0x123);
    assert!(Gfn::new(0x200).is_aligned(PageOrder::Order2M));
    assert!(!Gfn::new(0x201).is_aligned(PageOrder::Order2M));
    assert!(Gfn::new(0x201).is_aligned(PageOrder::Order4K));
    assert_eq!(Gfn::from_addr(Gfn::new(7).to_addr() + 100), Gfn::new(7));
}

#[test]
fn test_page_order() {
    assert_eq!(PageOrder::Order4K.pages(), 1);
    assert_eq!(PageOrder::Order2M.pages(), 512);
    assert_eq!(PageOrder::Order1G.pages(), 512 * 512);
    assert_eq!(PageOrder::Order1G.smaller(), Some(PageOrder::Order2M));
    assert_eq!(PageOrder::Order4K.smaller(), None);
    assert_eq!(PageOrder::from_u32(9), Some(PageOrder::Order2M));
    assert_eq!(PageOrder::from_u32(3), None);
}

#[test]
fn test_entry_types() {
    assert_eq!(Entry::INVALID.entry_type(), EntryType::Invalid);
    assert_eq!(Entry::default(), Entry::INVALID);

    let ram = Entry::ram(Mfn::new(10), Access::RW);
    assert_eq!(ram.entry_type(), EntryType::RamRW);
    assert_eq!(ram.mfn(), Some(Mfn::new(10)));
    assert_eq!(ram.resolution(), None);

    let zero = Entry::lazy(Resolution::Zero, Access::RWX);
    assert!(zero.is_lazy());
    assert_eq!(zero.mfn(), None);

    let shared = Entry::lazy(Resolution::SharedTemplate(Mfn::new(3)), Access::RWX);
    assert_eq!(shared.mfn(), Some(Mfn::new(3)));
    assert_eq!(shared.resolution(), Some(Resolution::SharedTemplate(Mfn::new(3))));

    let mmio = Entry::mmio(Mfn::new(0xfee00), Access::RW);
    assert_eq!(mmio.entry_type(), EntryType::MmioDirect);
}

#[test]
fn test_entry_offset() {
    let ram = Entry::ram(Mfn::new(0x1000), Access::RW);
    assert_eq!(ram.at_offset(5).mapping, Mapping::Ram(Mfn::new(0x1005)));

    let unresolved = Entry::lazy(Resolution::Unresolved, Access::RWX);
    assert_eq!(unresolved.at_offset(17), unresolved);

    let shared = Entry::lazy(Resolution::SharedTemplate(Mfn::new(8)), Access::READ);
    assert_eq!(
        shared.at_offset(2).resolution(),
        Some(Resolution::SharedTemplate(Mfn::new(10)))
    );
    assert_eq!(shared.at_offset(2).access, Access::READ);
}

#[test]
fn test_fault_kind_access() {
    assert!(FaultKind::Write.is_write());
    assert!(!FaultKind::Read.is_write());
    assert_eq!(FaultKind::Exec.required_access(), Access::EXEC);
    assert!(Access::RWX.contains(FaultKind::Write.required_access()));
    assert!(!Access::READ.contains(FaultKind::Write.required_access()));
}

#[test]
fn test_mfn_representable() {
    assert!(Mfn::MAX.is_representable());
    assert!(!Mfn::MAX.offset(1).is_representable());
}

#[test]
fn test_error_display() {
    let err = Error::OutOfRange(Gfn::new(0x10));
    assert_eq!(format!("{}", err), "Out of range: gfn 0x10");
    assert!(!err.is_fatal());

    let fatal: Error = FatalReason::OutOfMemory.into();
    assert!(fatal.is_fatal());
    assert_eq!(format!("{}", fatal), "Fatal: out of memory while populating");
}

#[test]
fn test_gfn_range() {
    let range = GfnRange::new(Gfn::new(10), 4);
    assert_eq!(range.end(), Gfn::new(14));
    assert_eq!(range.len(), 4);
    assert!(range.contains(Gfn::new(13)));
    assert!(!range.contains(Gfn::new(14)));
    assert_eq!(range.iter().last(), Some(Gfn::new(13)));
    assert!(GfnRange::new(Gfn::new(3), 0).is_empty());
}
