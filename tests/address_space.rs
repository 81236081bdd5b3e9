mod common;

use common::*;
use goblin::elf::header::ET_EXEC;
use proc_symtab::{auxv, MapFlags, ObjSelector, ProcessSymbols};

/// An executable mapped r-x at 0x400000 with an rw data segment at 0x600000,
/// both named `a.out`, and no linker agent.
fn static_exec(dir: &std::path::Path, with_auxv: bool) -> ProcessSymbols<FakeTarget> {
    let image = ObjImage {
        etype: ET_EXEC,
        bias: 0x400000,
        dynsym: vec![func("main", 0x400100, 0x40)],
        data_seg: Some((0x600000, 0x800)),
        ..ObjImage::default()
    }
    .build();

    let mut target = FakeTarget::default();
    load_into(&mut target, 0x400000, image, "a.out", dir);
    target.add_mapping(
        0x600000,
        0x1000,
        0x1000,
        MapFlags::READ | MapFlags::WRITE,
        "a.out",
    );
    if with_auxv {
        target.set_auxv(&[(auxv::AT_PAGESZ, PAGE), (auxv::AT_ENTRY, 0x400100)]);
    }
    target.exe = Some("/bin/fake".to_string());

    let mut ps = ProcessSymbols::new(target);
    // One iteration bootstraps the static exec/ldso bindings.
    ps.mapping_iter(|_, _| true);
    ps
}

#[test]
fn static_maps_bind_the_executable() {
    let dir = tempfile::tempdir().unwrap();
    let mut ps = static_exec(dir.path(), true);

    let exec = ps.name_to_map(ObjSelector::Exec).unwrap();
    assert_eq!(exec.vaddr, 0x400000);

    // The data mapping is bound to the same object via its load segments.
    assert_eq!(ps.objname(0x600010).as_deref(), Some("/bin/fake"));
    assert_eq!(ps.objname(0x400010).as_deref(), Some("/bin/fake"));
}

#[test]
fn text_map_excludes_the_data_segment() {
    let dir = tempfile::tempdir().unwrap();
    let mut ps = static_exec(dir.path(), true);

    assert!(ps.addr_to_text_map(0x600500).is_none());
    let text = ps.addr_to_text_map(0x400100).unwrap();
    assert_eq!(text.vaddr, 0x400000);
}

#[test]
fn executable_found_without_aux_vector() {
    // No AT_ENTRY to lean on; the reserved a.out mapname and the access
    // flags identify the text mapping.
    let dir = tempfile::tempdir().unwrap();
    let mut ps = static_exec(dir.path(), false);

    let exec = ps.name_to_map(ObjSelector::Exec).unwrap();
    assert_eq!(exec.vaddr, 0x400000);
}

#[test]
fn addr_to_map_agrees_with_the_mapping_table() {
    let dir = tempfile::tempdir().unwrap();
    let mut ps = static_exec(dir.path(), true);

    assert_eq!(ps.addr_to_map(0x400000).unwrap().vaddr, 0x400000);
    assert_eq!(ps.addr_to_map(0x400fff).unwrap().vaddr, 0x400000);
    assert_eq!(ps.addr_to_map(0x600000).unwrap().vaddr, 0x600000);
    assert!(ps.addr_to_map(0x401000).is_none());
    assert!(ps.addr_to_map(0x3fffff).is_none());
    assert!(ps.addr_to_map(0).is_none());
}

fn objects_snapshot(ps: &mut ProcessSymbols<FakeTarget>) -> Vec<(u64, String)> {
    let mut out = Vec::new();
    ps.object_iter(|pmap, lname| {
        out.push((pmap.vaddr, lname.to_string()));
        true
    });
    out
}

#[test]
fn refresh_with_unchanged_maps_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mut ps = static_exec(dir.path(), true);

    let (_, before_info) = ps.xlookup_by_name(
        proc_symtab::PR_LMID_EVERY,
        ObjSelector::Every,
        "main",
    )
    .unwrap();
    let before_objects = objects_snapshot(&mut ps);

    for _ in 0..3 {
        ps.invalidate_maps();
        ps.update_maps();
    }

    let (_, after_info) = ps.xlookup_by_name(
        proc_symtab::PR_LMID_EVERY,
        ObjSelector::Every,
        "main",
    )
    .unwrap();
    assert_eq!(before_info, after_info);
    assert_eq!(before_objects, objects_snapshot(&mut ps));
}

#[test]
fn flag_only_changes_keep_the_binding() {
    let dir = tempfile::tempdir().unwrap();
    let mut ps = static_exec(dir.path(), true);
    assert!(ps.objname(0x600010).is_some());

    // The kernel may flip heap/stack marker flags without the mapping
    // having really changed.
    let idx = ps
        .target_mut()
        .maps
        .iter()
        .position(|m| m.vaddr == 0x600000)
        .unwrap();
    let flags = ps.target_mut().maps[idx].flags;
    ps.target_mut().maps[idx].flags = flags | MapFlags::BREAK;
    ps.invalidate_maps();
    ps.update_maps();

    assert_eq!(ps.objname(0x600010).as_deref(), Some("/bin/fake"));
}

#[test]
fn vanished_mappings_release_their_binding() {
    let dir = tempfile::tempdir().unwrap();
    let mut ps = static_exec(dir.path(), true);
    assert!(ps.objname(0x600010).is_some());

    ps.target_mut().maps.retain(|m| m.vaddr != 0x600000);
    ps.invalidate_maps();
    ps.update_maps();

    assert!(ps.addr_to_map(0x600010).is_none());
    // The text mapping still holds a reference, so the object survives.
    assert_eq!(ps.objname(0x400010).as_deref(), Some("/bin/fake"));

    ps.target_mut().maps.clear();
    ps.invalidate_maps();
    ps.update_maps();
    assert!(ps.objname(0x400010).is_none());
    assert!(ps.addr_to_map(0x400010).is_none());
}

#[test]
fn grown_mapping_is_treated_as_new() {
    let dir = tempfile::tempdir().unwrap();
    let mut ps = static_exec(dir.path(), true);
    assert!(ps.objname(0x600010).is_some());

    // Same base, larger size: not the same mapping any more.
    let idx = ps
        .target_mut()
        .maps
        .iter()
        .position(|m| m.vaddr == 0x600000)
        .unwrap();
    ps.target_mut().maps[idx].size = 0x2000;
    ps.invalidate_maps();
    ps.update_maps();

    let m = ps.addr_to_map(0x601500).unwrap();
    assert_eq!(m.vaddr, 0x600000);
    assert_eq!(m.size, 0x2000);
}
