//! 集合加载、覆盖链与冲突的集成测试
//!
//! 三个插件的标准场景：
//! - A.esm 定义 GLOB 0x800 = 1.0，关键字 0x801，钥匙 0x802
//! - B.esp（主文件 A）把 0x800 改为 2.0，新建 GLOB 0x900
//! - C.esp（主文件 A、B）原样复制 B 的 0x800

mod common;

use common::*;
use esp_collection::{
    CallbackDiagnostics, Collection, EspDebugger, EspError, FieldPath, FieldValue, FormRef, GlobalId, LocalRef, ModFlags,
    PluginId, ProgressCallback, RecordType, ReferenceScope, Scalar,
};
use std::sync::{Arc, Mutex};

const GOLD: GlobalId = GlobalId(0x0000_0800);

fn plugin_a() -> Vec<u8> {
    PluginBuilder::new()
        .esm()
        .author("tester")
        .glob(0x0000_0800, "Gold", 1.0)
        .keyword(0x0000_0801, "KwA")
        .key(0x0000_0802, "KeyA", &[0x0000_0801], None)
        .build()
}

fn plugin_b() -> Vec<u8> {
    PluginBuilder::new()
        .master("A.esm")
        .glob(0x0000_0800, "Gold", 2.0)
        .glob(0x0100_0900, "BNew", 3.0)
        .keyword(0x0100_0901, "KwB")
        .key(0x0000_0802, "KeyA", &[0x0000_0801], None)
        .build()
}

fn plugin_c() -> Vec<u8> {
    PluginBuilder::new()
        .master("A.esm")
        .master("B.esp")
        .glob(0x0000_0800, "Gold", 2.0)
        .build()
}

/// 加载 A、B、C；B 可编辑
fn scenario() -> (Collection, [PluginId; 3]) {
    let (mut collection, _io) =
        memory_collection(&[("A.esm", plugin_a()), ("B.esp", plugin_b()), ("C.esp", plugin_c())]);
    let a = collection.add_plugin("A.esm", ModFlags::empty()).unwrap();
    let b = collection.add_plugin("B.esp", ModFlags::SAVEABLE).unwrap();
    let c = collection.add_plugin("C.esp", ModFlags::empty()).unwrap();
    collection.load(None).unwrap();
    (collection, [a, b, c])
}

fn plugin_names(collection: &Collection, records: &[esp_collection::RecordId]) -> Vec<String> {
    records
        .iter()
        .map(|&rid| {
            let plugin = collection.record(rid).unwrap().plugin;
            collection.plugin(plugin).unwrap().name.clone()
        })
        .collect()
}

#[test]
fn test_plugins_load_in_order() {
    let (collection, [a, b, c]) = scenario();
    assert_eq!(collection.load_order(), &[a, b, c]);
    assert_eq!(collection.loaded_plugins(), vec![a, b, c]);

    let header = collection.plugin(a).unwrap();
    assert!(header.is_master());
    assert_eq!(header.author(), Some("tester"));
    assert_eq!(collection.plugin(c).unwrap().masters, vec!["A.esm", "B.esp"]);
    assert_eq!(collection.plugin_by_name("b.ESP"), Some(b));
}

#[test]
fn test_override_winner_and_history() {
    let (collection, _) = scenario();

    let history = collection.history(GOLD).unwrap();
    assert_eq!(plugin_names(&collection, &history), vec!["A.esm", "B.esp", "C.esp"]);
    let values: Vec<f32> = history.iter().map(|&rid| glob_value(&collection, rid)).collect();
    assert_eq!(values, vec![1.0, 2.0, 2.0]);

    let winner = collection.winner(GOLD).unwrap().unwrap();
    assert_eq!(winner, history[2]);
    assert_eq!(glob_value(&collection, winner), 2.0);
}

#[test]
fn test_identical_copy_is_not_a_conflict() {
    let (collection, [_, b, c]) = scenario();
    let history = collection.history(GOLD).unwrap();

    assert_eq!(collection.conflicts(GOLD, false).unwrap(), vec![history[1]]);
    assert_eq!(collection.conflicts(GOLD, true).unwrap(), vec![history[1]]);

    assert_eq!(collection.identical_to_master(c).unwrap(), vec![history[2]]);
    // B 的钥匙与 A 完全相同
    let identical_in_b = collection.identical_to_master(b).unwrap();
    assert_eq!(identical_in_b.len(), 1);
    assert_eq!(collection.record(identical_in_b[0]).unwrap().record_type, RecordType::Keym);

    let report = collection.conflict_report(GOLD).unwrap();
    assert_eq!(report.winning_plugin.as_deref(), Some("C.esp"));
    assert_eq!(report.conflicting_plugins, vec!["B.esp"]);
}

#[test]
fn test_all_conflicts_serializes() {
    let (collection, _) = scenario();
    let reports = collection.all_conflicts(false).unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].form_id, GOLD);

    let json = serde_json::to_string(&reports).unwrap();
    assert!(json.contains("C.esp"));
}

#[test]
fn test_deleted_last_entry_has_no_winner() {
    let tombstone = PluginBuilder::new().master("A.esm").deleted_glob(0x0000_0800, "Gold", 1.0).build();
    let (mut collection, _io) = memory_collection(&[("A.esm", plugin_a()), ("D.esp", tombstone)]);
    collection.add_plugin("A.esm", ModFlags::empty()).unwrap();
    let d = collection.add_plugin("D.esp", ModFlags::empty()).unwrap();
    collection.load(None).unwrap();

    assert_eq!(collection.winner(GOLD).unwrap(), None);
    assert_eq!(collection.history(GOLD).unwrap().len(), 2);
    assert_eq!(collection.deleted_records(d).unwrap().len(), 1);
    assert!(collection.records_of_type(d, RecordType::Glob).unwrap().is_empty());
    // 删除与未删除的版本不同
    assert_eq!(collection.conflicts(GOLD, false).unwrap().len(), 1);
}

#[test]
fn test_delete_record_marks_tombstone() {
    let (mut collection, [_, b, _]) = scenario();
    let local = LocalRef(0x0100_0900);
    let rid = collection.lookup(b, local).unwrap().unwrap();

    collection.delete_record(rid).unwrap();
    let global = collection.to_global(b, local).unwrap();
    assert_eq!(collection.winner(global).unwrap(), None);
    assert_eq!(collection.history(global).unwrap(), vec![rid]);
    assert!(collection.plugin(b).unwrap().is_dirty());
}

#[test]
fn test_update_references_rewrites_one_field() {
    let (mut collection, [a, b, _]) = scenario();
    let key_b = collection.lookup(b, LocalRef(0x0000_0802)).unwrap().unwrap();
    let old = collection.to_global(a, LocalRef(0x0000_0801)).unwrap();
    let new = collection.to_global(b, LocalRef(0x0100_0901)).unwrap();

    let updates = collection.update_references(ReferenceScope::Record(key_b), &[old], &[new]).unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].record, key_b);
    assert_eq!(updates[0].fields.len(), 1);

    match collection.get_field(key_b, &FieldPath::from(b"KWDA")).unwrap() {
        Some(FieldValue::Array(forms)) => match forms[0] {
            Scalar::FormId(FormRef::Resolved(key)) => assert_eq!(collection.global_id(key).unwrap(), new),
            ref other => panic!("unexpected keyword {:?}", other),
        },
        other => panic!("unexpected KWDA {:?}", other),
    }

    // 改写后不再与 A 的版本相同
    assert!(collection.identical_to_master(b).unwrap().is_empty());
}

#[test]
fn test_update_references_requires_parallel_arrays() {
    let (mut collection, [_, b, _]) = scenario();
    let result = collection.update_references(ReferenceScope::Plugin(b), &[GOLD], &[]);
    assert!(matches!(result, Err(EspError::InvalidArgument(_))));
}

#[test]
fn test_update_references_on_read_only_plugin() {
    let (mut collection, [a, ..]) = scenario();
    let result = collection.update_references(ReferenceScope::Plugin(a), &[GOLD], &[GOLD]);
    assert!(matches!(result, Err(EspError::ReadOnly(_))));
}

#[test]
fn test_unload_reload_is_idempotent() {
    let (mut collection, [_, b, _]) = scenario();
    let snapshot = |collection: &Collection| {
        let history = collection.history(GOLD).unwrap();
        let winner = collection.winner(GOLD).unwrap().map(|rid| glob_value(collection, rid));
        let conflicts = collection.conflicts(GOLD, true).unwrap();
        (plugin_names(collection, &history), winner, plugin_names(collection, &conflicts))
    };
    let before = snapshot(&collection);

    collection.unload_plugin(b).unwrap();
    assert!(!collection.plugin(b).unwrap().is_loaded());
    assert_eq!(collection.position(b).unwrap(), 1);
    assert_eq!(collection.history(GOLD).unwrap().len(), 2);
    assert!(collection.is_plugin_empty(b).unwrap());

    collection.load_plugin(b).unwrap();
    assert_eq!(snapshot(&collection), before);
}

#[test]
fn test_stale_record_handle_after_unload() {
    let (mut collection, [_, b, _]) = scenario();
    let rid = collection.lookup(b, LocalRef(0x0100_0900)).unwrap().unwrap();
    collection.unload_plugin(b).unwrap();

    assert!(matches!(collection.record(rid), Err(EspError::UseAfterUnload)));
    assert!(matches!(collection.get_field(rid, &FieldPath::from(b"EDID")), Err(EspError::UseAfterUnload)));
}

#[test]
fn test_duplicate_plugin_is_rejected() {
    let (mut collection, _) = scenario();
    assert!(matches!(collection.add_plugin("a.esm", ModFlags::empty()), Err(EspError::DuplicatePlugin(_))));
    assert!(matches!(collection.add_plugin("", ModFlags::empty()), Err(EspError::InvalidArgument(_))));
}

#[test]
fn test_progress_callback_can_cancel() {
    let (mut collection, _io) =
        memory_collection(&[("A.esm", plugin_a()), ("B.esp", plugin_b()), ("C.esp", plugin_c())]);
    let a = collection.add_plugin("A.esm", ModFlags::empty()).unwrap();
    let b = collection.add_plugin("B.esp", ModFlags::empty()).unwrap();
    collection.add_plugin("C.esp", ModFlags::empty()).unwrap();

    let mut seen = Vec::new();
    let mut stop_at_b = |position: u32, max: u32, name: &str| {
        seen.push((position, max, name.to_string()));
        position < 1
    };
    let progress: ProgressCallback<'_> = &mut stop_at_b;
    assert!(matches!(collection.load(Some(progress)), Err(EspError::Cancelled)));

    assert_eq!(seen, vec![(0, 2, "A.esm".to_string()), (1, 2, "B.esp".to_string())]);
    assert!(collection.plugin(a).unwrap().is_loaded());
    assert!(!collection.plugin(b).unwrap().is_loaded());

    // 再次加载补齐剩余插件
    collection.load(None).unwrap();
    assert_eq!(collection.loaded_plugins().len(), 3);
}

#[test]
fn test_missing_master_leaves_override_orphaned() {
    let (mut collection, _io) = memory_collection(&[("B.esp", plugin_b())]);
    let b = collection.add_plugin("B.esp", ModFlags::empty()).unwrap();
    collection.load(None).unwrap();

    let orphans = collection.orphans(b).unwrap();
    assert_eq!(orphans.len(), 2, "GLOB 0x800 和 KEYM 0x802 的来源不在集合中");
    assert!(collection.has_invalid_form_ids(orphans[0]).unwrap());

    let own = collection.lookup(b, LocalRef(0x0100_0900)).unwrap();
    assert!(own.is_some());
    assert_eq!(collection.records_of_type(b, RecordType::Glob).unwrap().len(), 1);
    assert!(matches!(
        collection.to_global(b, LocalRef(0x0000_0800)),
        Err(EspError::UnresolvedMaster { slot: 0, .. })
    ));
}

#[test]
fn test_missing_file_raises_failure() {
    let raised = Arc::new(Mutex::new(Vec::new()));
    let sink = raised.clone();
    let diagnostics = CallbackDiagnostics::new()
        .on_raise(move |op| sink.lock().unwrap().push(op.to_string()))
        .into_shared();

    let (collection, _io) = memory_collection(&[]);
    let mut collection = collection.with_diagnostics(diagnostics);
    let missing = collection.add_plugin("Missing.esp", ModFlags::empty()).unwrap();

    assert!(collection.load_plugin(missing).is_err());
    assert_eq!(*raised.lock().unwrap(), vec!["load_plugin".to_string()]);
}

#[test]
fn test_one_bad_plugin_does_not_stop_the_batch() {
    let (mut collection, _io) = memory_collection(&[("A.esm", plugin_a()), ("Broken.esp", b"TES4garbage".to_vec())]);
    let broken = collection.add_plugin("Broken.esp", ModFlags::empty()).unwrap();
    let a = collection.add_plugin("A.esm", ModFlags::empty()).unwrap();

    assert!(collection.load(None).is_err());
    assert!(collection.plugin(a).unwrap().is_loaded());
    assert!(!collection.plugin(broken).unwrap().is_loaded());
}

#[test]
fn test_malformed_record_is_kept_as_orphan() {
    let mut bad_body = Vec::new();
    chunk(&mut bad_body, b"EDID", &zstring("Bad"));
    chunk(&mut bad_body, b"FNAM", b"f");
    chunk(&mut bad_body, b"FLTV", &[0, 0]);
    let bytes = PluginBuilder::new()
        .glob(0x0000_0800, "Good", 1.0)
        .raw_record(b"GLOB", 0x0000_0801, 0, bad_body)
        .build();

    let (mut collection, _io) = memory_collection(&[("M.esp", bytes)]);
    let m = collection.add_plugin("M.esp", ModFlags::empty()).unwrap();
    collection.load(None).unwrap();

    let orphans = collection.orphans(m).unwrap();
    assert_eq!(orphans.len(), 1);
    assert!(collection.record(orphans[0]).unwrap().is_malformed());
    assert_eq!(collection.records_of_type(m, RecordType::Glob).unwrap().len(), 1);
    assert!(collection.history(GlobalId(0x0000_0801)).unwrap().is_empty());

    let stats = collection.plugin_stats(m).unwrap();
    assert_eq!(stats.record_count, 2);
    assert_eq!(stats.malformed_count, 1);
}

#[test]
fn test_lookup_and_enumeration() {
    let (collection, [a, b, _]) = scenario();
    assert_eq!(
        collection.record_types(a).unwrap(),
        vec![RecordType::Keym, RecordType::Kywd, RecordType::Glob]
    );
    assert_eq!(collection.records_of_type(b, RecordType::Glob).unwrap().len(), 2);
    assert!(collection.lookup(b, LocalRef(0x0100_0999)).unwrap().is_none());
    assert_eq!(collection.num_empty_groups(a).unwrap(), 0);
    assert!(!collection.is_plugin_empty(a).unwrap());
}

#[test]
fn test_formid_conversions() {
    let (mut collection, [a, b, c]) = scenario();

    assert_eq!(collection.to_global(b, LocalRef(0x0000_0800)).unwrap(), GOLD);
    assert_eq!(collection.to_global(b, LocalRef(0x0100_0900)).unwrap(), GlobalId(0x0100_0900));
    assert_eq!(collection.to_local(c, GlobalId(0x0100_0900)).unwrap(), LocalRef(0x0100_0900));
    assert_eq!(collection.make_local_ref(c, 0x123).unwrap(), LocalRef(0x0200_0123));

    assert_eq!(collection.long_name(c, LocalRef(0x0100_0900)).unwrap(), ("B.esp".to_string(), 0x900));
    assert_eq!(collection.from_long_name(c, "A.esm", 0x800).unwrap(), LocalRef(0x0000_0800));

    // A 不可编辑，不能追加主文件
    assert!(matches!(
        collection.to_local(a, GlobalId(0x0100_0900)),
        Err(EspError::NotAMaster { .. })
    ));
    assert!(collection.plugin(a).unwrap().masters.is_empty());
}

#[test]
fn test_to_local_adds_master_when_allowed() {
    let (mut collection, _io) = memory_collection(&[("A.esm", plugin_a()), ("B.esp", plugin_b())]);
    collection.add_plugin("A.esm", ModFlags::empty()).unwrap();
    collection.add_plugin("B.esp", ModFlags::empty()).unwrap();
    let patch = collection
        .add_plugin("Patch.esp", ModFlags::CREATE_NEW | ModFlags::SAVEABLE | ModFlags::ADD_MASTERS)
        .unwrap();
    collection.load(None).unwrap();

    let local = collection.to_local(patch, GlobalId(0x0100_0900)).unwrap();
    assert_eq!(local, LocalRef(0x0000_0900));
    assert_eq!(collection.plugin(patch).unwrap().masters, vec!["B.esp"]);
    assert_eq!(collection.to_global(patch, local).unwrap(), GlobalId(0x0100_0900));
}

#[test]
fn test_move_plugin_reorders_overrides() {
    let (mut collection, [_, b, c]) = scenario();
    let new_record = GlobalId(0x0100_0900);
    let rid = collection.winner(new_record).unwrap().unwrap();

    collection.move_plugin(b, 2).unwrap();
    assert_eq!(collection.position(c).unwrap(), 1);

    // B 的对象现在位于 02
    assert!(collection.history(new_record).unwrap().is_empty());
    assert_eq!(collection.winner(GlobalId(0x0200_0900)).unwrap(), Some(rid));

    let history = collection.history(GOLD).unwrap();
    assert_eq!(plugin_names(&collection, &history), vec!["A.esm", "C.esp", "B.esp"]);
    assert_eq!(collection.winner(GOLD).unwrap(), Some(history[2]));
}

#[test]
fn test_structure_dump_shows_global_ids() {
    let (collection, [_, b, _]) = scenario();
    let mut out = Vec::new();
    EspDebugger::dump(&collection, b, &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();

    assert!(text.contains("文件: B.esp"));
    assert!(text.contains("=== 主文件列表 (1) ==="));
    assert!(text.contains("00: A.esm"));
    assert!(text.contains("GlobalID: 01000900"));
    assert!(text.contains("EDID: \"BNew\""));
    // 关键字引用按加载顺序显示
    assert!(text.contains("KWDA: [00000801]"));
    assert!(!text.contains("孤立记录"));
}

#[test]
fn test_is_winning() {
    let (collection, [a, b, c]) = scenario();
    let gold_a = collection.lookup(a, LocalRef(0x0000_0800)).unwrap().unwrap();
    let gold_b = collection.lookup(b, LocalRef(0x0000_0800)).unwrap().unwrap();
    let gold_c = collection.lookup(c, LocalRef(0x0000_0800)).unwrap().unwrap();

    assert!(collection.is_winning(gold_c, false).unwrap());
    assert!(!collection.is_winning(gold_b, false).unwrap());
    // B 引入了最终内容，C 原样复制
    assert!(collection.is_winning(gold_b, true).unwrap());
    assert!(!collection.is_winning(gold_a, true).unwrap());
}

#[test]
fn test_deleted_winner_means_nobody_wins() {
    let deleting = PluginBuilder::new()
        .master("A.esm")
        .deleted_glob(0x0000_0800, "Gold", 1.0)
        .build();
    let (mut collection, _io) = memory_collection(&[("A.esm", plugin_a()), ("D.esp", deleting)]);
    let a = collection.add_plugin("A.esm", ModFlags::empty()).unwrap();
    let d = collection.add_plugin("D.esp", ModFlags::empty()).unwrap();
    collection.load(None).unwrap();

    for plugin in [a, d] {
        let rid = collection.lookup(plugin, LocalRef(0x0000_0800)).unwrap().unwrap();
        assert!(!collection.is_winning(rid, false).unwrap());
        assert!(!collection.is_winning(rid, true).unwrap());
    }
}

#[test]
fn test_updated_references_are_counted_per_record() {
    let (mut collection, [a, b, _]) = scenario();
    let key_b = collection.lookup(b, LocalRef(0x0000_0802)).unwrap().unwrap();
    let old = collection.to_global(a, LocalRef(0x0000_0801)).unwrap();
    let new = collection.to_global(b, LocalRef(0x0100_0901)).unwrap();
    assert_eq!(collection.updated_references(key_b).unwrap(), 0);

    collection.update_references(ReferenceScope::Plugin(b), &[old], &[new]).unwrap();
    collection.update_references(ReferenceScope::Record(key_b), &[new], &[old]).unwrap();
    assert_eq!(collection.updated_references(key_b).unwrap(), 2);

    let gold_b = collection.lookup(b, LocalRef(0x0000_0800)).unwrap().unwrap();
    assert_eq!(collection.updated_references(gold_b).unwrap(), 0);

    collection.reset_record(key_b).unwrap();
    assert_eq!(collection.updated_references(key_b).unwrap(), 0);
}

#[test]
fn test_unload_record() {
    let (mut collection, [_, b, _]) = scenario();
    let gold_b = collection.lookup(b, LocalRef(0x0000_0800)).unwrap().unwrap();
    collection.unload_record(gold_b).unwrap();

    assert!(matches!(collection.record(gold_b), Err(EspError::UseAfterUnload)));
    assert!(matches!(collection.unload_record(gold_b), Err(EspError::UseAfterUnload)));
    assert_eq!(
        plugin_names(&collection, &collection.history(GOLD).unwrap()),
        vec!["A.esm", "C.esp"]
    );
    assert_eq!(collection.lookup(b, LocalRef(0x0000_0800)).unwrap(), None);
    assert_eq!(collection.records_of_type(b, RecordType::Glob).unwrap().len(), 1);
    assert!(collection.plugin(b).unwrap().is_dirty());

    // 修改过的记录不能卸载
    let new_b = collection.lookup(b, LocalRef(0x0100_0900)).unwrap().unwrap();
    set_glob_value(&mut collection, new_b, 7.0);
    assert!(matches!(collection.unload_record(new_b), Err(EspError::InvalidArgument(_))));
    assert_eq!(glob_value(&collection, new_b), 7.0);
}
