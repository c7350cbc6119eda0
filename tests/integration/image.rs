//! Program images loaded from disk and run end to end

use std::path::PathBuf;

use picvm::cache::{CacheState, StoreRegistry};
use picvm::util::config::PicvmConfig;
use picvm::vm::ProgramCounter;
use picvm::{engine_for, load_image, run_image};
use tempfile::TempDir;

/// Counts to 12 with a cached `+`, then reports through a method
const COUNTER: &str = r#"(
    constants: [Str("total")],
    chunks: [
        (name: "main", code: [
            (op: gc_alloc, args: [0, 16, 1]),
            (op: set_imm, args: [1, 0, 0]),
            (op: set_imm, args: [2, 0, 1]),
            (op: set_imm, args: [3, 0, 12]),
            (op: infix, args: [1, 1, 2, 0]),
            (op: infix, args: [4, 1, 3, 7]),
            (op: goto_if, args: [4, 4]),
            (op: set_attr, args: [0, 0, 1]),
            (op: call_method, args: [5, 0, 0, 0]),
            (op: exit, args: [5]),
        ]),
        (name: "total", code: [
            (op: get_attr, args: [1, 0, 0]),
            (op: ret, args: [1]),
        ]),
    ],
    subs: [(name: "Counter.total", chunk: "total", params: ["Counter"], result: "int")],
    classes: [(
        name: "Counter",
        tag: 16,
        attributes: ["total"],
        methods: [(name: "total", sub: "Counter.total")],
    )],
)"#;

const PRINT_JSON: &str = r#"{
    "constants": [{"Str": "hi"}],
    "chunks": [{"name": "main", "code": [
        {"op": "load_const", "args": [0, 0]},
        {"op": "print_s", "args": [0]},
        {"op": "set_imm", "args": [1, 0, 7]},
        {"op": "exit", "args": [1]}
    ]}],
    "entry": "0:0"
}"#;

fn write(
    dir: &TempDir,
    name: &str,
    text: &str,
) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, text).unwrap();
    path
}

#[test]
fn test_run_ron_image() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "counter.ron", COUNTER);
    assert_eq!(run_image(&path, &PicvmConfig::default()).unwrap(), 12);
}

#[test]
fn test_run_json_image() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "print.json", PRINT_JSON);
    assert_eq!(run_image(&path, &PicvmConfig::default()).unwrap(), 7);
}

#[test]
fn test_loaded_image_caches() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "counter.ron", COUNTER);
    let loaded = load_image(&path).unwrap();
    assert_eq!(loaded.entry, ProgramCounter::new(0, 0));
    assert_eq!(loaded.segment.site_count(), 5);

    let config = PicvmConfig::default();
    let mut stores = StoreRegistry::new(config.cache.policy(), config.cache.arena_regions_per_site);
    let mut engine = engine_for(&loaded, &config, &mut stores);
    assert_eq!(engine.dispatch_run(loaded.entry, &[]).unwrap(), 12);
    assert_eq!(stores.loaded(), 1);

    let add = loaded.segment.site_at(ProgramCounter::new(0, 4)).unwrap().index;
    let ic = engine.store().snapshot(add).unwrap();
    assert_eq!(ic.state(), CacheState::Monomorphic);
    assert_eq!(ic.stats().hits, 11);
}

#[test]
fn test_disabled_cache_from_config() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "counter.ron", COUNTER);
    let mut config = PicvmConfig::default();
    config.cache.enabled = false;

    let loaded = load_image(&path).unwrap();
    let mut stores = StoreRegistry::new(config.cache.policy(), config.cache.arena_regions_per_site);
    let mut engine = engine_for(&loaded, &config, &mut stores);
    assert_eq!(engine.dispatch_run(loaded.entry, &[]).unwrap(), 12);
    // every dynamic instruction resolved: 12 adds, 12 compares, 1 set, 1 call, 1 get
    assert_eq!(engine.resolutions(), 27);
}

#[test]
fn test_load_errors_name_the_file() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("nope.ron");
    let err = load_image(&missing).unwrap_err();
    assert!(err.to_string().contains("nope.ron"));

    let broken = write(&dir, "broken.ron", "(chunks: [");
    let err = load_image(&broken).unwrap_err();
    assert!(format!("{:#}", err).contains("Image parse error"));

    let bad_entry = write(
        &dir,
        "entry.json",
        r#"{"chunks": [{"name": "main", "code": []}], "entry": "nowhere"}"#,
    );
    assert!(load_image(&bad_entry).is_err());
}

#[test]
fn test_runtime_error_surfaces() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "fault.ron",
        r#"(chunks: [(name: "main", code: [(op: infix, args: [2, 0, 1, 0])])])"#,
    );
    let err = run_image(&path, &PicvmConfig::default()).unwrap_err();
    assert!(format!("{:#}", err).contains("fault.ron"));
}
