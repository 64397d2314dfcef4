//! End-to-end scenarios: real modules assembled from text, run through the
//! public loader against in-memory byte streams.

use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use wasi_host::{Execution, Host, Stdio};

fn module_file(dir: &TempDir, name: &str, wat: &str) -> PathBuf {
    let bytes = wat::parse_str(wat).expect("fixture must assemble");
    let path = dir.path().join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

fn null_stdio() -> Stdio {
    Stdio::new(tokio::io::empty(), tokio::io::sink(), tokio::io::sink())
}

async fn finish(exec: Execution) -> i32 {
    tokio::time::timeout(Duration::from_secs(10), exec.exit_code())
        .await
        .expect("execution did not settle in time")
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn explicit_exit_code_is_reported() {
    let dir = TempDir::new().unwrap();
    let path = module_file(
        &dir,
        "exit42.wasm",
        r#"(module
            (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
            (func (export "_start")
              (call $proc_exit (i32.const 42))))"#,
    );

    let host = Host::new().unwrap();
    let exec = host
        .load_component(&path, null_stdio(), &args(&["exit42"]))
        .await
        .unwrap();
    assert_eq!(finish(exec).await, 42);

    // every successful instantiation lands in the registry
    let record = host.loaded_module(&path).expect("registry entry");
    assert!(record.module.is_some());
    assert!(record.exports.iter().any(|e| e == "_start"));
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn start_to_finish_without_exit_call_is_zero() {
    let dir = TempDir::new().unwrap();
    let path = module_file(
        &dir,
        "noop.wasm",
        r#"(module (memory (export "memory") 1) (func (export "_start")))"#,
    );

    let host = Host::new().unwrap();
    let exec = host
        .load_component(&path, null_stdio(), &args(&["noop"]))
        .await
        .unwrap();
    assert_eq!(finish(exec).await, 0);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn happy_path_echo() {
    let dir = TempDir::new().unwrap();
    let path = module_file(
        &dir,
        "echo.wasm",
        r#"(module
            (import "wasi_snapshot_preview1" "fd_read"
              (func $fd_read (param i32 i32 i32 i32) (result i32)))
            (import "wasi_snapshot_preview1" "fd_write"
              (func $fd_write (param i32 i32 i32 i32) (result i32)))
            (memory (export "memory") 1)
            (func (export "_start")
              (local $err i32)
              (block $done
                (loop $again
                  (i32.store (i32.const 0) (i32.const 1024))
                  (i32.store (i32.const 4) (i32.const 256))
                  (local.set $err
                    (call $fd_read (i32.const 0) (i32.const 0) (i32.const 1) (i32.const 8)))
                  ;; no data yet: poll until the pump catches up
                  (br_if $again (i32.eq (local.get $err) (i32.const 6)))
                  (br_if $done (i32.ne (local.get $err) (i32.const 0)))
                  (br_if $done (i32.eqz (i32.load (i32.const 8))))
                  (i32.store (i32.const 16) (i32.const 1024))
                  (i32.store (i32.const 20) (i32.load (i32.const 8)))
                  (drop
                    (call $fd_write (i32.const 1) (i32.const 16) (i32.const 1) (i32.const 24)))
                  (br $again)))))"#,
    );

    let (stdin_host, mut stdin_feed) = tokio::io::duplex(64 * 1024);
    let (stdout_host, mut stdout_read) = tokio::io::duplex(64 * 1024);
    let (stderr_host, _stderr_keep) = tokio::io::duplex(64 * 1024);

    let host = Host::new().unwrap();
    let exec = host
        .load_component(
            &path,
            Stdio::new(stdin_host, stdout_host, stderr_host),
            &args(&["echo"]),
        )
        .await
        .unwrap();

    stdin_feed.write_all(b"hello\n").await.unwrap();
    drop(stdin_feed);

    assert_eq!(finish(exec).await, 0);

    let mut out = vec![0u8; 6];
    tokio::io::AsyncReadExt::read_exact(&mut stdout_read, &mut out)
        .await
        .unwrap();
    assert_eq!(&out, b"hello\n");
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn fd_write_preserves_submission_order() {
    let dir = TempDir::new().unwrap();
    let path = module_file(
        &dir,
        "writer.wasm",
        r#"(module
            (import "wasi_snapshot_preview1" "fd_write"
              (func $fd_write (param i32 i32 i32 i32) (result i32)))
            (memory (export "memory") 1)
            (data (i32.const 256) "alpha-")
            (data (i32.const 272) "bravo-")
            (data (i32.const 288) "charlie-")
            (data (i32.const 304) "delta-")
            (data (i32.const 320) "echo")
            (func $emit (param $ptr i32) (param $len i32)
              (i32.store (i32.const 0) (local.get $ptr))
              (i32.store (i32.const 4) (local.get $len))
              (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8))))
            (func (export "_start")
              (call $emit (i32.const 256) (i32.const 6))
              (call $emit (i32.const 272) (i32.const 6))
              (call $emit (i32.const 288) (i32.const 8))
              (call $emit (i32.const 304) (i32.const 6))
              (call $emit (i32.const 320) (i32.const 4))))"#,
    );

    let (stdout_host, mut stdout_read) = tokio::io::duplex(64 * 1024);
    let host = Host::new().unwrap();
    let exec = host
        .load_component(
            &path,
            Stdio::new(tokio::io::empty(), stdout_host, tokio::io::sink()),
            &args(&["writer"]),
        )
        .await
        .unwrap();
    assert_eq!(finish(exec).await, 0);

    let expected = b"alpha-bravo-charlie-delta-echo";
    let mut out = vec![0u8; expected.len()];
    tokio::io::AsyncReadExt::read_exact(&mut stdout_read, &mut out)
        .await
        .unwrap();
    assert_eq!(&out, expected);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn read_on_empty_open_stdin_would_block_without_asyncify() {
    let dir = TempDir::new().unwrap();
    let path = module_file(
        &dir,
        "block.wasm",
        r#"(module
            (import "wasi_snapshot_preview1" "fd_read"
              (func $fd_read (param i32 i32 i32 i32) (result i32)))
            (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
            (memory (export "memory") 1)
            (func (export "_start")
              (i32.store (i32.const 0) (i32.const 64))
              (i32.store (i32.const 4) (i32.const 16))
              (call $proc_exit
                (call $fd_read (i32.const 0) (i32.const 0) (i32.const 1) (i32.const 8)))))"#,
    );

    // the write half stays open and silent for the whole run
    let (stdin_host, _stdin_keep) = tokio::io::duplex(1024);
    let host = Host::new().unwrap();
    let exec = host
        .load_component(
            &path,
            Stdio::new(stdin_host, tokio::io::sink(), tokio::io::sink()),
            &args(&["block"]),
        )
        .await
        .unwrap();

    // errno 6: "would block"
    assert_eq!(finish(exec).await, 6);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn asyncify_interactive_reads_suspend_and_resume() {
    let dir = TempDir::new().unwrap();
    // A hand-modelled Asyncify guest: the five exports flip the state
    // global the way the transformation's runtime does, `_start` returns
    // to the host while "unwound", and a re-invocation while "rewinding"
    // picks up where the reads left off. Exits 0 only if it completed two
    // blocking reads across exactly two suspensions.
    let path = module_file(
        &dir,
        "interactive.wasm",
        r#"(module
            (import "wasi_snapshot_preview1" "fd_read"
              (func $fd_read (param i32 i32 i32 i32) (result i32)))
            (import "wasi_snapshot_preview1" "fd_write"
              (func $fd_write (param i32 i32 i32 i32) (result i32)))
            (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
            (memory (export "memory") 1)
            (global $state (mut i32) (i32.const 0))
            (global $reads (mut i32) (i32.const 0))
            (global $unwinds (mut i32) (i32.const 0))
            (func (export "asyncify_get_state") (result i32) (global.get $state))
            (func (export "asyncify_start_unwind") (param i32)
              (global.set $state (i32.const 1))
              (global.set $unwinds (i32.add (global.get $unwinds) (i32.const 1))))
            (func (export "asyncify_stop_unwind") (global.set $state (i32.const 0)))
            (func (export "asyncify_start_rewind") (param i32)
              (global.set $state (i32.const 2)))
            (func (export "asyncify_stop_rewind") (global.set $state (i32.const 0)))
            (func (export "_start")
              (block $done
                (loop $next
                  (br_if $done (i32.ge_u (global.get $reads) (i32.const 2)))
                  (i32.store (i32.const 0) (i32.const 64))
                  (i32.store (i32.const 4) (i32.const 32))
                  (drop
                    (call $fd_read (i32.const 0) (i32.const 0) (i32.const 1) (i32.const 8)))
                  ;; suspended: hand the emptied stack back to the host
                  (if (i32.eq (global.get $state) (i32.const 1)) (then (return)))
                  (if (i32.gt_u (i32.load (i32.const 8)) (i32.const 0))
                    (then
                      (global.set $reads (i32.add (global.get $reads) (i32.const 1)))
                      (i32.store (i32.const 16) (i32.const 64))
                      (i32.store (i32.const 20) (i32.load (i32.const 8)))
                      (drop
                        (call $fd_write
                          (i32.const 1) (i32.const 16) (i32.const 1) (i32.const 24)))))
                  (br $next)))
              (if (i32.eq (global.get $unwinds) (i32.const 2))
                (then (call $proc_exit (i32.const 0)))
                (else (call $proc_exit (i32.add (i32.const 40) (global.get $unwinds)))))))"#,
    );

    let (stdin_host, mut stdin_feed) = tokio::io::duplex(1024);
    let (stdout_host, mut stdout_read) = tokio::io::duplex(64 * 1024);

    let host = Host::new().unwrap();
    let exec = host
        .load_component(
            &path,
            Stdio::new(stdin_host, stdout_host, tokio::io::sink()),
            &args(&["interactive"]),
        )
        .await
        .unwrap();

    // let the guest reach its first blocking read and suspend before any
    // input exists, then again for the second line
    tokio::time::sleep(Duration::from_millis(100)).await;
    stdin_feed.write_all(b"a\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    stdin_feed.write_all(b"b\n").await.unwrap();

    assert_eq!(finish(exec).await, 0);

    let mut out = vec![0u8; 4];
    tokio::io::AsyncReadExt::read_exact(&mut stdout_read, &mut out)
        .await
        .unwrap();
    assert_eq!(&out, b"a\nb\n");
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn asyncified_guest_that_never_suspends_completes_in_one_pass() {
    let dir = TempDir::new().unwrap();
    // Carries the transformation's exports but finishes its single
    // invocation without ever reporting an unwind. Exits nonzero if any
    // asyncify transition was driven.
    let path = module_file(
        &dir,
        "straight.wasm",
        r#"(module
            (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
            (memory (export "memory") 1)
            (global $state (mut i32) (i32.const 0))
            (global $transitions (mut i32) (i32.const 0))
            (func $touched (global.set $transitions (i32.add (global.get $transitions) (i32.const 1))))
            (func (export "asyncify_get_state") (result i32) (global.get $state))
            (func (export "asyncify_start_unwind") (param i32) (call $touched))
            (func (export "asyncify_stop_unwind") (call $touched))
            (func (export "asyncify_start_rewind") (param i32) (call $touched))
            (func (export "asyncify_stop_rewind") (call $touched))
            (func (export "_start")
              (call $proc_exit (global.get $transitions))))"#,
    );

    let host = Host::new().unwrap();
    let exec = host
        .load_component(&path, null_stdio(), &args(&["straight"]))
        .await
        .unwrap();
    assert_eq!(finish(exec).await, 0);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn imported_memory_is_sized_from_the_declaration() {
    let dir = TempDir::new().unwrap();
    let path = module_file(
        &dir,
        "memimport.wasm",
        r#"(module
            (import "env" "memory" (memory 2))
            (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
            (func (export "_start")
              ;; offset 70000 only exists if the host honored initial=2
              (i32.store (i32.const 70000) (i32.const 7))
              (call $proc_exit (i32.load (i32.const 70000)))))"#,
    );

    let host = Host::new().unwrap();
    let exec = host
        .load_component(&path, null_stdio(), &args(&["memimport"]))
        .await
        .unwrap();
    assert_eq!(finish(exec).await, 7);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn args_are_encoded_for_the_guest() {
    let dir = TempDir::new().unwrap();
    let path = module_file(
        &dir,
        "argc.wasm",
        r#"(module
            (import "wasi_snapshot_preview1" "args_sizes_get"
              (func $sizes (param i32 i32) (result i32)))
            (import "wasi_snapshot_preview1" "args_get"
              (func $get (param i32 i32) (result i32)))
            (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
            (memory (export "memory") 1)
            (func (export "_start")
              (drop (call $sizes (i32.const 0) (i32.const 4)))
              (drop (call $get (i32.const 16) (i32.const 64)))
              (call $proc_exit (i32.load (i32.const 0)))))"#,
    );

    let host = Host::new().unwrap();
    let exec = host
        .load_component(&path, null_stdio(), &args(&["echo", "hi", "there"]))
        .await
        .unwrap();
    assert_eq!(finish(exec).await, 3);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn emscripten_surface_is_present() {
    let dir = TempDir::new().unwrap();
    let path = module_file(
        &dir,
        "emkernel.wasm",
        r#"(module
            (import "env" "emscripten_console_log" (func $log (param i32)))
            (import "env" "emscripten_get_heap_max" (func $heap_max (result i32)))
            (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
            (memory (export "memory") 1)
            (data (i32.const 16) "kernel initializing\00")
            (func (export "_start")
              (call $log (i32.const 16))
              ;; exit 0 when the reported heap ceiling is positive
              (call $proc_exit
                (i32.eqz (i32.gt_s (call $heap_max) (i32.const 0))))))"#,
    );

    let host = Host::new().unwrap();
    let exec = host
        .load_component(&path, null_stdio(), &args(&["emkernel"]))
        .await
        .unwrap();
    assert_eq!(finish(exec).await, 0);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn trap_is_logged_and_maps_to_exit_one() {
    let dir = TempDir::new().unwrap();
    let path = module_file(
        &dir,
        "trap.wasm",
        r#"(module (func (export "_start") unreachable))"#,
    );

    let host = Host::new().unwrap();
    let exec = host
        .load_component(&path, null_stdio(), &args(&["trap"]))
        .await
        .unwrap();
    assert_eq!(finish(exec).await, 1);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn unknown_imports_fail_the_load_itself() {
    let dir = TempDir::new().unwrap();
    let path = module_file(
        &dir,
        "exotic.wasm",
        r#"(module
            (import "some_other_host" "frobnicate" (func $f))
            (func (export "_start") (call $f)))"#,
    );

    let host = Host::new().unwrap();
    let err = host
        .load_component(&path, null_stdio(), &args(&["exotic"]))
        .await
        .expect_err("instantiation must fail");
    assert!(format!("{err:#}").contains("instantiate"));
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn missing_file_propagates_the_read_error() {
    let host = Host::new().unwrap();
    let err = host
        .load_component("/definitely/not/here.wasm", null_stdio(), &args(&["x"]))
        .await
        .expect_err("read must fail");
    assert!(format!("{err:#}").contains("failed to read module"));
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn plain_module_loads_without_wasi_wiring() {
    let dir = TempDir::new().unwrap();
    let path = module_file(
        &dir,
        "plain.wasm",
        r#"(module
            (import "env" "log" (func $log (param i32 i32)))
            (memory (export "memory") 1)
            (data (i32.const 8) "plain module online")
            (func (export "ping") (result i32)
              (call $log (i32.const 8) (i32.const 19))
              (i32.const 99))
            (func (export "add") (param i32 i32) (result i32)
              (i32.add (local.get 0) (local.get 1))))"#,
    );

    let host = Host::new().unwrap();
    let mut plain = host.load_module(&path).await.unwrap();

    let add = plain
        .instance
        .get_typed_func::<(i32, i32), i32>(&mut plain.store, "add")
        .unwrap();
    assert_eq!(add.call(&mut plain.store, (2, 3)).unwrap(), 5);

    let ping = plain
        .instance
        .get_typed_func::<(), i32>(&mut plain.store, "ping")
        .unwrap();
    assert_eq!(ping.call(&mut plain.store, ()).unwrap(), 99);

    assert!(host.loaded_paths().contains(&path));
}
