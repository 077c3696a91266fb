#![allow(deprecated)] // cargo_bin is deprecated but still supported by assert_cmd
//! Contract tests for the memview CLI: listing, export and exit codes.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn write_snapshot(dir: &Path) -> PathBuf {
    let page: Vec<u8> = (0..16).collect();
    let snapshot = serde_json::json!({
        "version": 1,
        "documents": [
            {
                "docId": "a",
                "expr": "&buffer",
                "displayName": "buffer",
                "startAddress": "4096",
                "maxBytes": "16",
                "format": "1-byte",
                "column": 8,
                "baseAddressStale": false,
                "maxBytesStale": false,
                "memory": { "baseAddress": "4096", "pages": [page] }
            },
            {
                "docId": "b",
                "expr": "&stack",
                "displayName": "stack",
                "startAddress": "8192",
                "maxBytes": "8",
                "format": "4-byte",
                "column": "2",
                "endian": "big",
                "isCurrentDoc": true,
                "modifiedMap": { "8192": 255 },
                "memory": { "baseAddress": "8192", "pages": [[1, 2, 3, 4, 5, 6, 7, 8]] }
            }
        ]
    });
    let path = dir.join("views.json");
    fs::write(&path, serde_json::to_string(&snapshot).unwrap()).expect("write fixture");
    path
}

fn memview() -> Command {
    let mut cmd = Command::cargo_bin("memview").expect("memview binary");
    cmd.env("RUST_LOG", "error");
    cmd
}

#[test]
fn list_shows_every_document() {
    let dir = tempdir().unwrap();
    let snapshot = write_snapshot(dir.path());

    memview()
        .arg("list")
        .arg(&snapshot)
        .assert()
        .success()
        .stdout(predicate::str::contains("  a  buffer  0x0000000000001000..0x0000000000001010  16 bytes  []"))
        .stdout(predicate::str::contains(
            "* b  stack  0x0000000000002000..0x0000000000002008  8 bytes  [stale-address,stale-size,modified]",
        ));
}

#[test]
fn list_json_flags_current() {
    let dir = tempdir().unwrap();
    let snapshot = write_snapshot(dir.path());

    let output = memview()
        .args(["list", "--json"])
        .arg(&snapshot)
        .output()
        .unwrap();
    assert!(output.status.success());
    let listing: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let docs = listing.as_array().expect("array");
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[1]["docId"], "b");
    assert_eq!(docs[1]["isCurrent"], true);
    assert_eq!(docs[1]["isModified"], true);
    assert_eq!(docs[0]["startAddress"], 4096);
}

#[test]
fn dump_text_defaults_to_current_document() {
    let dir = tempdir().unwrap();
    let snapshot = write_snapshot(dir.path());

    memview()
        .arg("dump")
        .arg(&snapshot)
        .assert()
        .success()
        .stdout("0000000000002000 01020304 05060708\n");
}

#[test]
fn dump_text_for_named_document() {
    let dir = tempdir().unwrap();
    let snapshot = write_snapshot(dir.path());

    memview()
        .args(["dump", "--doc", "a"])
        .arg(&snapshot)
        .assert()
        .success()
        .stdout(
            "0000000000001000 00 01 02 03 04 05 06 07\n\
             0000000000001008 08 09 0a 0b 0c 0d 0e 0f\n",
        );
}

#[test]
fn dump_binary_to_file() {
    let dir = tempdir().unwrap();
    let snapshot = write_snapshot(dir.path());
    let out = dir.path().join("a.bin");

    memview()
        .args(["dump", "--doc", "a", "--binary", "--out"])
        .arg(&out)
        .arg(&snapshot)
        .assert()
        .success();

    let bytes = fs::read(&out).unwrap();
    assert_eq!(bytes, (0..16).collect::<Vec<u8>>());
}

#[test]
fn unknown_document_exits_with_bad_input() {
    let dir = tempdir().unwrap();
    let snapshot = write_snapshot(dir.path());

    memview()
        .args(["dump", "--doc", "zz"])
        .arg(&snapshot)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("document not found: zz"));
}

#[test]
fn missing_or_malformed_snapshot_exits_with_bad_input() {
    let dir = tempdir().unwrap();

    memview()
        .arg("list")
        .arg(dir.path().join("absent.json"))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("snapshot not found"));

    let broken = dir.path().join("broken.json");
    fs::write(&broken, r#"{"version": 9, "documents": []}"#).unwrap();
    memview()
        .arg("list")
        .arg(&broken)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unsupported snapshot version"));
}

#[test]
fn version_prints_package_version() {
    memview()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}
