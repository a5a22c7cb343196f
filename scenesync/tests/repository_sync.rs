//! End-to-end sync tests against the in-memory transport.
//!
//! Each test serves a small remote tree from `MemoryTransport`, drives an
//! `HttpRepository` to completion and checks the resulting local tree.

use std::fs;
use std::io::Write;
use std::path::Path;

use scenesync::hash::hash_bytes;
use scenesync::http::MemoryTransport;
use scenesync::repository::{
    EntryType, HttpRepository, PathFilter, RepoConfig, ResultCode, SyncAction, HASH_CACHE_FILE_NAME,
    INDEX_FILE_NAME,
};
use tempfile::TempDir;

const BASE_URL: &str = "http://repo.invalid/";

// ============================================================================
// Helpers
// ============================================================================

fn index(records: &[String]) -> String {
    let mut text = String::from("version:1\n");
    for record in records {
        text.push_str(record);
        text.push('\n');
    }
    text
}

fn file_record(name: &str, content: &[u8]) -> String {
    format!("f:{}:{}:{}", name, hash_bytes(content), content.len())
}

fn tarball_record(name: &str, content: &[u8]) -> String {
    format!("t:{}:{}:{}", name, hash_bytes(content), content.len())
}

fn dir_record(name: &str, child_index: &str) -> String {
    format!("d:{}:{}", name, hash_bytes(child_index.as_bytes()))
}

/// Root with `a.txt` (10 bytes) and `sub/b.txt` (5 bytes).
fn serve_basic_tree(transport: &MemoryTransport) {
    let sub_index = index(&[file_record("b.txt", b"bravo")]);
    let root_index = index(&[
        file_record("a.txt", b"alpha-0123"),
        dir_record("sub", &sub_index),
    ]);
    transport.insert("/.dirindex", root_index);
    transport.insert("/sub/.dirindex", sub_index);
    transport.insert("/a.txt", &b"alpha-0123"[..]);
    transport.insert("/sub/b.txt", &b"bravo"[..]);
}

fn repository(transport: &MemoryTransport, dest: &Path) -> HttpRepository {
    repository_with(transport, RepoConfig::new(BASE_URL, dest))
}

fn repository_with(transport: &MemoryTransport, config: RepoConfig) -> HttpRepository {
    HttpRepository::new(config, Box::new(transport.clone())).unwrap()
}

fn run(repo: &mut HttpRepository) {
    repo.update();
    for _ in 0..10_000 {
        if !repo.is_doing_sync() {
            return;
        }
        repo.process();
    }
    panic!("sync did not finish");
}

fn tar_gz(entries: &[(&str, &[u8])]) -> Vec<u8> {
    tar_gz_blocked(entries, 512)
}

/// Gzipped tar whose length is rounded up to `record` bytes, as GNU tar
/// writes with its default blocking factor.
fn tar_gz_blocked(entries: &[(&str, &[u8])], record: usize) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, path, *data).unwrap();
    }
    let mut tar = builder.into_inner().unwrap();
    tar.resize(tar.len().div_ceil(record) * record, 0);

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&tar).unwrap();
    encoder.finish().unwrap()
}

fn leftover_temp_files(dir: &Path) -> Vec<String> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir).unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().unwrap().is_dir() {
            found.extend(leftover_temp_files(&entry.path()));
        } else if name.ends_with(".part") {
            found.push(name);
        }
    }
    found
}

// ============================================================================
// Basic sync
// ============================================================================

#[test]
fn test_fresh_sync_mirrors_tree() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    serve_basic_tree(&transport);

    let mut repo = repository(&transport, temp.path());
    run(&mut repo);

    assert_eq!(repo.failure(), ResultCode::NoError);
    assert!(repo.failures().is_empty());
    assert_eq!(repo.bytes_downloaded(), 15);
    assert_eq!(repo.bytes_to_download(), 15);
    assert_eq!(fs::read(temp.path().join("a.txt")).unwrap(), b"alpha-0123");
    assert_eq!(fs::read(temp.path().join("sub/b.txt")).unwrap(), b"bravo");
    assert!(temp.path().join(INDEX_FILE_NAME).is_file());
    assert!(temp.path().join("sub").join(INDEX_FILE_NAME).is_file());

    let stats = repo.stats();
    assert_eq!(stats.indexes_fetched, 2);
    assert_eq!(stats.files_written, 2);
    assert_eq!(stats.requests_issued, 4);
    assert!(leftover_temp_files(temp.path()).is_empty());
}

#[test]
fn test_root_index_requested_before_children() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    serve_basic_tree(&transport);

    let mut repo = repository(&transport, temp.path());
    run(&mut repo);

    let requests = transport.stats().requests;
    assert_eq!(requests[0], "/.dirindex");
    let sub = requests.iter().position(|p| p == "/sub/.dirindex").unwrap();
    let sub_file = requests.iter().position(|p| p == "/sub/b.txt").unwrap();
    assert!(sub < sub_file);
}

#[test]
fn test_base_url_with_path_prefix() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    transport.insert("/ws2/.dirindex", index(&[file_record("a.txt", b"alpha")]));
    transport.insert("/ws2/a.txt", &b"alpha"[..]);

    let mut repo = repository_with(
        &transport,
        RepoConfig::new("http://repo.invalid/ws2", temp.path()),
    );
    run(&mut repo);

    assert_eq!(repo.failure(), ResultCode::NoError);
    assert_eq!(fs::read(temp.path().join("a.txt")).unwrap(), b"alpha");
}

#[test]
fn test_hash_cache_written_for_downloads() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    serve_basic_tree(&transport);

    let mut repo = repository(&transport, temp.path());
    run(&mut repo);

    let cache = fs::read_to_string(temp.path().join(HASH_CACHE_FILE_NAME)).unwrap();
    assert!(cache.starts_with("@verified:"));
    assert!(cache.contains(&format!("a.txt:{}:", hash_bytes(b"alpha-0123"))));
}

// ============================================================================
// Incremental behavior
// ============================================================================

#[test]
fn test_second_sync_downloads_nothing() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    serve_basic_tree(&transport);

    run(&mut repository(&transport, temp.path()));
    transport.reset_stats();

    // Fresh handle so nothing carries over except what is on disk
    let config = RepoConfig::new(BASE_URL, temp.path()).with_recheck_timeout_enabled(false);
    let mut repo = repository_with(&transport, config);
    run(&mut repo);

    assert_eq!(repo.failure(), ResultCode::NoError);
    assert_eq!(repo.stats().files_written, 0);
    assert_eq!(repo.bytes_downloaded(), 0);
    // Root has no announced hash; `sub` matches its saved index
    assert_eq!(transport.stats().requests, vec!["/.dirindex".to_string()]);
}

#[test]
fn test_unchanged_root_index_leaves_caches_untouched() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    serve_basic_tree(&transport);
    run(&mut repository(&transport, temp.path()));

    let old = filetime::FileTime::from_unix_time(1_000_000_000, 0);
    let index_path = temp.path().join(".dirindex");
    let cache_path = temp.path().join(".dirhash");
    filetime::set_file_mtime(&index_path, old).unwrap();
    filetime::set_file_mtime(&cache_path, old).unwrap();
    let cache_before = fs::read_to_string(&cache_path).unwrap();

    let config = RepoConfig::new(BASE_URL, temp.path()).with_recheck_timeout_enabled(false);
    let mut repo = repository_with(&transport, config);
    run(&mut repo);

    assert_eq!(repo.failure(), ResultCode::NoError);
    assert_eq!(repo.stats().indexes_fetched, 1);
    let mtime = |path: &Path| {
        filetime::FileTime::from_last_modification_time(&fs::metadata(path).unwrap())
    };
    assert_eq!(mtime(&index_path), old);
    assert_eq!(mtime(&cache_path), old);
    assert_eq!(fs::read_to_string(&cache_path).unwrap(), cache_before);
}

#[test]
fn test_recent_verification_skips_root_fetch() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    serve_basic_tree(&transport);

    run(&mut repository(&transport, temp.path()));
    transport.reset_stats();

    let mut repo = repository(&transport, temp.path());
    run(&mut repo);

    assert_eq!(repo.failure(), ResultCode::NoError);
    assert!(transport.stats().requests.is_empty());
    assert_eq!(repo.last_checked_path(), "sub");
}

#[test]
fn test_changed_file_is_refetched() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    serve_basic_tree(&transport);
    run(&mut repository(&transport, temp.path()));

    let sub_index = index(&[file_record("b.txt", b"bravo")]);
    transport.insert(
        "/.dirindex",
        index(&[
            file_record("a.txt", b"alpha-4567"),
            dir_record("sub", &sub_index),
        ]),
    );
    transport.insert("/a.txt", &b"alpha-4567"[..]);
    transport.reset_stats();

    let config = RepoConfig::new(BASE_URL, temp.path()).with_recheck_timeout_enabled(false);
    let mut repo = repository_with(&transport, config);
    run(&mut repo);

    assert_eq!(repo.failure(), ResultCode::NoError);
    assert_eq!(fs::read(temp.path().join("a.txt")).unwrap(), b"alpha-4567");
    assert_eq!(transport.stats().request_count("/a.txt"), 1);
    assert_eq!(transport.stats().request_count("/sub/b.txt"), 0);
    assert_eq!(repo.stats().files_written, 1);
}

#[test]
fn test_local_edit_is_repaired() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    serve_basic_tree(&transport);
    run(&mut repository(&transport, temp.path()));

    // Different size, so the cached hash no longer applies
    fs::write(temp.path().join("a.txt"), b"tampered").unwrap();
    transport.reset_stats();

    let config = RepoConfig::new(BASE_URL, temp.path()).with_recheck_timeout_enabled(false);
    let mut repo = repository_with(&transport, config);
    run(&mut repo);

    assert_eq!(fs::read(temp.path().join("a.txt")).unwrap(), b"alpha-0123");
    assert_eq!(transport.stats().request_count("/a.txt"), 1);
}

#[test]
fn test_unlisted_local_entries_are_removed() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    serve_basic_tree(&transport);

    fs::write(temp.path().join("stale.txt"), b"old").unwrap();
    fs::create_dir_all(temp.path().join("gone/deeper")).unwrap();
    fs::write(temp.path().join("gone/deeper/x"), b"x").unwrap();
    fs::write(temp.path().join(".keep"), b"hidden").unwrap();

    let mut repo = repository(&transport, temp.path());
    run(&mut repo);

    assert_eq!(repo.failure(), ResultCode::NoError);
    assert!(!temp.path().join("stale.txt").exists());
    assert!(!temp.path().join("gone").exists());
    assert!(temp.path().join(".keep").exists());
}

#[test]
fn test_directory_replaced_by_file() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    serve_basic_tree(&transport);
    run(&mut repository(&transport, temp.path()));
    assert!(temp.path().join("sub").is_dir());

    transport.insert(
        "/.dirindex",
        index(&[
            file_record("a.txt", b"alpha-0123"),
            file_record("sub", b"now a file"),
        ]),
    );
    transport.insert("/sub", &b"now a file"[..]);

    let config = RepoConfig::new(BASE_URL, temp.path()).with_recheck_timeout_enabled(false);
    let mut repo = repository_with(&transport, config);
    run(&mut repo);

    assert_eq!(repo.failure(), ResultCode::NoError);
    assert!(temp.path().join("sub").is_file());
    assert_eq!(fs::read(temp.path().join("sub")).unwrap(), b"now a file");
}

#[test]
fn test_file_replaced_by_directory() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    serve_basic_tree(&transport);
    fs::write(temp.path().join("sub"), b"in the way").unwrap();

    let mut repo = repository(&transport, temp.path());
    run(&mut repo);

    assert_eq!(repo.failure(), ResultCode::NoError);
    assert_eq!(fs::read(temp.path().join("sub/b.txt")).unwrap(), b"bravo");
}

// ============================================================================
// Failures and retries
// ============================================================================

#[test]
fn test_missing_root_index() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();

    let mut repo = repository(&transport, temp.path());
    run(&mut repo);

    assert_eq!(repo.failure(), ResultCode::NotFound);
    assert!(!repo.is_doing_sync());
}

#[test]
fn test_malformed_root_index() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    transport.insert("/.dirindex", "f:a.txt:abc:3\n");

    let mut repo = repository(&transport, temp.path());
    run(&mut repo);

    assert_eq!(repo.failure(), ResultCode::SvnXml);
}

#[test]
fn test_missing_file_is_partial_update() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    transport.insert(
        "/.dirindex",
        index(&[
            file_record("a.txt", b"alpha"),
            file_record("missing.txt", b"never served"),
        ]),
    );
    transport.insert("/a.txt", &b"alpha"[..]);

    let mut repo = repository(&transport, temp.path());
    run(&mut repo);

    assert_eq!(repo.failure(), ResultCode::PartialUpdate);
    assert_eq!(repo.failures().len(), 1);
    assert_eq!(repo.failures()[0].path, "missing.txt");
    assert_eq!(repo.failures()[0].error, ResultCode::FileNotFound);
    assert!(temp.path().join("a.txt").is_file());
    assert!(!temp.path().join("missing.txt").exists());
}

#[test]
fn test_missing_subdirectory_index_is_isolated() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    serve_basic_tree(&transport);
    transport.remove("/sub/.dirindex");

    let mut repo = repository(&transport, temp.path());
    run(&mut repo);

    assert_eq!(repo.failure(), ResultCode::PartialUpdate);
    assert_eq!(repo.failures()[0].path, "sub");
    assert_eq!(repo.failures()[0].error, ResultCode::NotFound);
    assert!(temp.path().join("a.txt").is_file());
}

#[test]
fn test_server_errors_are_retried() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    serve_basic_tree(&transport);
    transport.fail_with_status("/a.txt", 503, 2);

    let mut repo = repository(&transport, temp.path());
    run(&mut repo);

    assert_eq!(repo.failure(), ResultCode::NoError);
    assert_eq!(transport.stats().request_count("/a.txt"), 3);
    assert_eq!(fs::read(temp.path().join("a.txt")).unwrap(), b"alpha-0123");
}

#[test]
fn test_retries_are_bounded() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    serve_basic_tree(&transport);
    transport.fail_with_status("/a.txt", 500, 10);

    let mut repo = repository(&transport, temp.path());
    run(&mut repo);

    assert_eq!(repo.failure(), ResultCode::PartialUpdate);
    assert_eq!(repo.failures()[0].error, ResultCode::Http);
    assert_eq!(transport.stats().request_count("/a.txt"), 3);
}

#[test]
fn test_client_errors_are_not_retried() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    serve_basic_tree(&transport);
    transport.fail_with_status("/a.txt", 403, 1);

    let mut repo = repository(&transport, temp.path());
    run(&mut repo);

    assert_eq!(repo.failure(), ResultCode::PartialUpdate);
    assert_eq!(repo.failures()[0].error, ResultCode::Http);
    assert_eq!(transport.stats().request_count("/a.txt"), 1);
}

#[test]
fn test_socket_error_is_retried() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    serve_basic_tree(&transport);
    transport.set_chunk_size(4);
    transport.fail_with_socket_error("/a.txt", 1);

    let mut repo = repository(&transport, temp.path());
    run(&mut repo);

    assert_eq!(repo.failure(), ResultCode::NoError);
    assert_eq!(transport.stats().request_count("/a.txt"), 2);
    assert_eq!(fs::read(temp.path().join("a.txt")).unwrap(), b"alpha-0123");
    // The partial first attempt is counted as extra scheduled bytes
    assert!(repo.bytes_to_download() > 15);
}

#[test]
fn test_corrupt_download_retried_once() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    serve_basic_tree(&transport);
    transport.corrupt("/a.txt", 1);

    let mut repo = repository(&transport, temp.path());
    run(&mut repo);

    assert_eq!(repo.failure(), ResultCode::NoError);
    assert_eq!(transport.stats().request_count("/a.txt"), 2);
    assert_eq!(fs::read(temp.path().join("a.txt")).unwrap(), b"alpha-0123");
}

#[test]
fn test_persistent_corruption_is_checksum_failure() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    serve_basic_tree(&transport);
    transport.corrupt("/a.txt", 10);

    let mut repo = repository(&transport, temp.path());
    run(&mut repo);

    assert_eq!(repo.failure(), ResultCode::PartialUpdate);
    assert_eq!(repo.failures()[0].path, "a.txt");
    assert_eq!(repo.failures()[0].error, ResultCode::Checksum);
    assert!(!temp.path().join("a.txt").exists());
    assert!(leftover_temp_files(temp.path()).is_empty());
}

#[test]
fn test_too_many_failures_aborts() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    let records: Vec<String> = (0..5)
        .map(|i| file_record(&format!("missing{}.txt", i), b"x"))
        .collect();
    transport.insert("/.dirindex", index(&records));

    let config = RepoConfig::new(BASE_URL, temp.path()).with_max_permitted_failures(1);
    let mut repo = repository_with(&transport, config);
    run(&mut repo);

    assert_eq!(repo.failure(), ResultCode::FileNotFound);
    assert_eq!(repo.failures().len(), 2);
    assert_eq!(repo.active_requests(), 0);
    assert_eq!(repo.queued_requests(), 0);
}

// ============================================================================
// Scheduling
// ============================================================================

#[test]
fn test_concurrency_limit_is_respected() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    transport.set_chunk_size(8);

    let mut records = Vec::new();
    for i in 0..12 {
        let name = format!("f{:02}.bin", i);
        let content = vec![i as u8; 64];
        records.push(file_record(&name, &content));
        transport.insert(format!("/{}", name), content);
    }
    transport.insert("/.dirindex", index(&records));

    let config = RepoConfig::new(BASE_URL, temp.path()).with_concurrency_limit(2);
    let mut repo = repository_with(&transport, config);
    repo.update();

    let mut peak_queued = 0;
    for _ in 0..10_000 {
        if !repo.is_doing_sync() {
            break;
        }
        repo.process();
        assert!(repo.active_requests() <= 2);
        peak_queued = peak_queued.max(repo.queued_requests());
    }

    assert_eq!(repo.failure(), ResultCode::NoError);
    assert!(transport.stats().max_active <= 2);
    assert!(peak_queued > 0);
    assert_eq!(repo.stats().files_written, 12);
}

#[test]
fn test_update_while_syncing_is_ignored() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    serve_basic_tree(&transport);

    let mut repo = repository(&transport, temp.path());
    repo.update();
    repo.process();
    repo.update();
    while repo.is_doing_sync() {
        repo.process();
    }

    assert_eq!(transport.stats().request_count("/.dirindex"), 1);
}

#[test]
fn test_cancel_stops_sync_and_cleans_up() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    transport.set_chunk_size(4);
    let big = vec![7u8; 4096];
    transport.insert("/.dirindex", index(&[file_record("big.bin", &big)]));
    transport.insert("/big.bin", big);

    let mut repo = repository(&transport, temp.path());
    repo.update();
    for _ in 0..10 {
        repo.process();
    }
    assert!(repo.is_doing_sync());

    repo.cancel();

    assert!(!repo.is_doing_sync());
    assert_eq!(repo.failure(), ResultCode::Cancelled);
    assert!(!temp.path().join("big.bin").exists());
    assert!(leftover_temp_files(temp.path()).is_empty());
    assert_eq!(transport.stats().active, 0);
}

// ============================================================================
// Archives, filters and installed copies
// ============================================================================

#[test]
fn test_tarball_is_extracted_in_place() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    let archive = tar_gz(&[
        ("pack/x.txt", b"x-ray"),
        ("pack/inner/y.txt", b"yankee"),
    ]);
    transport.insert(
        "/.dirindex",
        index(&[tarball_record("pack.tar.gz", &archive)]),
    );
    transport.insert("/pack.tar.gz", archive.clone());

    let mut repo = repository(&transport, temp.path());
    run(&mut repo);

    assert_eq!(repo.failure(), ResultCode::NoError);
    assert_eq!(fs::read(temp.path().join("pack/x.txt")).unwrap(), b"x-ray");
    assert_eq!(
        fs::read(temp.path().join("pack/inner/y.txt")).unwrap(),
        b"yankee"
    );
    assert!(!temp.path().join("pack.tar.gz").exists());
    assert!(leftover_temp_files(temp.path()).is_empty());
    assert_eq!(repo.stats().files_extracted, 2);
    assert_eq!(repo.bytes_to_extract(), 0);
    assert_eq!(repo.bytes_downloaded(), archive.len() as u64);

    // Installed archive is recognised on the next run
    transport.reset_stats();
    let config = RepoConfig::new(BASE_URL, temp.path()).with_recheck_timeout_enabled(false);
    let mut again = repository_with(&transport, config);
    run(&mut again);

    assert_eq!(again.failure(), ResultCode::NoError);
    assert_eq!(transport.stats().request_count("/pack.tar.gz"), 0);
    assert!(temp.path().join("pack/x.txt").is_file());
}

#[test]
fn test_record_padded_tarball_is_extracted() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    let archive = tar_gz_blocked(
        &[("roads/a.txt", b"alpha"), ("roads/b.txt", b"bravo")],
        10240,
    );
    transport.insert(
        "/.dirindex",
        index(&[tarball_record("roads.tgz", &archive)]),
    );
    transport.insert("/roads.tgz", archive);
    transport.set_chunk_size(1000);

    let mut repo = repository(&transport, temp.path());
    run(&mut repo);

    assert_eq!(repo.failure(), ResultCode::NoError);
    assert!(repo.failures().is_empty());
    assert_eq!(fs::read(temp.path().join("roads/a.txt")).unwrap(), b"alpha");
    assert_eq!(fs::read(temp.path().join("roads/b.txt")).unwrap(), b"bravo");
    assert_eq!(repo.stats().files_extracted, 2);
    assert!(!temp.path().join("roads.tgz").exists());
    assert!(leftover_temp_files(temp.path()).is_empty());
}

#[test]
fn test_broken_tarball_is_partial_update() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    let garbage = vec![0x5a; 2048];
    transport.insert(
        "/.dirindex",
        index(&[
            tarball_record("pack.tgz", &garbage),
            file_record("a.txt", b"alpha"),
        ]),
    );
    transport.insert("/pack.tgz", garbage);
    transport.insert("/a.txt", &b"alpha"[..]);

    let mut repo = repository(&transport, temp.path());
    run(&mut repo);

    assert_eq!(repo.failure(), ResultCode::PartialUpdate);
    assert_eq!(repo.failures()[0].path, "pack.tgz");
    assert_eq!(repo.failures()[0].error, ResultCode::Io);
    assert!(temp.path().join("a.txt").is_file());
    assert!(leftover_temp_files(temp.path()).is_empty());
}

#[test]
fn test_filter_skips_rejected_items() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    serve_basic_tree(&transport);

    let mut repo = repository(&transport, temp.path());
    repo.set_filter(|item| !(item.entry_type == EntryType::Directory && item.filename == "sub"));
    run(&mut repo);

    assert_eq!(repo.failure(), ResultCode::NoError);
    assert!(temp.path().join("a.txt").is_file());
    assert!(!temp.path().join("sub").exists());
    assert_eq!(transport.stats().request_count("/sub/.dirindex"), 0);
    assert_eq!(repo.stats().files_filtered, 1);
}

#[test]
fn test_filter_sees_planned_actions() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    serve_basic_tree(&transport);
    fs::write(temp.path().join("stale.txt"), b"old").unwrap();

    let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let log = seen.clone();
    let mut repo = repository(&transport, temp.path());
    repo.set_filter(move |item| {
        log.borrow_mut()
            .push((item.relative_path(), item.action));
        // Refuse deletions
        item.action != SyncAction::Delete
    });
    run(&mut repo);

    let seen = seen.borrow();
    assert!(seen.contains(&("stale.txt".to_string(), SyncAction::Delete)));
    assert!(seen.contains(&("a.txt".to_string(), SyncAction::Add)));
    assert!(seen.contains(&("sub/b.txt".to_string(), SyncAction::Add)));
    assert!(temp.path().join("stale.txt").exists());
}

#[test]
fn test_path_filter_limits_subtree() {
    let temp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    let keep_index = index(&[file_record("k.txt", b"kilo")]);
    let skip_index = index(&[file_record("s.txt", b"sierra")]);
    transport.insert(
        "/.dirindex",
        index(&[
            dir_record("keep", &keep_index),
            dir_record("skip", &skip_index),
        ]),
    );
    transport.insert("/keep/.dirindex", keep_index);
    transport.insert("/skip/.dirindex", skip_index);
    transport.insert("/keep/k.txt", &b"kilo"[..]);
    transport.insert("/skip/s.txt", &b"sierra"[..]);

    let mut repo = repository(&transport, temp.path());
    let filter = PathFilter::new().include("keep").into_filter_fn();
    repo.set_filter(filter);
    run(&mut repo);

    assert!(temp.path().join("keep/k.txt").is_file());
    assert!(!temp.path().join("skip").exists());
    assert_eq!(transport.stats().request_count("/skip/.dirindex"), 0);
}

#[test]
fn test_installed_copy_replaces_download() {
    let temp = TempDir::new().unwrap();
    let installed = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    serve_basic_tree(&transport);

    fs::write(installed.path().join("a.txt"), b"alpha-0123").unwrap();
    fs::create_dir_all(installed.path().join("sub")).unwrap();
    // Stale copy: hash differs, so it must be downloaded
    fs::write(installed.path().join("sub/b.txt"), b"BRAVO").unwrap();

    let config = RepoConfig::new(BASE_URL, temp.path()).with_installed_copy_path(installed.path());
    let mut repo = repository_with(&transport, config);
    run(&mut repo);

    assert_eq!(repo.failure(), ResultCode::NoError);
    assert_eq!(transport.stats().request_count("/a.txt"), 0);
    assert_eq!(transport.stats().request_count("/sub/b.txt"), 1);
    assert_eq!(fs::read(temp.path().join("a.txt")).unwrap(), b"alpha-0123");
    assert_eq!(fs::read(temp.path().join("sub/b.txt")).unwrap(), b"bravo");
    assert_eq!(repo.stats().files_copied, 1);
}
