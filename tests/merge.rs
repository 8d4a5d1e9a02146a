//! End-to-end merge behavior over real files.
//!
//! The io_uring variants run only where the kernel provides a ring;
//! restricted environments fall through to the blocking assertions.

use std::fs;
use std::path::PathBuf;

use tailmerge::{merge_files, Backend, MergeConfig, MergeStats};

fn fixture(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, bytes).expect("write fixture");
    path
}

fn config(backend: Backend, per_source_buffer: usize) -> MergeConfig {
    MergeConfig {
        per_source_buffer,
        backend,
        ..MergeConfig::default()
    }
}

fn merge_to_vec(paths: &[PathBuf], config: &MergeConfig) -> (Vec<u8>, MergeStats) {
    let mut out = Vec::new();
    let stats = merge_files(paths, &mut out, config).expect("merge");
    (out, stats)
}

fn header(first: bool, path: &PathBuf) -> Vec<u8> {
    let mut bytes = Vec::new();
    if !first {
        bytes.push(b'\n');
    }
    bytes.extend_from_slice(b">>> ");
    bytes.extend_from_slice(path.to_str().expect("utf8 path").as_bytes());
    bytes.push(b'\n');
    bytes
}

fn assert_conserved(stats: &MergeStats) {
    assert_eq!(
        stats.bytes_out,
        stats.bytes_in + stats.header_bytes + stats.appended_newlines,
        "conservation: {stats:?}"
    );
}

/// Straightforward in-memory reference merge: smallest head line wins, the
/// source that just emitted keeps winning ties, headers on run change, a
/// newline is appended after an unterminated final line.
fn reference_merge(inputs: &[(PathBuf, Vec<u8>)]) -> Vec<u8> {
    let mut heads: Vec<Vec<&[u8]>> = inputs
        .iter()
        .map(|(_, bytes)| {
            let mut lines = Vec::new();
            let mut rest: &[u8] = bytes;
            while !rest.is_empty() {
                match rest.iter().position(|&b| b == b'\n') {
                    Some(at) => {
                        lines.push(&rest[..at + 1]);
                        rest = &rest[at + 1..];
                    }
                    None => {
                        lines.push(rest);
                        rest = &[];
                    }
                }
            }
            lines.reverse();
            lines
        })
        .collect();

    let mut out = Vec::new();
    let mut last: Option<usize> = None;
    loop {
        let mut best: Option<usize> = None;
        for i in 0..heads.len() {
            let Some(&line) = heads[i].last() else { continue };
            match best {
                None => best = Some(i),
                Some(b) => {
                    let current = *heads[b].last().expect("candidate");
                    if line < current || (line == current && last == Some(i)) {
                        best = Some(i);
                    }
                }
            }
        }
        let Some(i) = best else { break };
        if last != Some(i) {
            out.extend(header(last.is_none(), &inputs[i].0));
            last = Some(i);
        }
        let line = heads[i].pop().expect("head");
        out.extend_from_slice(line);
        if line.last() != Some(&b'\n') {
            out.push(b'\n');
        }
    }
    out
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[test]
fn merges_the_documented_example() {
    let dir = tempfile::tempdir().unwrap();
    let foo = fixture(&dir, "foo.lst", b"1\n2\n3\n4\n5\n6\n");
    let bar = fixture(&dir, "bar.lst", b"4\n5\n6\n7\n8\n9\n");
    let paths = [foo.clone(), bar.clone()];

    let mut expected = Vec::new();
    expected.extend(header(true, &foo));
    expected.extend_from_slice(b"1\n2\n3\n4\n");
    expected.extend(header(false, &bar));
    expected.extend_from_slice(b"4\n5\n");
    expected.extend(header(false, &foo));
    expected.extend_from_slice(b"5\n6\n");
    expected.extend(header(false, &bar));
    expected.extend_from_slice(b"6\n7\n8\n9\n");

    let (out, stats) = merge_to_vec(&paths, &config(Backend::Blocking, 64 * 1024));
    assert_eq!(text(&out), text(&expected));
    assert_eq!(stats.lines, 12);
    assert_eq!(stats.bytes_in, 24);
    assert_conserved(&stats);

    // Auto picks the ring where available and falls back otherwise; either
    // way the bytes must match.
    let (auto_out, auto_stats) = merge_to_vec(&paths, &config(Backend::Auto, 64 * 1024));
    assert_eq!(text(&auto_out), text(&expected));
    assert_conserved(&auto_stats);
}

#[test]
fn uring_matches_blocking_on_the_documented_example() {
    let dir = tempfile::tempdir().unwrap();
    let foo = fixture(&dir, "foo.lst", b"1\n2\n3\n4\n5\n6\n");
    let bar = fixture(&dir, "bar.lst", b"4\n5\n6\n7\n8\n9\n");
    let paths = [foo, bar];

    let (blocking_out, _) = merge_to_vec(&paths, &config(Backend::Blocking, 64 * 1024));
    let mut uring_out = Vec::new();
    match merge_files(&paths, &mut uring_out, &config(Backend::Uring, 64 * 1024)) {
        Ok(stats) => {
            assert_eq!(text(&uring_out), text(&blocking_out));
            assert_conserved(&stats);
        }
        Err(err) if err.is_ring_unavailable() => {}
        Err(err) => panic!("uring merge failed: {err}"),
    }
}

#[test]
fn single_source_passes_through() {
    let dir = tempfile::tempdir().unwrap();
    let only = fixture(&dir, "only.log", b"alpha\nbravo\ncharlie\n");
    let (out, stats) = merge_to_vec(&[only.clone()], &config(Backend::Blocking, 64 * 1024));

    let mut expected = header(true, &only);
    expected.extend_from_slice(b"alpha\nbravo\ncharlie\n");
    assert_eq!(text(&out), text(&expected));
    assert_eq!(stats.lines, 3);
    assert_conserved(&stats);
}

#[test]
fn empty_sources_produce_no_header() {
    let dir = tempfile::tempdir().unwrap();
    let empty = fixture(&dir, "empty.log", b"");
    let full = fixture(&dir, "full.log", b"data\n");

    let (out, stats) = merge_to_vec(
        &[empty.clone(), full.clone()],
        &config(Backend::Blocking, 64 * 1024),
    );
    let mut expected = header(true, &full);
    expected.extend_from_slice(b"data\n");
    assert_eq!(text(&out), text(&expected));
    assert_conserved(&stats);

    let (out, stats) = merge_to_vec(&[empty], &config(Backend::Blocking, 64 * 1024));
    assert!(out.is_empty());
    assert_eq!(stats.lines, 0);
    assert_conserved(&stats);
}

#[test]
fn missing_terminator_gets_a_newline() {
    let dir = tempfile::tempdir().unwrap();
    // "tail" sorts after "head\n", so the unterminated line is emitted last
    // in one run and still receives its newline at end of output.
    let a = fixture(&dir, "a.log", b"head\ntail");
    let b = fixture(&dir, "b.log", b"middle\n");

    let (out, stats) = merge_to_vec(&[a.clone(), b.clone()], &config(Backend::Blocking, 64 * 1024));
    let mut expected = header(true, &a);
    expected.extend_from_slice(b"head\n");
    expected.extend(header(false, &b));
    expected.extend_from_slice(b"middle\n");
    expected.extend(header(false, &a));
    expected.extend_from_slice(b"tail\n");
    assert_eq!(text(&out), text(&expected));
    assert_eq!(stats.appended_newlines, 1);
    assert_conserved(&stats);
}

#[test]
fn unterminated_line_before_another_header() {
    let dir = tempfile::tempdir().unwrap();
    let a = fixture(&dir, "a.log", b"alpha");
    let b = fixture(&dir, "b.log", b"zulu\n");

    let (out, stats) = merge_to_vec(&[a.clone(), b.clone()], &config(Backend::Blocking, 64 * 1024));
    let mut expected = header(true, &a);
    expected.extend_from_slice(b"alpha\n");
    expected.extend(header(false, &b));
    expected.extend_from_slice(b"zulu\n");
    assert_eq!(text(&out), text(&expected));
    assert_eq!(stats.appended_newlines, 1);
    assert_conserved(&stats);
}

#[test]
fn equal_lines_keep_argument_order() {
    let dir = tempfile::tempdir().unwrap();
    let first = fixture(&dir, "first.log", b"x\n");
    let second = fixture(&dir, "second.log", b"x\n");

    let (out, stats) = merge_to_vec(
        &[first.clone(), second.clone()],
        &config(Backend::Blocking, 64 * 1024),
    );
    let mut expected = header(true, &first);
    expected.extend_from_slice(b"x\n");
    expected.extend(header(false, &second));
    expected.extend_from_slice(b"x\n");
    assert_eq!(text(&out), text(&expected));
    assert_conserved(&stats);
}

#[test]
fn equal_keys_extend_the_current_run() {
    let dir = tempfile::tempdir().unwrap();
    let a = fixture(&dir, "a.log", b"b\nc\n");
    let b = fixture(&dir, "b.log", b"a\nc\nd\n");

    // After b emits "a", a's "b" wins; then both hold "c": a keeps its run.
    let (out, _) = merge_to_vec(&[a.clone(), b.clone()], &config(Backend::Blocking, 64 * 1024));
    let mut expected = header(true, &b);
    expected.extend_from_slice(b"a\n");
    expected.extend(header(false, &a));
    expected.extend_from_slice(b"b\nc\n");
    expected.extend(header(false, &b));
    expected.extend_from_slice(b"c\nd\n");
    assert_eq!(text(&out), text(&expected));
}

#[test]
fn tiny_buffers_carry_and_stream() {
    let dir = tempfile::tempdir().unwrap();
    // Buffer is 16 bytes per bucket: "m..." spans several loans, other
    // lines straddle loan boundaries and exercise the carry.
    let a_bytes: Vec<u8> =
        b"alpha 1\nmmmmmmmmmmmmmmmmmmmmmmmmmmmmmmmmmmmmmmmm tail\nzeta 9\n".to_vec();
    let b_bytes: Vec<u8> = b"bravo 2\ncharlie 3\ndelta 4\necho 5\nyankee 8\n".to_vec();
    let a = fixture(&dir, "a.log", &a_bytes);
    let b = fixture(&dir, "b.log", &b_bytes);
    let inputs = vec![(a.clone(), a_bytes), (b.clone(), b_bytes)];
    let expected = reference_merge(&inputs);

    let paths = [a, b];
    let (out, stats) = merge_to_vec(&paths, &config(Backend::Blocking, 16));
    assert_eq!(text(&out), text(&expected));
    assert_conserved(&stats);

    let mut uring_out = Vec::new();
    match merge_files(&paths, &mut uring_out, &config(Backend::Uring, 16)) {
        Ok(uring_stats) => {
            assert_eq!(text(&uring_out), text(&expected));
            assert_conserved(&uring_stats);
        }
        Err(err) if err.is_ring_unavailable() => {}
        Err(err) => panic!("uring merge failed: {err}"),
    }
}

#[test]
fn long_final_line_without_terminator_streams() {
    let dir = tempfile::tempdir().unwrap();
    let long: Vec<u8> = {
        let mut v = b"start\n".to_vec();
        v.extend_from_slice(&b"q".repeat(100));
        v
    };
    let a = fixture(&dir, "a.log", &long);
    let inputs = vec![(a.clone(), long)];
    let expected = reference_merge(&inputs);

    let (out, stats) = merge_to_vec(&[a], &config(Backend::Blocking, 16));
    assert_eq!(text(&out), text(&expected));
    assert_eq!(stats.appended_newlines, 1);
    assert_conserved(&stats);
}

#[test]
fn many_sources_round_robin() {
    let dir = tempfile::tempdir().unwrap();
    let mut inputs: Vec<(PathBuf, Vec<u8>)> = Vec::new();
    for i in 0..8 {
        let mut bytes = Vec::new();
        for line in 0..20 {
            // Distinct keys everywhere; sorted within each source.
            bytes.extend_from_slice(format!("{line:03} source {i}\n").as_bytes());
        }
        let path = fixture(&dir, &format!("src{i}.log"), &bytes);
        inputs.push((path, bytes));
    }
    let expected = reference_merge(&inputs);
    let paths: Vec<PathBuf> = inputs.iter().map(|(p, _)| p.clone()).collect();

    for per_source in [32, 64 * 1024] {
        let (out, stats) = merge_to_vec(&paths, &config(Backend::Blocking, per_source));
        assert_eq!(text(&out), text(&expected), "buffer {per_source}");
        assert_eq!(stats.lines, 160);
        assert_conserved(&stats);
    }

    let mut uring_out = Vec::new();
    match merge_files(&paths, &mut uring_out, &config(Backend::Uring, 64)) {
        Ok(stats) => {
            assert_eq!(text(&uring_out), text(&expected));
            assert_conserved(&stats);
        }
        Err(err) if err.is_ring_unavailable() => {}
        Err(err) => panic!("uring merge failed: {err}"),
    }
}

#[test]
fn missing_file_reports_open_error() {
    let dir = tempfile::tempdir().unwrap();
    let present = fixture(&dir, "present.log", b"ok\n");
    let missing = dir.path().join("not-there.log");

    let mut out = Vec::new();
    let err = merge_files(
        &[present, missing],
        &mut out,
        &config(Backend::Blocking, 64 * 1024),
    )
    .expect_err("open must fail");
    assert_eq!(err.exit_code(), tailmerge::error::EX_NOINPUT);
    assert!(err.to_string().starts_with("Failed to open "), "{err}");
}
