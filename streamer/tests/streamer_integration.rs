//! End-to-end tests through the `Streamer` facade over real files.

use std::fs;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use streamer::backend::ArchiveIndex;
use streamer::request::{CompressionCodec, CompressionInfo};
use streamer::{
    FileRange, ReportKind, RequestError, RequestOutput, RequestPath, RequestStatus,
    StatisticValue, Streamer, StreamerConfig, SubmitOptions,
};
use tempfile::TempDir;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

fn local_streamer(temp: &TempDir) -> Streamer {
    Streamer::open_local(
        &StreamerConfig::default(),
        temp.path(),
        Arc::new(ArchiveIndex::new()),
    )
    .unwrap()
}

#[test]
fn test_reads_from_local_files() {
    let temp = TempDir::new().unwrap();
    let data = pattern(10_000);
    fs::create_dir_all(temp.path().join("maps")).unwrap();
    fs::write(temp.path().join("maps/level1.bin"), &data).unwrap();
    let streamer = local_streamer(&temp);

    let range = streamer
        .read("maps/level1.bin", 1000, 500, SubmitOptions::default())
        .unwrap();
    let whole = streamer
        .read_whole_file("maps\\level1.bin", SubmitOptions::default())
        .unwrap();
    let into = streamer
        .read_into("maps/level1.bin", 9990, vec![0; 10], SubmitOptions::default())
        .unwrap();

    assert_eq!(range.wait_blocking().unwrap(), RequestStatus::Completed);
    assert_eq!(range.take_data(), Some(data[1000..1500].to_vec()));
    assert_eq!(whole.wait_blocking().unwrap(), RequestStatus::Completed);
    assert_eq!(whole.take_data(), Some(data.clone()));
    assert_eq!(into.wait_blocking().unwrap(), RequestStatus::Completed);
    assert_eq!(into.take_data(), Some(data[9990..].to_vec()));
}

#[test]
fn test_queries_and_missing_files() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("present.bin"), pattern(123)).unwrap();
    let streamer = local_streamer(&temp);

    let exists = streamer.file_exists("present.bin", SubmitOptions::default()).unwrap();
    let absent = streamer.file_exists("absent.bin", SubmitOptions::default()).unwrap();
    let metadata = streamer.file_metadata("present.bin", SubmitOptions::default()).unwrap();
    let missing = streamer.read("absent.bin", 0, 8, SubmitOptions::default()).unwrap();

    exists.wait_blocking().unwrap();
    absent.wait_blocking().unwrap();
    metadata.wait_blocking().unwrap();
    assert_eq!(exists.with_output(RequestOutput::exists).flatten(), Some(true));
    assert_eq!(absent.with_output(RequestOutput::exists).flatten(), Some(false));
    assert_eq!(metadata.with_output(RequestOutput::file_size).flatten(), Some(123));

    assert_eq!(missing.wait_blocking().unwrap(), RequestStatus::Failed);
    assert!(matches!(missing.error(), Some(RequestError::NotFound { .. })));
}

#[test]
fn test_short_file_read_fails() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("small.bin"), pattern(10)).unwrap();
    let streamer = local_streamer(&temp);

    let handle = streamer.read("small.bin", 5, 20, SubmitOptions::default()).unwrap();

    assert_eq!(handle.wait_blocking().unwrap(), RequestStatus::Failed);
    assert!(matches!(
        handle.error(),
        Some(RequestError::ShortRead { expected: 20, actual: 5, .. })
    ));
}

#[test]
fn test_archived_entry_through_facade() {
    let temp = TempDir::new().unwrap();
    let entry = pattern(4096);
    let mut container = vec![0u8; 100];
    container.extend_from_slice(&entry);
    fs::write(temp.path().join("bundle.pak"), &container).unwrap();

    let index = Arc::new(ArchiveIndex::new());
    index.insert(
        "sounds/wind.raw",
        CompressionInfo::single_block(
            RequestPath::new("bundle.pak"),
            CompressionCodec::Stored,
            100,
            entry.len() as u64,
            entry.len() as u64,
        ),
    );
    let streamer = Streamer::open_local(&StreamerConfig::default(), temp.path(), index).unwrap();

    let ranges = streamer
        .read_ranges(
            "sounds/wind.raw",
            &[FileRange::new(4000, 96), FileRange::new(0, 4)],
            SubmitOptions::default(),
        )
        .unwrap();

    assert_eq!(ranges.wait_blocking().unwrap(), RequestStatus::Completed);
    let mut expected = entry[4000..].to_vec();
    expected.extend_from_slice(&entry[..4]);
    assert_eq!(ranges.take_data(), Some(expected));
}

#[test]
fn test_callbacks_and_wait_group() {
    let temp = TempDir::new().unwrap();
    for name in ["a.bin", "b.bin", "c.bin"] {
        fs::write(temp.path().join(name), pattern(256)).unwrap();
    }
    let streamer = local_streamer(&temp);
    let (tx, rx) = mpsc::channel();

    let handles: Vec<_> = ["a.bin", "b.bin", "c.bin"]
        .into_iter()
        .map(|name| {
            let tx = tx.clone();
            let options = SubmitOptions::default().with_callback(move |handle| {
                let _ = tx.send(handle.status());
            });
            streamer.read(name, 0, 128, options).unwrap()
        })
        .collect();
    let group = streamer.wait_group(&handles, SubmitOptions::default()).unwrap();

    assert_eq!(group.wait_blocking().unwrap(), RequestStatus::Completed);
    assert!(handles.iter().all(|h| h.is_done()));
    for _ in 0..3 {
        let status = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(status, RequestStatus::Completed);
    }
}

#[test]
fn test_report_after_reads() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("a.bin"), pattern(1024)).unwrap();
    let streamer = local_streamer(&temp);

    for _ in 0..2 {
        let handle = streamer.read("a.bin", 0, 512, SubmitOptions::default()).unwrap();
        handle.wait_blocking().unwrap();
    }
    let mut request = streamer.create_request();
    request.report(ReportKind::Statistics);
    let report = streamer.start_and_wait(request).unwrap();

    let output = report.take_output().unwrap();
    let report = output.report().unwrap();
    assert_eq!(report.get("cache", "hits"), Some(&StatisticValue::Count(1)));
    assert_eq!(report.get("device", "reads_completed"), Some(&StatisticValue::Count(1)));
}

#[test]
fn test_loads_config_file() {
    let temp = TempDir::new().unwrap();
    let config_path = temp.path().join("streamer.ini");
    fs::write(&config_path, "[cache]\nenabled = false\n[device]\nmax_concurrent_reads = 2\n").unwrap();
    fs::write(temp.path().join("a.bin"), pattern(64)).unwrap();

    let streamer =
        Streamer::from_config_file(&config_path, temp.path(), Arc::new(ArchiveIndex::new())).unwrap();
    let mut request = streamer.create_request();
    request.report(ReportKind::Configuration);
    let report = streamer.start_and_wait(request).unwrap();

    let stack = report
        .with_output(|output| {
            output
                .report()
                .and_then(|r| r.get("scheduler", "stack").cloned())
        })
        .flatten();
    assert_eq!(
        stack,
        Some(StatisticValue::Text("archive > compression > device".to_string()))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_wait_on_tokio_jobs() {
    let temp = TempDir::new().unwrap();
    let data = pattern(50_000);
    fs::write(temp.path().join("big.bin"), &data).unwrap();
    let streamer = local_streamer(&temp);

    let handles: Vec<_> = (0..10u64)
        .map(|i| {
            streamer
                .read("big.bin", i * 5000, 5000, SubmitOptions::default())
                .unwrap()
        })
        .collect();

    for (i, handle) in handles.iter().enumerate() {
        assert_eq!(handle.wait().await, RequestStatus::Completed);
        let start = i * 5000;
        assert_eq!(handle.take_data(), Some(data[start..start + 5000].to_vec()));
    }
}
