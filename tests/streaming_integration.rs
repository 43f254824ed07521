//! End-to-end streaming tests over the public API.
//!
//! A deterministic sim engine stands in for the real swarm: tests publish
//! metadata, finish pieces and emit stats by hand, while reads go through
//! the full downloader → session → input path against a real save file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use spindrift::config::SpindriftConfig;
use spindrift::engine::sim::{SimEngine, SimTorrentHandle};
use spindrift::engine::{
    TorrentDescriptor, TorrentFileInfo, TorrentSource, TorrentStats,
};
use spindrift::input::InputError;
use spindrift::session::DownloadSession;
use spindrift::{Downloader, SpindriftError};
use tempfile::TempDir;

const FILE_NAME: &str = "movie.mkv";

/// Deterministic save-file contents.
fn file_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn single_file_descriptor(num_pieces: u32, piece_length: u64, last_piece_len: u64) -> TorrentDescriptor {
    let total = u64::from(num_pieces - 1) * piece_length + last_piece_len;
    TorrentDescriptor {
        name: "movie".to_string(),
        num_pieces,
        piece_length,
        last_piece_len,
        files: vec![TorrentFileInfo {
            name: FILE_NAME.to_string(),
            path: PathBuf::from(FILE_NAME),
            len: total,
        }],
    }
}

struct StreamFixture {
    engine: SimEngine,
    downloader: Downloader<SimEngine>,
    save_dir: TempDir,
}

impl StreamFixture {
    fn new() -> Self {
        let engine = SimEngine::new();
        let save_dir = TempDir::new().expect("temp save dir");
        let downloader = Downloader::new(
            engine.clone(),
            save_dir.path().to_path_buf(),
            SpindriftConfig::default(),
        );
        Self {
            engine,
            downloader,
            save_dir,
        }
    }

    /// Adds a torrent, writes its save file and publishes metadata.
    async fn start_torrent(
        &self,
        descriptor: TorrentDescriptor,
        resume_path: Option<PathBuf>,
    ) -> Arc<DownloadSession<SimTorrentHandle>> {
        let session = self
            .downloader
            .add_torrent(
                &TorrentSource::Magnet(
                    "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567".to_string(),
                ),
                resume_path,
            )
            .expect("add torrent");

        let total = descriptor.total_piece_bytes() as usize;
        std::fs::write(self.save_dir.path().join(FILE_NAME), file_bytes(total))
            .expect("write save file");

        self.engine.publish_metadata(session.id(), descriptor);
        wait_until(|| session.descriptor().is_some()).await;
        session
    }

    /// Finishes a piece and waits until the session has applied it.
    async fn finish_piece(&self, session: &Arc<DownloadSession<SimTorrentHandle>>, index: u32) {
        self.engine.finish_piece(session.id(), index);
        let session = Arc::clone(session);
        wait_until(move || {
            session
                .pieces()
                .and_then(|pieces| pieces.by_index(index).map(|piece| piece.is_finished()))
                .unwrap_or(false)
        })
        .await;
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_aligned_read_from_single_finished_piece() {
    let fixture = StreamFixture::new();
    let session = fixture
        .start_torrent(single_file_descriptor(1000, 1024, 1024), None)
        .await;
    fixture.finish_piece(&session, 0).await;

    let mut input = session.open_input(0).await.expect("open input");
    assert_eq!(input.len(), 1_024_000);

    input.seek(0).unwrap();
    let mut out = vec![0u8; 512];
    let count = input.read(&mut out).await.expect("read");

    assert_eq!(count, 512);
    assert_eq!(out, file_bytes(512));
    // One disk read, starting at zero, covering exactly the finished piece.
    assert_eq!(input.disk_reads(), 1);
    assert_eq!(input.buffered_range(), Some((0, 1024)));
}

#[tokio::test]
async fn test_read_waits_for_piece_and_hints_deadline() {
    let fixture = StreamFixture::new();
    let session = fixture
        .start_torrent(single_file_descriptor(4, 1024, 1024), None)
        .await;

    let mut input = session.open_input(0).await.expect("open input");
    input.seek(2048).unwrap();

    let id = session.id();
    let reader = tokio::spawn(async move {
        let mut out = vec![0u8; 256];
        let count = input.read(&mut out).await?;
        out.truncate(count);
        Ok::<_, InputError>(out)
    });

    // The read must be parked on piece 2, with exactly one deadline hint.
    wait_until({
        let engine = fixture.engine.clone();
        move || !engine.deadline_requests(id).is_empty()
    })
    .await;
    assert_eq!(
        fixture.engine.deadline_requests(id),
        vec![(2, Duration::ZERO)]
    );
    assert!(!reader.is_finished());

    fixture.finish_piece(&session, 2).await;

    let bytes = tokio::time::timeout(Duration::from_secs(2), reader)
        .await
        .expect("read did not resume")
        .expect("reader panicked")
        .expect("read failed");
    assert_eq!(bytes.len(), 256);
    assert_eq!(bytes, file_bytes(4096)[2048..2304].to_vec());
    assert_eq!(fixture.engine.deadline_requests(id).len(), 1);
}

#[tokio::test]
async fn test_cancelled_read_leaves_position_untouched() {
    let fixture = StreamFixture::new();
    let session = fixture
        .start_torrent(single_file_descriptor(4, 1024, 1024), None)
        .await;

    let mut input = session.open_input(0).await.expect("open input");
    input.seek(100).unwrap();

    let cancel = input.cancel_handle();
    let reader = tokio::spawn(async move {
        let mut out = vec![0u8; 64];
        let result = input.read(&mut out).await;
        (input, result)
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let (input, result) = tokio::time::timeout(Duration::from_secs(2), reader)
        .await
        .expect("cancel did not resolve the read")
        .expect("reader panicked");
    assert!(matches!(result, Err(InputError::Cancelled { piece_index: 0 })));
    assert_eq!(input.position(), 100);
    assert_eq!(input.buffered_range(), None);
}

#[tokio::test]
async fn test_seek_into_buffered_window_costs_no_io() {
    let fixture = StreamFixture::new();
    let session = fixture
        .start_torrent(single_file_descriptor(8, 512, 512), None)
        .await;
    for index in 0..4 {
        fixture.finish_piece(&session, index).await;
    }

    let mut input = session.open_input(0).await.expect("open input");
    input.seek(600).unwrap();
    let mut out = vec![0u8; 100];
    input.read(&mut out).await.unwrap();

    // Pieces 0..4 are finished: one read coalesces 0..2048.
    assert_eq!(input.buffered_range(), Some((0, 2048)));
    assert_eq!(input.disk_reads(), 1);

    input.seek(0).unwrap();
    let mut all = vec![0u8; 2048];
    let mut read_total = 0;
    while read_total < all.len() {
        let count = input.read(&mut all[read_total..]).await.unwrap();
        assert!(count > 0);
        read_total += count;
    }
    assert_eq!(input.disk_reads(), 1);
    assert_eq!(all, file_bytes(4096)[..2048].to_vec());
}

#[tokio::test]
async fn test_resume_data_round_trip() {
    let fixture = StreamFixture::new();
    let resume_path = fixture.save_dir.path().join("movie.resume");

    let session = fixture
        .start_torrent(
            single_file_descriptor(4, 1024, 1024),
            Some(resume_path.clone()),
        )
        .await;

    fixture
        .engine
        .set_resume_blob(session.id(), b"fastresume-v1".to_vec());
    session.request_save_resume();
    wait_until({
        let resume_path = resume_path.clone();
        move || resume_path.exists()
    })
    .await;
    assert_eq!(std::fs::read(&resume_path).unwrap(), b"fastresume-v1");

    // A later add with the same path hands the bytes back to the engine.
    let second = fixture
        .downloader
        .add_torrent(
            &TorrentSource::TorrentFile(PathBuf::from("/tmp/movie.torrent")),
            Some(resume_path),
        )
        .expect("second torrent");
    assert_eq!(
        fixture.engine.resume_source(second.id()),
        Some(b"fastresume-v1".to_vec())
    );
}

#[tokio::test]
async fn test_stats_stream_follows_engine_order() {
    let fixture = StreamFixture::new();
    let session = fixture
        .start_torrent(single_file_descriptor(4, 1024, 1024), None)
        .await;

    let mut stats = session.stats();
    for done in [1024u64, 2048, 4096] {
        fixture.engine.publish_stats(
            session.id(),
            TorrentStats {
                total: 4096,
                total_done: done,
                progress: done as f32 / 4096.0,
                ..TorrentStats::default()
            },
        );
    }

    for expected in [1024u64, 2048, 4096] {
        let snapshot = tokio::time::timeout(Duration::from_secs(2), stats.recv())
            .await
            .expect("stats not delivered")
            .expect("stats stream closed");
        assert_eq!(snapshot.total_done, expected);
    }
}

#[tokio::test]
async fn test_released_session_ignores_late_alerts() {
    let fixture = StreamFixture::new();
    let session = fixture
        .start_torrent(single_file_descriptor(4, 1024, 1024), None)
        .await;
    let id = session.id();

    fixture.downloader.release(&session);
    assert!(fixture.downloader.session(id).is_none());

    // Late engine callbacks for the released handle are dropped silently.
    fixture.engine.finish_piece(id, 0);
    fixture.engine.publish_stats(id, TorrentStats::default());

    let mut called = false;
    fixture
        .downloader
        .dispatcher()
        .dispatch_to_session(id, |_| called = true);
    assert!(!called);
}

#[tokio::test]
async fn test_open_input_before_metadata_fails() {
    let fixture = StreamFixture::new();
    let session = fixture
        .downloader
        .add_torrent(
            &TorrentSource::Magnet(
                "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567".to_string(),
            ),
            None,
        )
        .expect("add torrent");

    let result = session.open_input(0).await;
    assert!(matches!(
        result,
        Err(SpindriftError::Engine(
            spindrift::EngineError::MetadataNotReady
        ))
    ));
}
