//! Background prefetch of two mounted layers alongside foreground reads.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::cast_possible_truncation)]

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use lazylayer_common::config::BackgroundFetchConfig;
use lazylayer_common::metrics::{AtomicMetrics, MetricsSink};
use lazylayer_common::types::SpanState;
use lazylayer_fetch::{BackgroundFetcher, SequentialResolver};
use lazylayer_span::cache::DirectoryCache;
use lazylayer_span::reader::FileReader;
use lazylayer_span::{SpanManager, SpanManagerBuilder};
use tokio_util::sync::CancellationToken;

fn write_layer(path: &Path, seed: usize) -> Vec<u8> {
    let file = File::create(path).expect("failed to create layer");
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for i in 0..30 {
        let data: Vec<u8> = (0..9_000)
            .map(|n| b"0123456789abcdef\n"[(n * (i + seed) + n / 7) % 17])
            .collect();
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("srv/app/{i}.dat"), &data[..])
            .expect("failed to append data");
    }
    let encoder = builder.into_inner().expect("failed to finish tar");
    let _ = encoder.finish().expect("failed to finish gzip");

    let mut plain = Vec::new();
    let _ = GzDecoder::new(File::open(path).expect("open"))
        .read_to_end(&mut plain)
        .expect("reference decode");
    plain
}

fn mount(dir: &Path, name: &str, seed: usize) -> (Arc<SpanManager>, Vec<u8>) {
    let layer = dir.join(format!("{name}.tar.gz"));
    let plain = write_layer(&layer, seed);
    let (index, manifest) = lazylayer_zinfo::index_file(&layer, 32 * 1024).expect("index failed");
    let manager = SpanManagerBuilder::from_manifest(
        Arc::new(index),
        &manifest,
        Arc::new(FileReader::open(&layer).expect("open layer")),
    )
    .expect("manifest matches")
    .cache(Arc::new(
        DirectoryCache::open(dir.join(format!("{name}-cache"))).expect("open cache"),
    ))
    .build()
    .expect("manager");
    (Arc::new(manager), plain)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_fetch_completes_every_mounted_layer() {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    let (base, base_plain) = mount(dir.path(), "base", 1);
    let (app, app_plain) = mount(dir.path(), "app", 5);
    assert!(base.span_count() > 1);

    let metrics = Arc::new(AtomicMetrics::new());
    let config = BackgroundFetchConfig {
        fetch_period_ms: 2,
        silence_period_ms: 20,
        max_queue_size: 8,
        emit_metric_period_ms: 5,
    };
    let fetcher = Arc::new(
        BackgroundFetcher::with_metrics(config, Arc::clone(&metrics) as Arc<dyn MetricsSink>)
            .expect("fetcher"),
    );
    let token = CancellationToken::new();
    let run = {
        let fetcher = Arc::clone(&fetcher);
        let token = token.clone();
        tokio::spawn(async move { fetcher.run(token).await })
    };

    fetcher
        .add(Arc::new(SequentialResolver::new(Arc::clone(&base))))
        .await
        .expect("add base");
    fetcher.pause();
    fetcher
        .add(Arc::new(SequentialResolver::new(Arc::clone(&app))))
        .await
        .expect("add app");

    // Foreground reads race the background steps on the same spans.
    let tail = app.uncompressed_size() - 1000;
    let read = app
        .get_contents(tail, app.uncompressed_size())
        .await
        .expect("foreground read")
        .into_vec();
    assert_eq!(read, &app_plain[tail as usize..]);

    tokio::time::timeout(Duration::from_secs(20), async {
        while !(base.pending_spans().is_empty() && app.pending_spans().is_empty()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("prefetch did not finish");
    token.cancel();
    run.await.expect("join").expect("run");

    for (manager, plain) in [(&base, &base_plain), (&app, &app_plain)] {
        let all = manager
            .get_contents(0, manager.uncompressed_size())
            .await
            .expect("contents")
            .into_vec();
        assert_eq!(&all, plain);
        for id in 0..manager.span_count() {
            let id = lazylayer_common::types::SpanId::new(id as u32);
            assert_eq!(
                manager.span_state(id).expect("state"),
                SpanState::Uncompressed
            );
        }
    }
    let snapshot = metrics.snapshot();
    assert!(snapshot.background_fetches > 0);
    assert_eq!(snapshot.background_failures, 0);
}
