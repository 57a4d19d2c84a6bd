//! Lazy reads of files inside a gzip-compressed tar layer.
//!
//! The layer is indexed and its artifacts written to disk, then reloaded
//! the way a mount would: the index artifact, the manifest, a file reader
//! over the compressed layer and a directory cache.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::cast_possible_truncation)]

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use lazylayer_common::types::{SpanId, SpanState};
use lazylayer_span::cache::DirectoryCache;
use lazylayer_span::reader::FileReader;
use lazylayer_span::SpanManagerBuilder;
use lazylayer_zinfo::{GzipIndex, LayerManifest, manifest};

fn file_body(i: usize) -> Vec<u8> {
    (0..6_000 + i * 517)
        .map(|n| b"abcdefghijklmnopqrstuvwxyz0123456789\n"[(n * (i + 3)) % 37])
        .collect()
}

fn write_layer(path: &Path) {
    let file = File::create(path).expect("failed to create layer");
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for i in 0..60 {
        let data = file_body(i);
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("etc/conf.d/{i:02}.conf"), &data[..])
            .expect("failed to append data");
    }
    let encoder = builder.into_inner().expect("failed to finish tar");
    let _ = encoder.finish().expect("failed to finish gzip");
}

/// Name, data offset and size of every regular file in the tar stream.
fn tar_entries(plain: &[u8]) -> Vec<(String, u64, u64)> {
    let mut archive = tar::Archive::new(plain);
    archive
        .entries()
        .expect("entries")
        .map(|entry| {
            let entry = entry.expect("entry");
            let name = entry.path().expect("path").display().to_string();
            (name, entry.raw_file_position(), entry.size())
        })
        .collect()
}

#[tokio::test]
async fn files_read_through_span_manager_match_the_archive() {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    let layer_path = dir.path().join("layer.tar.gz");
    write_layer(&layer_path);

    let (index, layer_manifest) =
        lazylayer_zinfo::index_file(&layer_path, 64 * 1024).expect("index failed");
    let index_path = dir.path().join("layer.zinfo");
    index.save(&index_path).expect("save index");
    layer_manifest
        .save(&manifest::manifest_path(&index_path))
        .expect("save manifest");

    let index = GzipIndex::load(&index_path).expect("load index");
    let layer_manifest =
        LayerManifest::load(&manifest::manifest_path(&index_path)).expect("load manifest");
    let reader = FileReader::open(&layer_path).expect("open layer");
    let cache = DirectoryCache::open(dir.path().join("cache")).expect("open cache");
    let manager = SpanManagerBuilder::from_manifest(Arc::new(index), &layer_manifest, Arc::new(reader))
        .expect("manifest matches")
        .cache(Arc::new(cache))
        .build()
        .expect("manager");
    assert!(manager.span_count() > 1);

    let mut plain = Vec::new();
    let _ = GzDecoder::new(File::open(&layer_path).expect("open"))
        .read_to_end(&mut plain)
        .expect("reference decode");
    assert_eq!(manager.uncompressed_size(), plain.len() as u64);

    // Read files back to front so spans are requested out of order.
    let entries = tar_entries(&plain);
    assert_eq!(entries.len(), 60);
    for (i, (name, offset, size)) in entries.iter().enumerate().rev() {
        let mut data = Vec::new();
        let _ = manager
            .get_contents(*offset, offset + size)
            .await
            .expect("contents")
            .read_to_end(&mut data)
            .expect("read");
        assert_eq!(data, file_body(i), "{name}");
    }

    for id in 0..manager.span_count() {
        let id = SpanId::new(id as u32);
        assert_eq!(
            manager.span_state(id).expect("state"),
            SpanState::Uncompressed
        );
        assert!(dir.path().join("cache").join(id.cache_key()).is_file());
    }
    manager.close().expect("close");
}

#[tokio::test]
async fn prefetched_spans_are_decompressed_on_read() {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    let layer_path = dir.path().join("layer.tar.gz");
    write_layer(&layer_path);
    let (index, layer_manifest) =
        lazylayer_zinfo::index_file(&layer_path, 64 * 1024).expect("index failed");
    let compressed = std::fs::read(&layer_path).expect("read layer");

    let manager = SpanManagerBuilder::from_manifest(
        Arc::new(index),
        &layer_manifest,
        Arc::new(lazylayer_span::reader::MemoryReader::new(compressed)),
    )
    .expect("manifest matches")
    .build()
    .expect("manager");

    for id in 0..manager.span_count() {
        manager
            .fetch_single_span(SpanId::new(id as u32))
            .await
            .expect("fetch");
    }
    assert!(manager.pending_spans().is_empty());

    let mut plain = Vec::new();
    let _ = GzDecoder::new(File::open(&layer_path).expect("open"))
        .read_to_end(&mut plain)
        .expect("reference decode");
    let all = manager
        .get_contents(0, manager.uncompressed_size())
        .await
        .expect("contents")
        .into_vec();
    assert_eq!(all, plain);
}
