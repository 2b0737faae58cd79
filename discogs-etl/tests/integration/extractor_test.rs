use std::sync::Arc;

use discogs_etl::bus::memory::MemoryBus;
use discogs_etl::concurrency::shutdown::create_shutdown_channel;
use discogs_etl::extractor::FileOutcome;
use discogs_etl::store::{FileStateMarkerStore, StateMarkerStore};
use discogs_etl::test_utils::archive::{dump_xml, write_dump};
use discogs_etl::types::{DataType, MessageKind};
use discogs_telemetry::tracing::init_test_tracing;

use crate::common::{GRAPH_GROUP, create_extractor, extractor_config};

fn write_artists(dir: &std::path::Path, file_name: &str) {
    write_dump(
        dir,
        file_name,
        &dump_xml(
            DataType::Artists,
            &[("1", "The Persuader"), ("2", "Mr. James Barth"), ("3", "Josh Wink")],
        ),
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn completed_file_is_skipped_on_restart_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    write_artists(dir.path(), "discogs_20250101_artists.xml.gz");
    let bus = Arc::new(MemoryBus::new([GRAPH_GROUP]));
    let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

    let first = create_extractor(
        extractor_config(dir.path(), &["artists"]),
        &bus,
        shutdown_rx.clone(),
    );
    first.run().await.unwrap();
    assert_eq!(bus.published_messages().len(), 4);

    let second = create_extractor(
        extractor_config(dir.path(), &["artists"]),
        &bus,
        shutdown_rx.clone(),
    );
    let summaries = second.run().await.unwrap();

    assert_eq!(summaries[0].outcome, FileOutcome::Skipped);
    assert_eq!(bus.published_messages().len(), 4);
    assert!(second.progress().is_completed(DataType::Artists));
}

#[tokio::test(flavor = "multi_thread")]
async fn newer_dump_and_forced_runs_are_reprocessed_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    write_artists(dir.path(), "discogs_20250101_artists.xml.gz");
    let bus = Arc::new(MemoryBus::new([GRAPH_GROUP]));
    let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

    create_extractor(
        extractor_config(dir.path(), &["artists"]),
        &bus,
        shutdown_rx.clone(),
    )
    .run()
    .await
    .unwrap();

    write_artists(dir.path(), "discogs_20250201_artists.xml.gz");
    let summaries = create_extractor(
        extractor_config(dir.path(), &["artists"]),
        &bus,
        shutdown_rx.clone(),
    )
    .run()
    .await
    .unwrap();
    assert_eq!(summaries[0].file, "discogs_20250201_artists.xml.gz");
    assert_eq!(
        summaries[0].outcome,
        FileOutcome::Completed {
            records: 3,
            malformed: 0
        }
    );

    let mut forced = extractor_config(dir.path(), &["artists"]);
    forced.force_reprocess = true;
    let summaries = create_extractor(forced, &bus, shutdown_rx.clone())
        .run()
        .await
        .unwrap();
    assert!(matches!(summaries[0].outcome, FileOutcome::Completed { .. }));

    let completions = bus
        .published_messages()
        .iter()
        .filter(|message| message.kind == MessageKind::FileComplete)
        .count();
    assert_eq!(completions, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_publish_resumes_from_marker_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    write_artists(dir.path(), "discogs_20250101_artists.xml.gz");
    let bus = Arc::new(MemoryBus::new([GRAPH_GROUP]));
    let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let store = FileStateMarkerStore::new(dir.path().join("state"));

    // More failures than publish attempts, the first record is never confirmed. One publish
    // in flight keeps the injected failures on that record.
    bus.fail_next_publishes(3);
    let mut config = extractor_config(dir.path(), &["artists"]);
    config.max_in_flight_publishes = 1;
    let failing = create_extractor(config, &bus, shutdown_rx.clone());
    assert!(failing.run().await.is_err());

    let marker = store.load(DataType::Artists).await.unwrap().unwrap();
    assert_eq!(marker.offset, 0);
    assert!(!marker.completed);
    assert!(bus.published_messages().is_empty());

    let restarted = create_extractor(
        extractor_config(dir.path(), &["artists"]),
        &bus,
        shutdown_rx.clone(),
    );
    let summaries = restarted.run().await.unwrap();
    assert_eq!(
        summaries[0].outcome,
        FileOutcome::Completed {
            records: 3,
            malformed: 0
        }
    );

    let ids: Vec<String> = bus
        .published_messages()
        .into_iter()
        .filter_map(|message| message.into_record().ok().map(|record| record.id))
        .collect();
    assert_eq!(ids, vec!["1", "2", "3"]);

    let marker = store.load(DataType::Artists).await.unwrap().unwrap();
    assert_eq!(marker.total_records, 3);
    assert!(marker.completed);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_dumps_are_not_an_error_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(MemoryBus::new([GRAPH_GROUP]));
    let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

    let summaries = create_extractor(
        extractor_config(dir.path(), &["artists", "releases"]),
        &bus,
        shutdown_rx,
    )
    .run()
    .await
    .unwrap();

    assert!(summaries.is_empty());
    assert!(bus.published_messages().is_empty());
}
