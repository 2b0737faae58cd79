use std::sync::Arc;
use std::time::Duration;

use discogs_etl::bus::MessageBus;
use discogs_etl::bus::memory::MemoryBus;
use discogs_etl::concurrency::shutdown::create_shutdown_channel;
use discogs_etl::error::ErrorKind;
use discogs_etl::extractor::FileOutcome;
use discogs_etl::sink::memory::MemorySink;
use discogs_etl::store::{FileStateMarkerStore, StateMarkerStore};
use discogs_etl::test_utils::archive::{dump_xml, write_dump};
use discogs_etl::test_utils::record::artist;
use discogs_etl::test_utils::test_sink_wrapper::TestSinkWrapper;
use discogs_etl::types::{BusMessage, DataType};
use discogs_telemetry::tracing::init_test_tracing;

use crate::common::{
    GRAPH_GROUP, TABLE_GROUP, create_extractor, extractor_config, loader_config, start_loader,
    wait_for_loader,
};

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_records_are_stored_once_in_every_sink_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    write_dump(
        dir.path(),
        "discogs_20250101_artists.xml.gz",
        &dump_xml(
            DataType::Artists,
            &[("a1", "The Persuader"), ("a2", "Mr. James Barth"), ("a1", "The Persuader")],
        ),
    );

    let bus = Arc::new(MemoryBus::new([GRAPH_GROUP, TABLE_GROUP]));
    let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

    let extractor = create_extractor(
        extractor_config(dir.path(), &["artists"]),
        &bus,
        shutdown_rx.clone(),
    );
    let summaries = extractor.run().await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(
        summaries[0].outcome,
        FileOutcome::Completed {
            records: 3,
            malformed: 0
        }
    );

    let graph_sink = MemorySink::new();
    let table_sink = MemorySink::new();
    let graph_loader = start_loader(
        loader_config(GRAPH_GROUP, &["artists"]),
        &bus,
        graph_sink.clone(),
        shutdown_rx.clone(),
    )
    .await;
    let table_loader = start_loader(
        loader_config(TABLE_GROUP, &["artists"]),
        &bus,
        table_sink.clone(),
        shutdown_rx.clone(),
    )
    .await;

    wait_for_loader(graph_loader).await;
    wait_for_loader(table_loader).await;

    for sink in [&graph_sink, &table_sink] {
        let ids: Vec<String> = sink
            .records(DataType::Artists)
            .await
            .into_iter()
            .map(|record| record.id)
            .collect();
        assert_eq!(ids, vec!["a1".to_string(), "a2".to_string()]);
        assert_eq!(sink.write_count().await, 2);
    }
    for group in [GRAPH_GROUP, TABLE_GROUP] {
        assert_eq!(bus.ready_count(group, DataType::Artists), 0);
        assert_eq!(bus.unacked_count(group, DataType::Artists), 0);
    }

    let marker = FileStateMarkerStore::new(dir.path().join("state"))
        .load(DataType::Artists)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(marker.total_records, 3);
    assert_eq!(marker.offset, 3);
    assert!(marker.completed);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_sink_writes_are_redelivered_test() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    write_dump(
        dir.path(),
        "discogs_20250101_labels.xml.gz",
        &dump_xml(DataType::Labels, &[("1", "Planet E"), ("2", "Axis"), ("3", "Tresor")]),
    );

    let bus = Arc::new(MemoryBus::new([TABLE_GROUP]));
    let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

    let extractor = create_extractor(
        extractor_config(dir.path(), &["labels"]),
        &bus,
        shutdown_rx.clone(),
    );
    extractor.run().await.unwrap();

    let sink = TestSinkWrapper::wrap(MemorySink::new());
    sink.fail_next_upserts(2, ErrorKind::SinkConnectionFailed).await;
    let loader = start_loader(
        loader_config(TABLE_GROUP, &["labels"]),
        &bus,
        sink.clone(),
        shutdown_rx.clone(),
    )
    .await;

    wait_for_loader(loader).await;

    let committed: usize = sink
        .committed_batches()
        .await
        .iter()
        .map(|(_, records)| records.len())
        .sum();
    assert_eq!(committed, 3);
    assert!(sink.upsert_calls().await >= 3);
    assert!(sink.shutdown_called().await);
    assert_eq!(bus.unacked_count(TABLE_GROUP, DataType::Labels), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn message_after_file_complete_is_still_loaded_test() {
    init_test_tracing();
    let bus = Arc::new(MemoryBus::new([GRAPH_GROUP]));
    bus.declare_topology(&[DataType::Artists]).await.unwrap();
    let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

    let sink = TestSinkWrapper::wrap(MemorySink::new());
    let mut config = loader_config(GRAPH_GROUP, &["artists"]);
    config.completion_grace_ms = 1_000;
    let loader = start_loader(config, &bus, sink.clone(), shutdown_rx).await;

    let first = sink.wait_for_records(DataType::Artists, 1).await;
    bus.publish(&BusMessage::record(artist("a1", "h1"))).await.unwrap();
    bus.publish(&BusMessage::file_complete(
        DataType::Artists,
        1,
        "discogs_20250101_artists.xml.gz",
    ))
    .await
    .unwrap();
    first.notified().await;

    // Arrives during the grace period, e.g. a redelivery from another channel.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = sink.wait_for_records(DataType::Artists, 2).await;
    bus.publish(&BusMessage::record(artist("a2", "h2"))).await.unwrap();
    second.notified().await;

    wait_for_loader(loader).await;

    let committed: Vec<String> = sink
        .committed_batches()
        .await
        .into_iter()
        .flat_map(|(_, records)| records.into_iter().map(|record| record.id))
        .collect();
    assert_eq!(committed, vec!["a1".to_string(), "a2".to_string()]);
    assert!(!bus.is_subscribed(GRAPH_GROUP, DataType::Artists));
}
