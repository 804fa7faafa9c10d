use std::sync::Arc;

use approx::assert_relative_eq;
use photonpix_core::hit::RawEvent;
use photonpix_core::{
    ClusteringSettings, HostClusteringSettings, HostProjectionSettings, NoopOperation,
    OperationHandle, ProjectionSettings,
};
use photonpix_io::{
    run_clustering, run_projection, ClusterFileFormat, ClusterFileWriter, ClusterList,
    EventInput, EventListFile, EventListWriter, ImageBuffer, MemoryEventAccessor,
};
use photonpix_tpx::{BoundingBox, CalibrationTable};
use tempfile::tempdir;

/// Deterministic pseudo-random events, sorted by timestamp.
fn synthetic_events(count: usize) -> Vec<RawEvent> {
    let mut state = 0x2545_f491_4f6c_dd1du64;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };
    let mut ts = 0u64;
    (0..count)
        .map(|_| {
            ts += next() % 20;
            let r = next();
            RawEvent::new((r % 32) as u16 + 100, ((r >> 8) % 32) as u16 + 100, ts, (r >> 16) as u16 % 50 + 1)
        })
        .collect()
}

fn memory_input(events: Vec<RawEvent>) -> EventInput<MemoryEventAccessor> {
    EventInput::new(
        MemoryEventAccessor::from_events(events),
        Arc::new(CalibrationTable::default()),
    )
}

#[test]
fn clustering_is_independent_of_block_size() {
    let events = synthetic_events(3000);
    let settings = ClusteringSettings::new().with_temporal_margin(16.0);

    let mut reference = ClusterList::new("reference");
    let version = run_clustering(
        &memory_input(events.clone()),
        &settings,
        &mut reference,
        &NoopOperation,
    )
    .unwrap();
    assert_eq!(
        reference.clusters().iter().map(|c| c.len()).sum::<usize>(),
        events.len()
    );
    assert!(reference
        .clusters()
        .windows(2)
        .all(|w| w[0].timestamp <= w[1].timestamp));

    for block_size in [1, 7, 256] {
        let mut list = ClusterList::new("reference");
        let other = run_clustering(
            &memory_input(events.clone()).with_block_size(block_size),
            &settings,
            &mut list,
            &NoopOperation,
        )
        .unwrap();
        assert_eq!(other, version, "block size {block_size}");
        assert_eq!(list.clusters(), reference.clusters());
    }
}

#[test]
fn event_list_file_to_cluster_csv() {
    let dir = tempdir().unwrap();
    let events_path = dir.path().join("events.ppx");
    let clusters_path = dir.path().join("clusters.csv");

    let events = vec![
        RawEvent::new(10, 10, 100, 5),
        RawEvent::new(11, 10, 102, 7),
        RawEvent::new(200, 50, 103, 4),
        RawEvent::new(10, 10, 5000, 5),
    ];
    let mut writer = EventListWriter::create(&events_path).unwrap();
    writer.write_events(&events).unwrap();
    writer.finish().unwrap();

    let input = EventInput::new(
        EventListFile::open(&events_path).unwrap(),
        Arc::new(CalibrationTable::default()),
    )
    .with_block_size(2);
    let mut sink = ClusterFileWriter::create(&clusters_path, ClusterFileFormat::Csv).unwrap();
    let version = run_clustering(&input, &ClusteringSettings::new(), &mut sink, &NoopOperation)
        .unwrap();

    assert_eq!(version.object, clusters_path.display().to_string());
    assert_eq!(sink.count(), 3);
    let content = std::fs::read_to_string(&clusters_path).unwrap();
    let rows: Vec<&str> = content.lines().skip(1).collect();
    assert_eq!(rows.len(), 3);
    // The two-pixel cluster takes the time of its more energetic member.
    assert!(rows[0].starts_with("102,"));
    assert!(rows[0].ends_with(",24,2"));
}

#[test]
fn host_settings_enable_xrf_merging() {
    let host: HostClusteringSettings = serde_json::from_str(
        r#"{
            "temporalMargin": 100.0,
            "xrfCorrection": true,
            "xrfMinEnergy": 1.0,
            "xrfMaxEnergy": 10.0,
            "xrfTemporalMargin": 100.0,
            "xrfDistanceLimit": 5.0
        }"#,
    )
    .unwrap();
    let settings = ClusteringSettings::try_from(host).unwrap();

    // 50 ns apart, 3 pixels apart; uniform a = 1 makes energy equal ToT.
    let events = vec![RawEvent::new(100, 100, 1000, 8), RawEvent::new(103, 100, 1032, 2)];
    let input = EventInput::new(
        MemoryEventAccessor::from_events(events),
        Arc::new(CalibrationTable::uniform(1.0, 0.0, 0.0, 0.0)),
    );

    let mut merged = ClusterList::new("xrf");
    run_clustering(&input, &settings, &mut merged, &NoopOperation).unwrap();
    assert_eq!(merged.clusters().len(), 1);
    assert_relative_eq!(merged.clusters()[0].energy, 10.0);

    let mut plain = ClusterList::new("plain");
    let disabled = ClusteringSettings {
        xrf: settings.xrf.clone().with_enabled(false),
        ..settings
    };
    run_clustering(&input, &disabled, &mut plain, &NoopOperation).unwrap();
    assert_eq!(plain.clusters().len(), 2);
}

#[test]
fn projection_with_white_image() {
    let bbox = BoundingBox::new(0.0, 0.0, 4.0, 4.0);
    let stream = |pixels: &[(u16, u16)]| {
        let events = pixels
            .iter()
            .enumerate()
            .map(|(i, &(x, y))| RawEvent::new(x, y, i as u64 * 1000, 10))
            .collect();
        let mut accessor = MemoryEventAccessor::new();
        accessor.add_stream(events, Some(bbox));
        EventInput::new(accessor, Arc::new(CalibrationTable::default()))
    };
    let sample = stream(&[(0, 0), (0, 0), (3, 3)]);
    let white = stream(&[(0, 0), (3, 3), (0, 0), (3, 3)]);

    let host = HostProjectionSettings {
        attribute: "count".to_string(),
        image_width: 4,
        image_height: 4,
        enable_white_image: true,
        ..HostProjectionSettings::default()
    };
    let settings = ProjectionSettings::try_from(host).unwrap();

    let mut sink = ImageBuffer::new("image");
    run_projection(
        &sample,
        Some(&white),
        &ClusteringSettings::new(),
        &settings,
        &mut sink,
        &NoopOperation,
    )
    .unwrap();
    let image = sink.image().unwrap();
    // Sample spans 2000 ticks, white 3000: factor 1.5.
    assert_relative_eq!(image.get(0, 0), 1.5, max_relative = 1e-12);
    assert_relative_eq!(image.get(3, 3), 0.75, max_relative = 1e-12);
    assert_relative_eq!(image.get(1, 1), 0.0);

    let missing = run_projection::<_, MemoryEventAccessor, _, _>(
        &sample,
        None,
        &ClusteringSettings::new(),
        &settings,
        &mut ImageBuffer::new("image"),
        &NoopOperation,
    )
    .unwrap_err();
    assert_eq!(missing.id(), "photonpix.Error.InvalidConfiguration");
}

#[test]
fn cancelled_run_reports_cancellation() {
    let handle = OperationHandle::new();
    handle.cancel();
    let mut list = ClusterList::new("cancelled");
    let err = run_clustering(
        &memory_input(synthetic_events(100)),
        &ClusteringSettings::new(),
        &mut list,
        &handle,
    )
    .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err.id(), "photonpix.Error.Cancelled");
    assert!(list.clusters().is_empty());
}
