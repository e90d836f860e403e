// tests/test_config.rs — Loading run configuration from JSON files.

use std::io::Write;

use gpu_segment::cpu::CpuBackend;
use gpu_segment::dispatch::WorkgroupSize;
use gpu_segment::{segment, Algorithm, BackendKind, RgbaImage, SegmentConfig, SegmentError};

fn write_config(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn full_file_round_trips_every_field() {
    let file = write_config(
        r#"{
            "kmeans":    { "clusters": 4, "max_iterations": 10, "seed": 7 },
            "meanshift": { "spatial_radius": 8, "color_radius": 12.5, "max_steps": 3 },
            "workgroup": { "x": 8, "y": 8 },
            "backend":   "cpu"
        }"#,
    );
    let c = SegmentConfig::from_json_file(file.path()).unwrap();
    assert_eq!(c.kmeans.clusters, 4);
    assert_eq!(c.kmeans.max_iterations, 10);
    assert_eq!(c.kmeans.seed, 7);
    assert_eq!(c.meanshift.spatial_radius, 8);
    assert_eq!(c.meanshift.color_radius, 12.5);
    assert_eq!(c.meanshift.max_steps, 3);
    assert_eq!(c.workgroup, Some(WorkgroupSize { x: 8, y: 8 }));
    assert_eq!(c.backend, BackendKind::Cpu);
}

#[test]
fn empty_object_is_the_default_config() {
    let file = write_config("{}");
    let c = SegmentConfig::from_json_file(file.path()).unwrap();
    assert_eq!(c, SegmentConfig::default());
}

#[test]
fn serialized_default_loads_back() {
    let text = serde_json::to_string_pretty(&SegmentConfig::default()).unwrap();
    let file = write_config(&text);
    assert_eq!(SegmentConfig::from_json_file(file.path()).unwrap(), SegmentConfig::default());
}

#[test]
fn invalid_values_are_config_errors() {
    let file = write_config(r#"{ "meanshift": { "max_steps": 0 } }"#);
    let err = SegmentConfig::from_json_file(file.path()).unwrap_err();
    assert!(matches!(err, SegmentError::Config(_)), "{err}");

    let file = write_config(r#"{ "workgroup": { "x": 0, "y": 4 } }"#);
    assert!(matches!(
        SegmentConfig::from_json_file(file.path()),
        Err(SegmentError::Config(_))
    ));
}

#[test]
fn workgroup_with_overflowing_invocation_count_is_rejected() {
    let text = r#"{ "workgroup": { "x": 65536, "y": 65536 }, "backend": "cpu" }"#;
    let file = write_config(text);
    assert!(matches!(
        SegmentConfig::from_json_file(file.path()),
        Err(SegmentError::Config(_))
    ));

    let config: SegmentConfig = serde_json::from_str(text).unwrap();
    let mut cpu = CpuBackend::new(WorkgroupSize::default());
    let img = RgbaImage::filled(4, 4, [1, 2, 3, 255]);
    let err = segment(&mut cpu, Algorithm::Kmeans, &config, &img).unwrap_err();
    assert!(matches!(err, SegmentError::Config(_)), "{err}");
    assert_eq!(cpu.live_buffers(), 0);
}

#[test]
fn malformed_json_and_missing_file() {
    let file = write_config(r#"{ "backend": "tpu" }"#);
    assert!(matches!(
        SegmentConfig::from_json_file(file.path()),
        Err(SegmentError::Json(_))
    ));

    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        SegmentConfig::from_json_file(dir.path().join("missing.json")),
        Err(SegmentError::Io(_))
    ));
}
