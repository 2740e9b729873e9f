//! Test fixtures: configuration, capture files and locations

use fieldsync::config::AppConfig;
use fieldsync::models::photo_job::LocationSnapshot;
use image::{Rgb, RgbImage};
use std::path::{Path, PathBuf};

/// Configuration tuned for tests: millisecond timings, no overlay, data under `data_dir`.
pub fn test_config(api_base_url: &str, data_dir: &Path, overrides: &[(&str, &str)]) -> AppConfig {
    let mut vars = vec![
        ("API_BASE_URL".to_string(), api_base_url.to_string()),
        ("DATA_DIR".to_string(), data_dir.display().to_string()),
        ("OVERLAY_ENABLED".to_string(), "false".to_string()),
        ("PHOTO_MAX_WIDTH".to_string(), "640".to_string()),
        ("BACKOFF_BASE_MS".to_string(), "10".to_string()),
        ("BACKOFF_MAX_MS".to_string(), "40".to_string()),
        ("WORKER_POLL_INTERVAL_MS".to_string(), "5".to_string()),
        ("WORKER_IDLE_BACKOFF_MS".to_string(), "5".to_string()),
    ];
    for (key, value) in overrides {
        vars.retain(|(k, _)| k.as_str() != *key);
        vars.push((key.to_string(), value.to_string()));
    }
    envy::from_iter(vars).expect("test config")
}

/// Write a gradient PNG standing in for a raw camera capture.
pub fn write_capture(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
    let image = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    let path = dir.join(name);
    image.save(&path).expect("write capture");
    path
}

/// Three captures for one phase.
pub fn capture_phase(dir: &Path) -> Vec<PathBuf> {
    (0..3)
        .map(|i| write_capture(dir, &format!("raw_{i}.png"), 1200, 900))
        .collect()
}

pub fn uris(paths: &[PathBuf]) -> Vec<String> {
    paths.iter().map(|p| p.display().to_string()).collect()
}

pub fn site_location() -> LocationSnapshot {
    LocationSnapshot {
        latitude: 39.7817,
        longitude: -89.6501,
        accuracy_m: Some(8.0),
    }
}
