use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use feed_rotor::{RotorConfig, SourceTransport};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "ROTOR_CONFIG",
        "ROTOR_BATCH_SIZE",
        "ROTOR_BATCH_TIMEOUT_MS",
        "ROTOR_DRAIN_MULTIPLIER",
        "ROTOR_DRAIN_DEADLINE_MS",
        "ROTOR_CYCLE_INTERVAL_MS",
        "ROTOR_SETTLE_DELAY_MS",
        "ROTOR_MAX_CYCLES",
        "ROTOR_CHANNEL_PREFIX",
        "ROTOR_SOURCES",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_config_with_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "batch_size": 6,
        "channel_prefix": "cam",
        "rotation": {
            "batch_timeout_ms": 33,
            "drain_multiplier": 4,
            "cycle_interval_ms": 10000,
            "settle_delay_ms": 500
        },
        "sources": [
            { "url": "rtsp://10.0.0.5:8554/north", "transport": "udp", "fps": 15 },
            { "url": "rtsp://10.0.0.6:8554/south" }
        ],
        "inference": {
            "width": 1280,
            "height": 720,
            "config_path": "/etc/rotor/pgie.txt"
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("ROTOR_CONFIG", file.path());
    std::env::set_var("ROTOR_DRAIN_MULTIPLIER", "7");
    std::env::set_var("ROTOR_MAX_CYCLES", "100");

    let cfg = RotorConfig::load().expect("load config");

    let rotation = &cfg.rotation;
    assert_eq!(rotation.batch_size, 6);
    assert_eq!(rotation.channel_prefix, "cam");
    assert_eq!(rotation.batch_timeout, Duration::from_millis(33));
    assert_eq!(rotation.drain_multiplier, 7);
    assert_eq!(rotation.cycle_interval, Duration::from_secs(10));
    assert_eq!(rotation.settle_delay, Duration::from_millis(500));
    assert_eq!(rotation.max_cycles, Some(100));
    assert_eq!(rotation.sources.len(), 2);
    assert_eq!(rotation.sources[0].transport, SourceTransport::Udp);
    assert_eq!(rotation.sources[0].fps, 15);
    assert_eq!(rotation.sources[1].transport, SourceTransport::Tcp);
    assert_eq!(rotation.sources[1].decoder, "nvv4l2decoder");
    assert!(!cfg.all_synthetic());
    assert_eq!(cfg.inference.width, 1280);
    assert_eq!(cfg.inference.height, 720);
    assert_eq!(
        cfg.inference.infer_config_path,
        std::path::PathBuf::from("/etc/rotor/pgie.txt")
    );

    clear_env();
}

#[test]
fn loads_toml_config_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
batch_size = 2

[rotation]
batch_timeout_ms = 20
drain_deadline_ms = 5000

[[sources]]
url = "stub://lobby"
fps = 10
"#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    let cfg = RotorConfig::load_from(Some(file.path())).expect("load config");

    assert_eq!(cfg.rotation.batch_size, 2);
    assert_eq!(cfg.rotation.batch_timeout, Duration::from_millis(20));
    assert_eq!(cfg.rotation.drain_deadline, Some(Duration::from_secs(5)));
    assert_eq!(cfg.rotation.sources[0].url, "stub://lobby");
    assert!(cfg.all_synthetic());

    clear_env();
}

#[test]
fn env_sources_replace_file_sources() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("ROTOR_SOURCES", "stub://a, rtsp://10.0.0.9/live ,");
    std::env::set_var("ROTOR_CHANNEL_PREFIX", " feed ");

    let cfg = RotorConfig::load_from(None).expect("load config");
    let urls: Vec<&str> = cfg
        .rotation
        .sources
        .iter()
        .map(|source| source.url.as_str())
        .collect();
    assert_eq!(urls, ["stub://a", "rtsp://10.0.0.9/live"]);
    assert_eq!(cfg.rotation.channel_prefix, "feed");

    clear_env();
}

#[test]
fn rejects_malformed_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("ROTOR_BATCH_TIMEOUT_MS", "soon");
    let err = RotorConfig::load_from(None).err().expect("not a number");
    assert!(err.to_string().contains("ROTOR_BATCH_TIMEOUT_MS"));
    clear_env();

    std::env::set_var("ROTOR_BATCH_SIZE", "0");
    assert!(RotorConfig::load_from(None).is_err());
    clear_env();

    std::env::set_var("ROTOR_DRAIN_DEADLINE_MS", "50");
    assert!(
        RotorConfig::load_from(None).is_err(),
        "deadline below 5 x 40ms must be rejected"
    );
    clear_env();
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let dir = tempfile::tempdir().expect("temp dir");
    let missing = dir.path().join("absent.json");
    let err = RotorConfig::load_from(Some(&missing))
        .err()
        .expect("file does not exist");
    assert!(err.to_string().contains("absent.json"));
}
