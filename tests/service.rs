//! End-to-end tests for the lookup-and-generate server.
//!
//! Each test starts a real server on a free port with a fake synthesizer
//! substituted through `run_server_with_synthesizer`, then talks to it over
//! HTTP with multipart uploads.

use anyhow::Result;
use async_trait::async_trait;
use defectgen::config::Config;
use defectgen::fingerprint::fingerprint_bytes;
use defectgen::mapping::{write_mapping, FingerprintMap};
use defectgen::server::{run_server_with_synthesizer, AppState};
use defectgen::synth::{encode_png, Synthesizer};
use image::{DynamicImage, Rgb, RgbImage};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// ─── Fake synthesizer ───────────────────────────────────────────────

/// Records every prompt and returns a solid image the size of the source,
/// or the source itself when built with [`FakeSynth::echo`].
#[derive(Default)]
struct FakeSynth {
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    delay: Option<Duration>,
    fail: bool,
    echo: bool,
}

impl FakeSynth {
    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn echo(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            echo: true,
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Synthesizer for FakeSynth {
    fn name(&self) -> &str {
        "fake"
    }

    async fn synthesize(&self, prompt: &str, source: &DynamicImage) -> Result<DynamicImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            anyhow::bail!("GPU out of memory");
        }
        if self.echo {
            return Ok(source.clone());
        }
        Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            source.width(),
            source.height(),
            Rgb([255, 64, 0]),
        )))
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

struct TestEnv {
    _tmp: TempDir,
    root: PathBuf,
    cfg: Config,
    port: u16,
}

impl TestEnv {
    fn results(&self) -> PathBuf {
        self.root.join("results")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn url(&self, defect_type: &str) -> String {
        format!(
            "http://127.0.0.1:{}/generate?defect_type={}",
            self.port, defect_type
        )
    }
}

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn setup(mapping: &FingerprintMap) -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    let port = find_free_port();

    let map_path = root.join("data").join("md5_map.json");
    write_mapping(&map_path, mapping).unwrap();

    let mut cfg = Config::default();
    cfg.paths.map = map_path;
    cfg.paths.results = root.join("results");
    cfg.paths.tmp = root.join("tmp");
    cfg.server.bind = format!("127.0.0.1:{}", port);

    TestEnv {
        _tmp: tmp,
        root,
        cfg,
        port,
    }
}

async fn start(env: &TestEnv, synth: Arc<FakeSynth>) -> tokio::task::JoinHandle<()> {
    let cfg = env.cfg.clone();
    let handle = tokio::spawn(async move {
        run_server_with_synthesizer(&cfg, synth).await.ok();
    });
    wait_for_server(env.port).await;
    handle
}

async fn wait_for_server(port: u16) {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}

fn sample_png(seed: u8) -> Vec<u8> {
    let img = RgbImage::from_fn(8, 6, |x, y| Rgb([seed, x as u8 * 10, y as u8 * 20]));
    encode_png(&DynamicImage::ImageRgb8(img)).unwrap()
}

async fn upload(url: &str, filename: &str, data: Vec<u8>) -> reqwest::Response {
    let part = reqwest::multipart::Part::bytes(data).file_name(filename.to_string());
    let form = reqwest::multipart::Form::new().part("file", part);
    reqwest::Client::new()
        .post(url)
        .multipart(form)
        .send()
        .await
        .unwrap()
}

fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health() {
    let env = setup(&FingerprintMap::new());
    let server = start(&env, Arc::new(FakeSynth::default())).await;

    let resp = reqwest::get(format!("http://127.0.0.1:{}/health", env.port))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    server.abort();
}

#[tokio::test]
async fn test_unknown_defect_type_is_client_error_without_writes() {
    let env = setup(&FingerprintMap::new());
    let synth = Arc::new(FakeSynth::default());
    let server = start(&env, synth.clone()).await;

    for code in ["3", "-1", "abc"] {
        let resp = upload(&env.url(code), "pump.png", sample_png(1)).await;
        assert_eq!(resp.status(), 400, "defect_type={}", code);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "bad_request");
    }

    let resp = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}/generate", env.port))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    assert_eq!(synth.calls(), 0);
    assert!(dir_entries(&env.tmp_dir()).is_empty());
    assert!(dir_entries(&env.results()).is_empty());

    server.abort();
}

#[tokio::test]
async fn test_miss_generates_once_and_stores_by_fingerprint() {
    let env = setup(&FingerprintMap::new());
    let synth = Arc::new(FakeSynth::default());
    let server = start(&env, synth.clone()).await;

    let data = sample_png(2);
    let fp = fingerprint_bytes(&data);

    let resp = upload(&env.url("1"), "valve.png", data.clone()).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "image/png");
    let body = resp.bytes().await.unwrap();

    assert_eq!(synth.calls(), 1);
    assert_eq!(
        synth.prompts.lock().unwrap().as_slice(),
        ["photo of equipment on fire".to_string()]
    );
    assert_eq!(dir_entries(&env.tmp_dir()), vec!["valve.png".to_string()]);
    assert_eq!(fs::read(env.tmp_dir().join("valve.png")).unwrap(), data);
    assert_eq!(dir_entries(&env.results()), vec![format!("{}.png", fp)]);

    let stored = fs::read(env.results().join(format!("{}.png", fp))).unwrap();
    assert_eq!(body.as_ref(), stored.as_slice());
    let img = image::load_from_memory(&body).unwrap().to_rgb8();
    assert_eq!((img.width(), img.height()), (8, 6));
    assert_eq!(img.get_pixel(0, 0), &Rgb([255, 64, 0]));

    server.abort();
}

#[tokio::test]
async fn test_repeated_upload_is_bit_identical() {
    let env = setup(&FingerprintMap::new());
    let synth = Arc::new(FakeSynth::default());
    let server = start(&env, synth.clone()).await;

    let data = sample_png(3);
    let first = upload(&env.url("0"), "a.png", data.clone())
        .await
        .bytes()
        .await
        .unwrap();
    let second = upload(&env.url("0"), "a.png", data.clone())
        .await
        .bytes()
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(synth.calls(), 1);

    server.abort();
}

#[tokio::test]
async fn test_mapped_fingerprint_returns_mapped_file_without_synthesis() {
    let data = sample_png(4);
    let defect_bytes = b"\xff\xd8\xff\xe0 pretend jpeg of a burning pump".to_vec();

    let mut mapping = FingerprintMap::new();
    let env_probe = TempDir::new().unwrap();
    let defect_path = env_probe.path().join("pump_fire.jpg");
    fs::write(&defect_path, &defect_bytes).unwrap();
    mapping.insert(
        fingerprint_bytes(&data),
        defect_path.to_string_lossy().to_string(),
    );

    let env = setup(&mapping);
    let synth = Arc::new(FakeSynth::default());
    let server = start(&env, synth.clone()).await;

    let resp = upload(&env.url("2"), "pump.png", data).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "image/jpeg");
    let body = resp.bytes().await.unwrap();

    assert_eq!(body.as_ref(), defect_bytes.as_slice());
    assert_eq!(synth.calls(), 0);
    assert!(dir_entries(&env.tmp_dir()).is_empty());
    assert!(dir_entries(&env.results()).is_empty());

    server.abort();
}

#[tokio::test]
async fn test_concurrent_identical_misses_generate_once() {
    let env = setup(&FingerprintMap::new());
    let synth = Arc::new(FakeSynth::slow(Duration::from_millis(300)));
    let server = start(&env, synth.clone()).await;

    let data = sample_png(5);
    let mut handles = Vec::new();
    for _ in 0..4 {
        let url = env.url("0");
        let data = data.clone();
        handles.push(tokio::spawn(async move {
            let resp = upload(&url, "same.png", data).await;
            assert_eq!(resp.status(), 200);
            resp.bytes().await.unwrap()
        }));
    }

    let mut bodies = Vec::new();
    for h in handles {
        bodies.push(h.await.unwrap());
    }

    assert_eq!(synth.calls(), 1);
    assert!(bodies.windows(2).all(|w| w[0] == w[1]));

    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_uploads_sharing_a_file_name_keep_their_own_pixels() {
    let env = setup(&FingerprintMap::new());
    let synth = Arc::new(FakeSynth::echo(Duration::from_millis(20)));
    let server = start(&env, synth.clone()).await;

    let mut handles = Vec::new();
    for seed in 0..16u8 {
        let url = env.url("1");
        handles.push(tokio::spawn(async move {
            let data = sample_png(seed * 10);
            let resp = upload(&url, "image.png", data.clone()).await;
            assert_eq!(resp.status(), 200);
            (data, resp.bytes().await.unwrap())
        }));
    }

    for h in handles {
        let (data, body) = h.await.unwrap();
        let sent = image::load_from_memory(&data).unwrap().to_rgb8();
        let got = image::load_from_memory(&body).unwrap().to_rgb8();
        assert_eq!(got, sent, "response does not match its own upload");

        let stored = fs::read(env.results().join(format!("{}.png", fingerprint_bytes(&data))))
            .unwrap();
        assert_eq!(image::load_from_memory(&stored).unwrap().to_rgb8(), sent);
    }
    assert_eq!(synth.calls(), 16);

    server.abort();
}

#[tokio::test]
async fn test_missing_file_field_is_client_error() {
    let env = setup(&FingerprintMap::new());
    let synth = Arc::new(FakeSynth::default());
    let server = start(&env, synth.clone()).await;

    let form = reqwest::multipart::Form::new().text("note", "no image here");
    let resp = reqwest::Client::new()
        .post(env.url("0"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(synth.calls(), 0);

    server.abort();
}

#[tokio::test]
async fn test_undecodable_upload_is_server_error() {
    let env = setup(&FingerprintMap::new());
    let synth = Arc::new(FakeSynth::default());
    let server = start(&env, synth.clone()).await;

    let resp = upload(&env.url("0"), "notes.txt", b"definitely not pixels".to_vec()).await;
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "decode_error");
    assert_eq!(synth.calls(), 0);
    assert!(dir_entries(&env.results()).is_empty());

    server.abort();
}

#[tokio::test]
async fn test_synth_failure_propagates_and_stores_nothing() {
    let env = setup(&FingerprintMap::new());
    let synth = Arc::new(FakeSynth::failing());
    let server = start(&env, synth.clone()).await;

    let resp = upload(&env.url("1"), "pump.png", sample_png(6)).await;
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "synth_error");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("GPU out of memory"));
    assert!(dir_entries(&env.results()).is_empty());

    server.abort();
}

#[tokio::test]
async fn test_startup_fails_without_mapping_file() {
    let env = setup(&FingerprintMap::new());
    let mut cfg = env.cfg.clone();
    cfg.paths.map = env.root.join("missing.json");

    assert!(AppState::with_synthesizer(&cfg, Arc::new(FakeSynth::default())).is_err());
    assert!(
        run_server_with_synthesizer(&cfg, Arc::new(FakeSynth::default()))
            .await
            .is_err()
    );

    fs::write(&env.cfg.paths.map, "{ not json").unwrap();
    assert!(AppState::with_synthesizer(&env.cfg, Arc::new(FakeSynth::default())).is_err());
}

#[tokio::test]
async fn test_startup_creates_result_and_tmp_dirs() {
    let env = setup(&FingerprintMap::new());
    assert!(!env.results().exists());
    AppState::with_synthesizer(&env.cfg, Arc::new(FakeSynth::default())).unwrap();
    assert!(env.results().is_dir());
    assert!(env.tmp_dir().is_dir());
}
