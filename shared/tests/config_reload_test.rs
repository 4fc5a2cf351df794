//! 설정 파일 감시 통합 테스트
//!
//! 실제 파일시스템에서 로드/재로드/멱등성을 검증합니다.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;

use shared::config::{watch_loader, FileWatcher, JsonLoader};

#[derive(Debug, Deserialize)]
struct Sample {
    n: i32,
}

/// 파일 변경이 1초 안에 스냅샷에 반영되고, 훅은 (old, new)로 정확히
/// 1회 호출되며, 같은 내용의 재기록은 훅을 다시 부르지 않아야 한다
#[tokio::test]
async fn test_file_reload_fires_hook_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.json");
    std::fs::write(&path, br#"{"n":1}"#).unwrap();

    let watcher = FileWatcher::new().unwrap();
    let loader: Arc<JsonLoader<Sample>> = Arc::new(JsonLoader::new("t"));
    watch_loader(&watcher, &path, loader.clone(), true).unwrap();
    assert_eq!(loader.get().unwrap().n, 1);

    // 초기 로드 이후에 훅 등록: 이후 전이만 관찰한다
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let calls_ref = calls.clone();
    let seen_ref = seen.clone();
    loader.on_change(move |old, new| {
        calls_ref.fetch_add(1, Ordering::SeqCst);
        seen_ref.lock().push((old.map(|o| o.n), new.n));
    });

    std::fs::write(&path, br#"{"n":2}"#).unwrap();

    // 디바운스(100ms) + 여유를 두고 1초 안에 반영 확인
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
        if loader.get().unwrap().n == 2 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "1초 안에 재로드되어야 함"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(seen.lock().as_slice(), &[(Some(1), 2)]);

    // 같은 내용 재기록: 감시는 발화해도 로드는 no-op이어야 함
    std::fs::write(&path, br#"{"n":2}"#).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1, "동일 바이트 재기록은 훅을 부르지 않음");
}

/// 원자적 rename 교체도 감지해야 한다 (부모 디렉토리 감시)
#[tokio::test]
async fn test_atomic_rename_edit_detected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cfg.json");
    std::fs::write(&path, br#"{"n":10}"#).unwrap();

    let watcher = FileWatcher::new().unwrap();
    let loader: Arc<JsonLoader<Sample>> = Arc::new(JsonLoader::new("cfg"));
    watch_loader(&watcher, &path, loader.clone(), true).unwrap();
    assert_eq!(loader.get().unwrap().n, 10);

    // 에디터 스타일: 임시 파일에 쓴 뒤 rename으로 교체
    let tmp = dir.path().join("cfg.json.tmp");
    std::fs::write(&tmp, br#"{"n":11}"#).unwrap();
    std::fs::rename(&tmp, &path).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if loader.get().unwrap().n == 11 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "rename 교체도 감지되어야 함"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// 깨진 내용으로 바뀌면 이전 스냅샷이 유지되어야 한다
#[tokio::test]
async fn test_broken_reload_keeps_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cfg.json");
    std::fs::write(&path, br#"{"n":5}"#).unwrap();

    let watcher = FileWatcher::new().unwrap();
    let loader: Arc<JsonLoader<Sample>> = Arc::new(JsonLoader::new("cfg"));
    watch_loader(&watcher, &path, loader.clone(), true).unwrap();

    std::fs::write(&path, b"{broken").unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(loader.get().unwrap().n, 5, "로드 실패 시 이전 값 유지");
}
