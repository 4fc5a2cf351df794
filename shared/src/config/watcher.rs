//! 로컬 설정 파일 감시
//!
//! notify 기반 파일 변경 감시입니다. 파일 inode가 아니라 부모 디렉토리를
//! 감시하므로 원자적 rename으로 교체되는 편집도 감지합니다.
//! 같은 디렉토리의 여러 파일은 하나의 OS 감시를 공유하며,
//! 연속 변경 알림은 100ms 디바운스 후 한 번만 전달됩니다.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::loader::JsonLoader;

/// 변경 알림 디바운스 간격
const DEBOUNCE: std::time::Duration = std::time::Duration::from_millis(100);

type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

/// 디렉토리 단위 공유 파일 감시자
///
/// tokio 런타임 안에서 생성해야 합니다 (디바운스 태스크를 spawn).
pub struct FileWatcher {
    watcher: Mutex<RecommendedWatcher>,
    watched_dirs: Mutex<HashSet<PathBuf>>,
    subs: Arc<DashMap<PathBuf, Vec<ChangeCallback>>>,
    pending: Arc<DashMap<PathBuf, tokio::task::JoinHandle<()>>>,
}

impl FileWatcher {
    pub fn new() -> Result<Arc<Self>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                for path in event.paths {
                    let _ = tx.send(path);
                }
            }
        })
        .context("파일 감시자 생성 실패")?;

        let this = Arc::new(Self {
            watcher: Mutex::new(watcher),
            watched_dirs: Mutex::new(HashSet::new()),
            subs: Arc::new(DashMap::new()),
            pending: Arc::new(DashMap::new()),
        });

        let me = this.clone();
        tokio::spawn(async move {
            while let Some(path) = rx.recv().await {
                me.schedule(path);
            }
        });

        Ok(this)
    }

    /// 파일 변경 구독
    ///
    /// 부모 디렉토리에 대한 OS 감시는 최초 한 번만 등록됩니다.
    pub fn watch(
        self: &Arc<Self>,
        file: impl AsRef<Path>,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Result<()> {
        let key = Self::file_key(file.as_ref())?;
        let dir = key
            .parent()
            .ok_or_else(|| anyhow!("부모 디렉토리가 없는 경로: {}", key.display()))?
            .to_path_buf();

        {
            let mut dirs = self.watched_dirs.lock();
            if dirs.insert(dir.clone()) {
                self.watcher
                    .lock()
                    .watch(&dir, RecursiveMode::NonRecursive)
                    .with_context(|| format!("디렉토리 감시 등록 실패: {}", dir.display()))?;
                debug!("디렉토리 감시 시작: {}", dir.display());
            }
        }

        self.subs
            .entry(key)
            .or_default()
            .push(Arc::new(callback));
        Ok(())
    }

    /// 감시 대상 파일의 정규화 키: canonical(부모) + 파일명
    ///
    /// 파일 자체를 canonicalize하지 않는 이유: rename 교체 직후에는
    /// 파일이 일시적으로 없을 수 있다.
    fn file_key(file: &Path) -> Result<PathBuf> {
        let parent = file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = file
            .file_name()
            .ok_or_else(|| anyhow!("파일명이 없는 경로: {}", file.display()))?;
        let canon = parent
            .canonicalize()
            .with_context(|| format!("경로 정규화 실패: {}", parent.display()))?;
        Ok(canon.join(name))
    }

    fn schedule(self: &Arc<Self>, path: PathBuf) {
        let key = match Self::file_key(&path) {
            Ok(k) => k,
            Err(_) => return,
        };
        if !self.subs.contains_key(&key) {
            return;
        }
        // 디바운스: 이전 예약을 취소하고 새로 건다
        if let Some((_, prev)) = self.pending.remove(&key) {
            prev.abort();
        }
        let me = self.clone();
        let fire_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            me.pending.remove(&fire_key);
            let callbacks: Vec<ChangeCallback> = me
                .subs
                .get(&fire_key)
                .map(|cbs| cbs.clone())
                .unwrap_or_default();
            for cb in callbacks {
                cb();
            }
        });
        self.pending.insert(key, handle);
    }
}

/// 로더를 파일에 연결합니다.
///
/// `immediately`가 true면 등록 시점에 즉시 한 번 로드합니다.
/// 이후 파일이 바뀔 때마다 로더가 다시 로드하며, 로드 실패는 로그만
/// 남기고 이전 스냅샷을 유지합니다.
pub fn watch_loader<T>(
    watcher: &Arc<FileWatcher>,
    path: impl AsRef<Path>,
    loader: Arc<JsonLoader<T>>,
    immediately: bool,
) -> Result<()>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    let path = path.as_ref().to_path_buf();
    if immediately {
        loader.load_file(&path)?;
    }
    let reload_path = path.clone();
    watcher.watch(&path, move || {
        if let Err(e) = loader.load_file(&reload_path) {
            warn!("설정 파일 재로드 실패: {}: {:#}", reload_path.display(), e);
        }
    })?;
    Ok(())
}
