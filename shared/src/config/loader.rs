//! 설정 로더
//!
//! JSON 스냅샷과 원본 바이트를 함께 보관하는 설정 로더입니다.
//! 원본 바이트가 이전 로드와 같으면 아무 일도 하지 않으며(멱등),
//! 바뀐 경우에만 새 값을 만들어 원자적으로 교체하고 (old, new) 훅을
//! 호출합니다. 로드 실패 시 이전 스냅샷이 그대로 유지됩니다.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::tool::NetError;

type CreateFn<T> = Box<dyn Fn() -> T + Send + Sync>;
type NormalizeFn<T> = Box<dyn Fn(&mut T) -> Result<()> + Send + Sync>;
type ChangeHook<T> = Arc<dyn Fn(Option<&T>, &T) + Send + Sync>;

/// 단일 값 JSON 설정 로더
pub struct JsonLoader<T> {
    name: String,
    raw: RwLock<Vec<u8>>,
    value: RwLock<Option<Arc<T>>>,
    source: RwLock<Option<PathBuf>>,
    create: Option<CreateFn<T>>,
    normalize: Option<NormalizeFn<T>>,
    hooks: RwLock<Vec<ChangeHook<T>>>,
}

impl<T> JsonLoader<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            raw: RwLock::new(Vec::new()),
            value: RwLock::new(None),
            source: RwLock::new(None),
            create: None,
            normalize: None,
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// 빈 입력일 때 기본값을 만들어 주는 훅
    pub fn with_create(mut self, f: impl Fn() -> T + Send + Sync + 'static) -> Self {
        self.create = Some(Box::new(f));
        self
    }

    /// 역직렬화 이후 후처리 훅 (값 보정, 파생 필드 계산 등)
    pub fn with_normalize(
        mut self,
        f: impl Fn(&mut T) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.normalize = Some(Box::new(f));
        self
    }

    /// 변경 훅 등록. 값이 실제로 교체될 때 (old, new)로 호출됩니다.
    pub fn on_change(&self, hook: impl Fn(Option<&T>, &T) + Send + Sync + 'static) {
        self.hooks.write().push(Arc::new(hook));
    }

    /// 현재 스냅샷
    pub fn get(&self) -> Option<Arc<T>> {
        self.value.read().clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 마지막으로 로드한 파일 경로
    pub fn source(&self) -> Option<PathBuf> {
        self.source.read().clone()
    }

    /// 바이트를 로드합니다. 반환값 true = 값이 교체됨.
    ///
    /// 이전 로드와 같은 바이트면 no-op이며 훅도 호출되지 않습니다.
    pub fn load(&self, bytes: &[u8]) -> Result<bool> {
        {
            let raw = self.raw.read();
            if raw.as_slice() == bytes && self.value.read().is_some() {
                debug!("설정 바이트 변경 없음: {}", self.name);
                return Ok(false);
            }
        }

        let mut next: T = if bytes.is_empty() {
            match &self.create {
                Some(create) => create(),
                None => {
                    return Err(NetError::ConfigLoad(format!(
                        "{}: 빈 설정 입력",
                        self.name
                    ))
                    .into())
                }
            }
        } else {
            serde_json::from_slice(bytes).map_err(|e| {
                NetError::ConfigLoad(format!("{}: JSON 파싱 실패: {}", self.name, e))
            })?
        };

        if let Some(normalize) = &self.normalize {
            normalize(&mut next)
                .map_err(|e| NetError::ConfigLoad(format!("{}: 후처리 실패: {}", self.name, e)))?;
        }

        let next = Arc::new(next);
        let old = {
            let mut value = self.value.write();
            let old = value.take();
            *value = Some(next.clone());
            *self.raw.write() = bytes.to_vec();
            old
        };

        // 훅은 락 밖에서 호출한다
        let hooks: Vec<ChangeHook<T>> = self.hooks.read().clone();
        for hook in hooks {
            hook(old.as_deref(), &next);
        }
        info!("설정 로드 완료: {} ({}바이트)", self.name, bytes.len());
        Ok(true)
    }

    /// 파일에서 로드합니다.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<bool> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("{}: 설정 파일 읽기 실패: {}", self.name, path.display()))?;
        let changed = self.load(&bytes)?;
        *self.source.write() = Some(path.to_path_buf());
        Ok(changed)
    }

    /// 현재 원본 바이트를 파일로 저장합니다.
    ///
    /// 경로를 생략하면 마지막 로드 경로를 사용합니다.
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let target = match path {
            Some(p) => p.to_path_buf(),
            None => self
                .source()
                .ok_or_else(|| NetError::ConfigLoad(format!("{}: 저장 경로 없음", self.name)))?,
        };
        let raw = self.raw.read().clone();
        std::fs::write(&target, raw)
            .with_context(|| format!("{}: 설정 저장 실패: {}", self.name, target.display()))?;
        Ok(())
    }
}

/// 맵 값 JSON 설정 로더
///
/// `{"key": {...}, ...}` 형태의 설정을 `HashMap<String, T>` 스냅샷으로
/// 보관합니다. 로드/훅 의미는 [`JsonLoader`]와 같습니다.
pub struct JsonMapLoader<T> {
    inner: JsonLoader<HashMap<String, T>>,
}

impl<T> JsonMapLoader<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: JsonLoader::new(name).with_create(HashMap::new),
        }
    }

    pub fn on_change(
        &self,
        hook: impl Fn(Option<&HashMap<String, T>>, &HashMap<String, T>) + Send + Sync + 'static,
    ) {
        self.inner.on_change(hook);
    }

    pub fn get(&self) -> Option<Arc<HashMap<String, T>>> {
        self.inner.get()
    }

    /// 키 하나의 값 복사본
    pub fn get_value(&self, key: &str) -> Option<T>
    where
        T: Clone,
    {
        self.inner.get().and_then(|m| m.get(key).cloned())
    }

    pub fn load(&self, bytes: &[u8]) -> Result<bool> {
        self.inner.load(bytes)
    }

    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<bool> {
        self.inner.load_file(path)
    }

    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        self.inner.save(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        n: i32,
        #[serde(default)]
        label: String,
    }

    #[test]
    fn test_load_and_get() {
        let loader: JsonLoader<Sample> = JsonLoader::new("test");
        assert!(loader.get().is_none());

        let changed = loader.load(br#"{"n":1}"#).unwrap();
        assert!(changed);
        assert_eq!(loader.get().unwrap().n, 1);
    }

    /// 같은 바이트를 두 번 로드하면 두 번째는 no-op이어야 함
    #[test]
    fn test_load_idempotence() {
        let loader: JsonLoader<Sample> = JsonLoader::new("test");
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_ref = calls.clone();
        loader.on_change(move |_, _| {
            calls_ref.fetch_add(1, Ordering::SeqCst);
        });

        assert!(loader.load(br#"{"n":1}"#).unwrap());
        assert!(!loader.load(br#"{"n":1}"#).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hook_receives_old_and_new() {
        let loader: JsonLoader<Sample> = JsonLoader::new("test");
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_ref = seen.clone();
        loader.on_change(move |old, new| {
            seen_ref.lock().push((old.map(|o| o.n), new.n));
        });

        loader.load(br#"{"n":1}"#).unwrap();
        loader.load(br#"{"n":2}"#).unwrap();

        let calls = seen.lock();
        assert_eq!(calls.as_slice(), &[(None, 1), (Some(1), 2)]);
    }

    /// 파싱 실패 시 이전 스냅샷이 유지되고 훅은 호출되지 않아야 함
    #[test]
    fn test_load_error_keeps_previous_snapshot() {
        let loader: JsonLoader<Sample> = JsonLoader::new("test");
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_ref = calls.clone();
        loader.on_change(move |_, _| {
            calls_ref.fetch_add(1, Ordering::SeqCst);
        });

        loader.load(br#"{"n":1}"#).unwrap();
        assert!(loader.load(b"{broken json").is_err());
        assert_eq!(loader.get().unwrap().n, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_create_hook_for_empty_input() {
        let loader = JsonLoader::new("test").with_create(|| Sample {
            n: 42,
            label: "default".into(),
        });
        loader.load(b"").unwrap();
        assert_eq!(loader.get().unwrap().n, 42);
    }

    #[test]
    fn test_normalize_hook() {
        let loader = JsonLoader::new("test").with_normalize(|s: &mut Sample| {
            s.label = s.label.trim().to_lowercase();
            Ok(())
        });
        loader.load(br#"{"n":1,"label":"  ABC "}"#).unwrap();
        assert_eq!(loader.get().unwrap().label, "abc");
    }

    #[test]
    fn test_map_loader() {
        let loader: JsonMapLoader<Sample> = JsonMapLoader::new("map");
        loader
            .load(br#"{"a":{"n":1},"b":{"n":2}}"#)
            .unwrap();
        let map = loader.get().unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("a").unwrap().n, 1);
    }

    #[test]
    fn test_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        std::fs::write(&path, br#"{"n":7}"#).unwrap();

        let loader: JsonLoader<Sample> = JsonLoader::new("test");
        loader.load_file(&path).unwrap();
        assert_eq!(loader.source().unwrap(), path);

        let copy = dir.path().join("copy.json");
        loader.save(Some(&copy)).unwrap();
        assert_eq!(std::fs::read(&copy).unwrap(), br#"{"n":7}"#.to_vec());
    }
}
