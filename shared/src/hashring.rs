//! 일관 해시 링
//!
//! serviceId 기반 라우팅을 위한 가상 노드 일관 해싱 구현입니다.
//! CRC32 해시를 사용하여 프로세스 간 결정적(deterministic)으로 동작하며,
//! 노드 추가/제거 시 최소한의 키 재배치만 발생합니다.

use std::collections::{BTreeMap, HashSet};

/// 노드(serviceId)당 가상 노드 수
const DEFAULT_REPLICAS: usize = 160;

/// 일관 해시 링
///
/// 링 위치는 `"{node}#{replica}"` 문자열의 CRC32 값으로 결정됩니다.
/// 같은 노드 집합이면 어느 프로세스에서 만들어도 같은 배치를 가집니다.
#[derive(Debug, Clone)]
pub struct ConsistentHash {
    replicas: usize,
    /// 링 위치 -> 노드
    ring: BTreeMap<u32, String>,
    nodes: HashSet<String>,
}

impl Default for ConsistentHash {
    fn default() -> Self {
        Self::new(DEFAULT_REPLICAS)
    }
}

impl ConsistentHash {
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas: replicas.max(1),
            ring: BTreeMap::new(),
            nodes: HashSet::new(),
        }
    }

    /// 노드를 링에 추가합니다. 이미 존재하면 no-op.
    pub fn add(&mut self, node: &str) {
        if !self.nodes.insert(node.to_string()) {
            return;
        }
        for i in 0..self.replicas {
            let point = Self::hash_point(node, i);
            // CRC32 충돌 시 기존 항목을 유지하여 결정성을 지킨다
            self.ring.entry(point).or_insert_with(|| node.to_string());
        }
    }

    /// 노드를 링에서 제거합니다. 없으면 no-op.
    pub fn remove(&mut self, node: &str) {
        if !self.nodes.remove(node) {
            return;
        }
        for i in 0..self.replicas {
            let point = Self::hash_point(node, i);
            if self.ring.get(&point).map(|n| n == node).unwrap_or(false) {
                self.ring.remove(&point);
            }
        }
    }

    /// 요청 키를 노드로 매핑합니다. 링이 비어 있으면 None.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.ring.is_empty() {
            return None;
        }
        let h = crc32fast::hash(key.as_bytes());
        // 시계 방향으로 가장 가까운 가상 노드, 끝을 넘으면 처음으로 순환
        self.ring
            .range(h..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, n)| n.as_str())
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.contains(node)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// 현재 링에 등록된 노드 목록 (정렬됨)
    pub fn nodes(&self) -> Vec<String> {
        let mut v: Vec<String> = self.nodes.iter().cloned().collect();
        v.sort();
        v
    }

    fn hash_point(node: &str, replica: usize) -> u32 {
        crc32fast::hash(format!("{}#{}", node, replica).as_bytes())
    }
}
