//! 피어 그룹과 라우팅 링
//!
//! 같은 serviceName을 공유하는 피어들의 집합입니다. 메인 일관 해시 링과
//! 태그별 서브 링을 유지합니다.
//!
//! 링 불변식: 링에 있는 serviceId는 "연결이 살아 있고 config가 파기되지
//! 않은" 피어뿐입니다. 멤버십 변경은 피어 자신의 상태 전이(접속/단절/
//! 파기)로만 일어납니다.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use shared::ConsistentHash;

use crate::peer::Peer;

/// serviceName 하나의 피어 그룹
pub struct Group {
    name: String,
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    ring: RwLock<ConsistentHash>,
    tag_rings: RwLock<HashMap<String, ConsistentHash>>,
}

impl Group {
    pub(crate) fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            peers: RwLock::new(HashMap::new()),
            ring: RwLock::new(ConsistentHash::default()),
            tag_rings: RwLock::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// id로 피어 조회
    pub fn get(&self, id: &str) -> Option<Arc<Peer>> {
        self.peers.read().get(id).cloned()
    }

    /// 요청 키를 메인 링으로 해싱해 피어 선택
    pub fn get_by_hash(&self, key: &str) -> Option<Arc<Peer>> {
        let id = self.ring.read().get(key)?.to_string();
        self.get(&id)
    }

    /// 태그 서브 링에서 해싱해 피어 선택
    pub fn get_by_tag_and_hash(&self, tag: &str, key: &str) -> Option<Arc<Peer>> {
        let tag = tag.trim().to_lowercase();
        let id = {
            let rings = self.tag_rings.read();
            rings.get(&tag)?.get(key)?.to_string()
        };
        self.get(&id)
    }

    /// 전체 피어 스냅샷
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().values().cloned().collect()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.read().keys().cloned().collect()
    }

    /// 메인 링의 현재 멤버 (정렬됨)
    pub fn ring_ids(&self) -> Vec<String> {
        self.ring.read().nodes()
    }

    /// 태그 서브 링의 현재 멤버
    pub fn tag_ring_ids(&self, tag: &str) -> Vec<String> {
        let tag = tag.trim().to_lowercase();
        self.tag_rings
            .read()
            .get(&tag)
            .map(|r| r.nodes())
            .unwrap_or_default()
    }

    pub(crate) fn insert(&self, peer: Arc<Peer>) {
        self.peers.write().insert(peer.id(), peer);
    }

    /// 피어 제거. 같은 인스턴스일 때만 제거합니다 (교체 경합 보호).
    pub(crate) fn remove(&self, peer: &Arc<Peer>) -> bool {
        let mut peers = self.peers.write();
        match peers.get(&peer.id()) {
            Some(current) if Arc::ptr_eq(current, peer) => {
                peers.remove(&peer.id());
                true
            }
            _ => false,
        }
    }

    /// 링 합류: 메인 링 + 모든 태그 서브 링
    pub(crate) fn join_rings(&self, id: &str, tags: &[String]) {
        self.ring.write().add(id);
        let mut rings = self.tag_rings.write();
        for tag in tags {
            rings.entry(tag.clone()).or_default().add(id);
        }
        debug!("링 합류: group={} id={} tags={:?}", self.name, id, tags);
    }

    /// 링 이탈. 비게 된 태그 서브 링은 삭제합니다.
    pub(crate) fn leave_rings(&self, id: &str, tags: &[String]) {
        self.ring.write().remove(id);
        let mut rings = self.tag_rings.write();
        for tag in tags {
            if let Some(ring) = rings.get_mut(tag) {
                ring.remove(id);
                if ring.is_empty() {
                    rings.remove(tag);
                }
            }
        }
        debug!("링 이탈: group={} id={}", self.name, id);
    }

    /// 태그 집합 변경 반영. 링에 있는 피어만 서브 링 멤버십을 조정합니다.
    pub(crate) fn sync_tags(&self, id: &str, old_tags: &[String], new_tags: &[String]) {
        let in_ring = self.ring.read().contains(id);
        let mut rings = self.tag_rings.write();
        for tag in old_tags {
            if !new_tags.contains(tag) {
                if let Some(ring) = rings.get_mut(tag) {
                    ring.remove(id);
                    if ring.is_empty() {
                        rings.remove(tag);
                    }
                }
            }
        }
        if in_ring {
            for tag in new_tags {
                if !old_tags.contains(tag) {
                    rings.entry(tag.clone()).or_default().add(id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_membership() {
        let group = Group::new("game");
        group.join_rings("a", &["kr".to_string()]);
        group.join_rings("b", &["kr".to_string(), "eu".to_string()]);

        assert_eq!(group.ring_ids(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(
            group.tag_ring_ids("kr"),
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(group.tag_ring_ids("eu"), vec!["b".to_string()]);

        group.leave_rings("b", &["kr".to_string(), "eu".to_string()]);
        assert_eq!(group.ring_ids(), vec!["a".to_string()]);
        // 비게 된 태그 링은 삭제됨
        assert!(group.tag_ring_ids("eu").is_empty());
        assert_eq!(group.tag_ring_ids("kr"), vec!["a".to_string()]);
    }

    #[test]
    fn test_sync_tags_adjusts_subrings_only() {
        let group = Group::new("game");
        group.join_rings("a", &["kr".to_string()]);

        group.sync_tags("a", &["kr".to_string()], &["eu".to_string()]);
        assert!(group.tag_ring_ids("kr").is_empty());
        assert_eq!(group.tag_ring_ids("eu"), vec!["a".to_string()]);
        // 메인 링은 그대로
        assert_eq!(group.ring_ids(), vec!["a".to_string()]);
    }
}
