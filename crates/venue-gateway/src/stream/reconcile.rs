//! 연결 단위 구독 상태와 희망 구독 집합의 재조정.

use std::collections::{BTreeSet, HashMap};

use super::frame::Topic;

/// 토픽별 실제 구독 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveStatus {
    /// 구독 요청 전송, 확인 대기
    PendingSubscribe,
    /// 서버가 구독 확인
    Acked,
    /// 해제 요청 전송, 확인 대기
    PendingUnsubscribe,
    /// 서버가 구독 거부
    Failed,
}

/// 현재 연결에서만 유효한 구독 상태.
///
/// 세션 제어 태스크만 소유하고 수정하며, 연결이 끊기면 통째로 폐기됩니다.
#[derive(Debug, Default)]
pub struct LiveSubscriptions {
    topics: HashMap<Topic, LiveStatus>,
}

impl LiveSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, topic: &Topic) -> Option<LiveStatus> {
        self.topics.get(topic).copied()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// 해당 상태의 토픽 수.
    pub fn count(&self, status: LiveStatus) -> usize {
        self.topics.values().filter(|s| **s == status).count()
    }

    /// 구독 요청 전송 기록.
    pub fn mark_subscribing(&mut self, topics: &[Topic]) {
        for topic in topics {
            self.topics.insert(topic.clone(), LiveStatus::PendingSubscribe);
        }
    }

    /// 해제 요청 전송 기록.
    pub fn mark_unsubscribing(&mut self, topics: &[Topic]) {
        for topic in topics {
            self.topics.insert(topic.clone(), LiveStatus::PendingUnsubscribe);
        }
    }

    /// 구독 확인 반영.
    pub fn ack_subscribe(&mut self, topic: &Topic) {
        self.topics.insert(topic.clone(), LiveStatus::Acked);
    }

    /// 해제 확인 반영. 토픽은 목록에서 제거됩니다.
    pub fn ack_unsubscribe(&mut self, topic: &Topic) {
        self.topics.remove(topic);
    }

    /// 토픽 실패 반영. 해제 대기 중이던 토픽이면 `true`를 반환하고 제거합니다.
    pub fn fail(&mut self, topic: &Topic) -> bool {
        match self.topics.get(topic) {
            Some(LiveStatus::PendingUnsubscribe) => {
                self.topics.remove(topic);
                true
            }
            _ => {
                self.topics.insert(topic.clone(), LiveStatus::Failed);
                false
            }
        }
    }

    /// 가장 먼저 확인을 기다리는 요청 토픽 (ID 없는 에러 이벤트 귀속용).
    pub fn oldest_pending(&self) -> Option<(Topic, LiveStatus)> {
        self.topics
            .iter()
            .filter(|(_, s)| {
                matches!(s, LiveStatus::PendingSubscribe | LiveStatus::PendingUnsubscribe)
            })
            .map(|(t, s)| (t.clone(), *s))
            .min_by(|a, b| a.0.cmp(&b.0))
    }

    /// 희망 집합 대비 새로 구독해야 할 토픽.
    ///
    /// 확인되었거나 요청 중인 토픽은 제외하고, 실패했거나 해제 중인 토픽은 다시 포함합니다.
    pub fn to_subscribe(&self, desired: &BTreeSet<Topic>) -> Vec<Topic> {
        desired
            .iter()
            .filter(|t| {
                !matches!(
                    self.topics.get(*t),
                    Some(LiveStatus::Acked) | Some(LiveStatus::PendingSubscribe)
                )
            })
            .cloned()
            .collect()
    }

    /// 희망 집합에 없는데 살아 있는 토픽.
    pub fn to_unsubscribe(&self, desired: &BTreeSet<Topic>) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self
            .topics
            .iter()
            .filter(|(t, s)| {
                !desired.contains(*t)
                    && matches!(s, LiveStatus::Acked | LiveStatus::PendingSubscribe)
            })
            .map(|(t, _)| t.clone())
            .collect();
        topics.sort();
        topics
    }
}

/// 토픽 목록을 프레임당 최대 개수로 나눕니다.
pub fn chunk_topics(topics: &[Topic], max_per_frame: usize) -> Vec<Vec<Topic>> {
    topics
        .chunks(max_per_frame.max(1))
        .map(<[Topic]>::to_vec)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(inst: &str) -> Topic {
        Topic::instrument("tickers", inst)
    }

    fn desired(items: &[&str]) -> BTreeSet<Topic> {
        items.iter().map(|i| topic(i)).collect()
    }

    #[test]
    fn test_fresh_connection_subscribes_full_desired_set() {
        let live = LiveSubscriptions::new();
        let wanted = desired(&["A", "B"]);
        assert_eq!(live.to_subscribe(&wanted), vec![topic("A"), topic("B")]);
        assert!(live.to_unsubscribe(&wanted).is_empty());
    }

    #[test]
    fn test_delta_only() {
        let mut live = LiveSubscriptions::new();
        live.mark_subscribing(&[topic("A"), topic("B")]);
        live.ack_subscribe(&topic("A"));

        let wanted = desired(&["B", "C"]);
        assert_eq!(live.to_subscribe(&wanted), vec![topic("C")]);
        assert_eq!(live.to_unsubscribe(&wanted), vec![topic("A")]);
    }

    #[test]
    fn test_failed_topic_retried() {
        let mut live = LiveSubscriptions::new();
        live.mark_subscribing(&[topic("A")]);
        assert!(!live.fail(&topic("A")));
        assert_eq!(live.status(&topic("A")), Some(LiveStatus::Failed));
        assert_eq!(live.to_subscribe(&desired(&["A"])), vec![topic("A")]);
    }

    #[test]
    fn test_unsubscribe_ack_removes() {
        let mut live = LiveSubscriptions::new();
        live.ack_subscribe(&topic("A"));
        live.mark_unsubscribing(&[topic("A")]);
        assert_eq!(live.oldest_pending().map(|(t, _)| t), Some(topic("A")));

        live.ack_unsubscribe(&topic("A"));
        assert!(live.is_empty());
    }

    #[test]
    fn test_chunking() {
        let topics: Vec<Topic> = (0..5).map(|i| topic(&i.to_string())).collect();
        let chunks = chunk_topics(&topics, 2);
        assert_eq!(chunks.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 2, 1]);
        assert_eq!(chunk_topics(&topics, 0).len(), 5);
    }
}
