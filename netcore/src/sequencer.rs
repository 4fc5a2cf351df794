//! 연결별 순차 실행기
//!
//! 한 연결의 콜백을 수신 순서대로 직렬 실행하는 FIFO 워커입니다.
//! 큐가 비면 워커 태스크는 종료하고, 다음 제출 때 다시 하나만 뜹니다.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// FIFO 순차 실행기
///
/// 같은 관찰자가 순서대로 제출한 두 작업은 그 순서대로 실행됩니다.
#[derive(Default)]
pub struct Sequencer {
    queue: Mutex<VecDeque<Task>>,
    running: AtomicBool,
}

impl Sequencer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 작업 제출. 워커가 없으면 새로 시작합니다.
    pub fn submit(self: &Arc<Self>, fut: impl Future<Output = ()> + Send + 'static) {
        self.queue.lock().push_back(Box::pin(fut));
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let seq = self.clone();
            tokio::spawn(async move {
                seq.drain().await;
            });
        }
    }

    /// 현재 적체된 작업 수
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    async fn drain(self: Arc<Self>) {
        loop {
            let task = {
                let mut queue = self.queue.lock();
                match queue.pop_front() {
                    Some(task) => task,
                    None => {
                        // 큐 락을 쥔 채로 내려놓아야 submit 쪽 CAS와 어긋나지 않는다
                        self.running.store(false, Ordering::Release);
                        return;
                    }
                }
            };
            task.await;
        }
    }
}
