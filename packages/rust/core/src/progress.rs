//! Bridge a callback-reporting task into a pull-based stream of updates.
//!
//! [`track_progress`] hands the task a [`ProgressSink`], polls the task and
//! the sink's channel together, and yields every update in order. If nothing
//! arrives within the heartbeat interval a [`Tracked::Heartbeat`] is yielded
//! instead, so consumers see liveness during long LLM batches. The task is
//! polled only while the stream is, and a heartbeat never cancels it.

use std::future::Future;
use std::time::Duration;

use async_stream::stream;
use futures::Stream;
use tokio::sync::mpsc;

/// Sending half handed to a tracked task. Cheap to clone, usable from sync
/// callbacks.
#[derive(Debug)]
pub struct ProgressSink<U> {
    tx: mpsc::UnboundedSender<U>,
}

impl<U> Clone for ProgressSink<U> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<U> ProgressSink<U> {
    /// Queue an update. Dropped silently once the consumer has gone away.
    pub fn send(&self, update: U) {
        let _ = self.tx.send(update);
    }
}

/// One item from a tracked task.
#[derive(Debug)]
pub enum Tracked<U, T> {
    Update(U),
    Heartbeat,
    Done(T),
}

enum Step<U, T> {
    Update(U),
    Closed,
    Idle,
    Finished(T),
}

/// Run `task` and stream its progress. The final item is always `Done`.
pub fn track_progress<U, T, F, Fut>(task: F, heartbeat: Duration) -> impl Stream<Item = Tracked<U, T>>
where
    F: FnOnce(ProgressSink<U>) -> Fut,
    Fut: Future<Output = T>,
{
    stream! {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = task(ProgressSink { tx });
        tokio::pin!(task);
        let mut channel_open = true;

        let output = loop {
            let step = tokio::select! {
                biased;
                update = rx.recv(), if channel_open => match update {
                    Some(update) => Step::Update(update),
                    None => Step::Closed,
                },
                output = &mut task => Step::Finished(output),
                _ = tokio::time::sleep(heartbeat) => Step::Idle,
            };

            match step {
                Step::Update(update) => yield Tracked::Update(update),
                Step::Closed => channel_open = false,
                Step::Idle => yield Tracked::Heartbeat,
                Step::Finished(output) => break output,
            }
        };

        // Updates sent right before the task returned
        while let Ok(update) = rx.try_recv() {
            yield Tracked::Update(update);
        }
        yield Tracked::Done(output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn updates_arrive_in_order_before_done() {
        let items: Vec<Tracked<usize, &str>> = track_progress(
            |sink| async move {
                for i in 1..=3 {
                    sink.send(i);
                }
                "finished"
            },
            Duration::from_secs(5),
        )
        .collect()
        .await;

        let updates: Vec<usize> = items
            .iter()
            .filter_map(|t| match t {
                Tracked::Update(u) => Some(*u),
                _ => None,
            })
            .collect();
        assert_eq!(updates, vec![1, 2, 3]);
        assert!(matches!(items.last(), Some(Tracked::Done("finished"))));
    }

    #[tokio::test]
    async fn quiet_task_produces_heartbeats_and_still_finishes() {
        let items: Vec<Tracked<(), u32>> = track_progress(
            |_sink| async {
                tokio::time::sleep(Duration::from_millis(120)).await;
                7
            },
            Duration::from_millis(25),
        )
        .collect()
        .await;

        let heartbeats = items
            .iter()
            .filter(|t| matches!(t, Tracked::Heartbeat))
            .count();
        assert!(heartbeats >= 2, "got {heartbeats} heartbeats");
        assert!(matches!(items.last(), Some(Tracked::Done(7))));
    }

    #[tokio::test]
    async fn sync_callbacks_can_report() {
        let items: Vec<Tracked<(usize, usize), ()>> = track_progress(
            |sink| async move {
                let report = |done: usize, total: usize| sink.send((done, total));
                report(1, 2);
                tokio::task::yield_now().await;
                report(2, 2);
            },
            Duration::from_secs(5),
        )
        .collect()
        .await;

        assert_eq!(items.len(), 3);
        assert!(matches!(items[0], Tracked::Update((1, 2))));
        assert!(matches!(items[1], Tracked::Update((2, 2))));
    }
}
