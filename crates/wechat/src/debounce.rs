//! Coalescing bursts of messages from one sender into a single turn.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    moltis_channels::gating::{Mention, ToolPolicy},
    tokio::{sync::mpsc, task::AbortHandle},
    tracing::debug,
};

use crate::frames::InboundEvent;

/// An event that passed access policy, with the tool policy resolved for it.
#[derive(Debug, Clone)]
pub struct AdmittedEvent {
    pub event: InboundEvent,
    pub tools: Option<ToolPolicy>,
}

/// One logical turn leaving the debouncer.
#[derive(Debug, Clone)]
pub struct DebouncedTurn {
    pub account_id: String,
    /// The merged event. Equals the buffered event when the turn holds
    /// only one.
    pub event: InboundEvent,
    pub tools: Option<ToolPolicy>,
    /// Ids of every backend message folded into this turn, in arrival order.
    pub message_ids: Vec<i64>,
}

type BucketKey = (String, String, String);

struct Bucket {
    items: Vec<AdmittedEvent>,
    /// Unique across the debouncer's lifetime, so a timer armed for a
    /// removed bucket never matches its replacement.
    generation: u64,
    timer: AbortHandle,
}

type Buckets = Arc<Mutex<HashMap<BucketKey, Bucket>>>;

/// Per-(account, conversation, sender) idle-window buffer.
///
/// Every admitted event ends up in exactly one emitted turn.
#[derive(Clone)]
pub struct InboundDebouncer {
    window: Duration,
    buckets: Buckets,
    generations: Arc<AtomicU64>,
    out: mpsc::UnboundedSender<DebouncedTurn>,
}

impl InboundDebouncer {
    /// A zero `window` disables buffering.
    pub fn new(window: Duration, out: mpsc::UnboundedSender<DebouncedTurn>) -> Self {
        Self {
            window,
            buckets: Arc::new(Mutex::new(HashMap::new())),
            generations: Arc::new(AtomicU64::new(0)),
            out,
        }
    }

    pub fn push(&self, account_id: &str, admitted: AdmittedEvent) {
        let chat_id = admitted.event.chat_wxid.trim();
        let sender_id = admitted.event.sender_wxid.trim();
        if self.window.is_zero()
            || account_id.is_empty()
            || chat_id.is_empty()
            || sender_id.is_empty()
        {
            emit(&self.out, account_id, vec![admitted]);
            return;
        }

        let key: BucketKey = (
            account_id.to_string(),
            chat_id.to_string(),
            sender_id.to_string(),
        );
        let text = admitted.event.text().trim();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());

        if text.is_empty() || is_control_command(text) {
            if let Some(bucket) = buckets.remove(&key) {
                bucket.timer.abort();
                emit(&self.out, account_id, bucket.items);
            }
            drop(buckets);
            emit(&self.out, account_id, vec![admitted]);
            return;
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let timer = self.spawn_timer(key.clone(), generation);
        let buffered = match buckets.get_mut(&key) {
            Some(bucket) => {
                bucket.timer.abort();
                bucket.timer = timer;
                bucket.generation = generation;
                bucket.items.push(admitted);
                bucket.items.len()
            },
            None => {
                buckets.insert(key, Bucket {
                    items: vec![admitted],
                    generation,
                    timer,
                });
                1
            },
        };
        debug!(account_id, buffered, "debouncing inbound message");
    }

    fn spawn_timer(&self, key: BucketKey, generation: u64) -> AbortHandle {
        let buckets = Arc::clone(&self.buckets);
        let out = self.out.clone();
        let window = self.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            flush_if_current(&buckets, &out, &key, generation);
        })
        .abort_handle()
    }

    /// Force-flush every bucket belonging to `account_id`.
    pub fn flush_account(&self, account_id: &str) {
        let drained: Vec<Bucket> = {
            let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
            let keys: Vec<BucketKey> = buckets
                .keys()
                .filter(|k| k.0 == account_id)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| buckets.remove(k)).collect()
        };
        for bucket in drained {
            bucket.timer.abort();
            emit(&self.out, account_id, bucket.items);
        }
    }

    /// Number of keys with buffered events.
    pub fn pending(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// Flush the bucket at `key` if it is still the one armed with `generation`.
/// A newer event may have re-armed (or replaced) the bucket after the timer
/// elapsed but before it got the lock.
fn flush_if_current(
    buckets: &Buckets,
    out: &mpsc::UnboundedSender<DebouncedTurn>,
    key: &BucketKey,
    generation: u64,
) -> bool {
    let mut map = buckets.lock().unwrap_or_else(|e| e.into_inner());
    if !map.get(key).is_some_and(|b| b.generation == generation) {
        return false;
    }
    let Some(bucket) = map.remove(key) else {
        return false;
    };
    drop(map);
    emit(out, &key.0, bucket.items);
    true
}

/// `/cmd`-style input bypasses buffering.
#[must_use]
pub fn is_control_command(text: &str) -> bool {
    let mut chars = text.trim_start().chars();
    chars.next() == Some('/') && chars.next().is_some_and(char::is_alphabetic)
}

fn emit(out: &mpsc::UnboundedSender<DebouncedTurn>, account_id: &str, items: Vec<AdmittedEvent>) {
    if let Some(turn) = merge(account_id, items)
        && out.send(turn).is_err()
    {
        debug!(account_id, "turn receiver dropped, discarding turn");
    }
}

/// Fold buffered events into one turn: texts joined with newlines in
/// arrival order, mention flags OR-ed, everything else from the last event.
fn merge(account_id: &str, items: Vec<AdmittedEvent>) -> Option<DebouncedTurn> {
    let message_ids = items.iter().map(|a| a.event.msg_id).collect();
    if items.len() == 1 {
        let single = items.into_iter().next()?;
        return Some(DebouncedTurn {
            account_id: account_id.to_string(),
            event: single.event,
            tools: single.tools,
            message_ids,
        });
    }

    let text = items
        .iter()
        .map(|a| a.event.text())
        .filter(|t| !t.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    let mention = items
        .iter()
        .fold(Mention::default(), |acc, a| acc.or(a.event.is_at_me));
    let last = items.into_iter().last()?;
    let mut event = last.event;
    event.content = Some(text);
    event.is_at_me = mention;
    Some(DebouncedTurn {
        account_id: account_id.to_string(),
        event,
        tools: last.tools,
        message_ids,
    })
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        rstest::rstest,
        tokio::time::{sleep, timeout},
    };

    fn admitted(id: i64, text: &str, mention: Mention) -> AdmittedEvent {
        AdmittedEvent {
            event: InboundEvent {
                msg_id: id,
                content: Some(text.into()),
                sender_wxid: "wxid_a".into(),
                chat_wxid: "g@chatroom".into(),
                is_group: true,
                is_at_me: mention,
                ..Default::default()
            },
            tools: None,
        }
    }

    fn debouncer(ms: u64) -> (InboundDebouncer, mpsc::UnboundedReceiver<DebouncedTurn>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (InboundDebouncer::new(Duration::from_millis(ms), tx), rx)
    }

    #[rstest]
    #[case("/help", true)]
    #[case("  /reset now", true)]
    #[case("/", false)]
    #[case("/123", false)]
    #[case("hello /help", false)]
    fn control_command_detection(#[case] text: &str, #[case] expected: bool) {
        assert_eq!(is_control_command(text), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_window_passes_through() {
        let (d, mut rx) = debouncer(0);
        d.push("main", admitted(1, "a", Mention::Unknown));
        let turn = rx.try_recv().unwrap();
        assert_eq!(turn.message_ids, vec![1]);
        assert_eq!(d.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_merged_after_idle_window() {
        let (d, mut rx) = debouncer(500);
        d.push("main", admitted(1, "a", Mention::NotMentioned));
        d.push("main", admitted(2, "b", Mention::Mentioned));
        d.push("main", admitted(3, "c", Mention::NotMentioned));
        assert!(rx.try_recv().is_err());

        let turn = rx.recv().await.unwrap();
        assert_eq!(turn.event.text(), "a\nb\nc");
        assert!(turn.event.is_at_me.is_mentioned());
        assert_eq!(turn.event.msg_id, 3);
        assert_eq!(turn.message_ids, vec![1, 2, 3]);
        assert_eq!(d.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn each_event_resets_the_timer() {
        let (d, mut rx) = debouncer(500);
        d.push("main", admitted(1, "a", Mention::Unknown));
        sleep(Duration::from_millis(300)).await;
        d.push("main", admitted(2, "b", Mention::Unknown));
        // The first timer would have fired at 500ms.
        assert!(timeout(Duration::from_millis(400), rx.recv()).await.is_err());
        let turn = rx.recv().await.unwrap();
        assert_eq!(turn.message_ids, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn single_buffered_event_is_forwarded_unchanged() {
        let (d, mut rx) = debouncer(100);
        let original = admitted(9, "only", Mention::Unknown);
        d.push("main", original.clone());
        let turn = rx.recv().await.unwrap();
        assert_eq!(turn.event, original.event);
    }

    #[tokio::test(start_paused = true)]
    async fn control_command_flushes_then_goes_alone() {
        let (d, mut rx) = debouncer(500);
        d.push("main", admitted(1, "a", Mention::Unknown));
        d.push("main", admitted(2, "b", Mention::Unknown));
        d.push("main", admitted(3, "/reset", Mention::Unknown));

        let flushed = rx.try_recv().unwrap();
        assert_eq!(flushed.message_ids, vec![1, 2]);
        let command = rx.try_recv().unwrap();
        assert_eq!(command.event.text(), "/reset");
        assert_eq!(d.pending(), 0);

        // A fresh bucket starts afterwards.
        d.push("main", admitted(4, "c", Mention::Unknown));
        let next = rx.recv().await.unwrap();
        assert_eq!(next.message_ids, vec![4]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_leaves_replacement_bucket_alone() {
        let (d, mut rx) = debouncer(500);
        d.push("main", admitted(1, "a", Mention::Unknown));
        let key: BucketKey = ("main".into(), "g@chatroom".into(), "wxid_a".into());
        let stale = d.buckets.lock().unwrap().get(&key).unwrap().generation;

        d.push("main", admitted(2, "/reset", Mention::Unknown));
        d.push("main", admitted(3, "b", Mention::Unknown));
        rx.try_recv().unwrap();
        rx.try_recv().unwrap();

        // The first bucket's timer wakes up late, after its bucket was replaced.
        assert!(!flush_if_current(&d.buckets, &d.out, &key, stale));
        assert!(rx.try_recv().is_err());
        assert_eq!(d.pending(), 1);

        let turn = rx.recv().await.unwrap();
        assert_eq!(turn.message_ids, vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_text_is_not_buffered() {
        let (d, mut rx) = debouncer(500);
        d.push("main", admitted(1, "", Mention::Unknown));
        assert_eq!(rx.try_recv().unwrap().message_ids, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn senders_get_separate_buckets() {
        let (d, mut rx) = debouncer(200);
        let mut other = admitted(2, "b", Mention::Unknown);
        other.event.sender_wxid = "wxid_b".into();
        d.push("main", admitted(1, "a", Mention::Unknown));
        d.push("main", other);
        assert_eq!(d.pending(), 2);

        let mut ids = vec![
            rx.recv().await.unwrap().message_ids,
            rx.recv().await.unwrap().message_ids,
        ];
        ids.sort();
        assert_eq!(ids, vec![vec![1], vec![2]]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_account_drains_only_that_account() {
        let (d, mut rx) = debouncer(10_000);
        d.push("main", admitted(1, "a", Mention::Unknown));
        d.push("side", admitted(2, "b", Mention::Unknown));
        d.flush_account("main");
        let turn = rx.try_recv().unwrap();
        assert_eq!(turn.account_id, "main");
        assert!(rx.try_recv().is_err());
        assert_eq!(d.pending(), 1);
    }
}
