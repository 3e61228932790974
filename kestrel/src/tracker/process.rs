use crate::config::KsLimits;
use crate::selectors::matcher::Approvals;
use crate::utils::vec_to_string;
use chrono::{DateTime, Utc};
use kestrel_common::models::{KsEvent, KsEventType};
use kestrel_common::utils::str_from_buf_nul;
use moka::future::Cache;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub(crate) struct KsProcess {
    pub created: DateTime<Utc>,
    pub pid: u32,
    pub tgid: u32,
    pub ppid: Option<u32>,
    pub uid: u32,
    pub gid: u32,
    pub comm: String,
    pub children: Vec<u32>,
    pub selector_hits: Vec<u32>,
}

impl KsProcess {
    fn from_event(e: &KsEvent) -> KsProcess {
        KsProcess {
            created: Utc::now(),
            pid: e.pid,
            tgid: e.tgid,
            ppid: if e.ppid != 0 { Some(e.ppid) } else { None },
            uid: e.uid,
            gid: e.gid,
            comm: str_from_buf_nul(&e.comm).unwrap_or("").to_string(),
            children: Vec::new(),
            selector_hits: Vec::new(),
        }
    }

    fn emit_log_entry(&self, e: &KsEvent) {
        let args = &e.args[..(e.arg_count as usize).min(e.args.len())];
        info!(
            target: "event",
            event_type = format!("{:?}", e.event_type),
            attach_idx = e.attach_idx,
            selector_id = e.selector_id,
            tgid = self.tgid,
            pid = self.pid,
            uid = self.uid,
            gid = self.gid,
            command = self.comm,
            args = vec_to_string(args),
        );
    }
}

/// Consumes matched events off the perf pipeline and keeps a bounded cache
/// of the processes behind them. Fork events also feed the follow-forks
/// approval set shared with the reload path, which clears it whenever a new
/// selector configuration goes live.
pub(crate) struct KsProcessTracker {
    pub snd: crossbeam_channel::Sender<KsEvent>,
}

impl KsProcessTracker {
    pub(crate) fn new(
        limits: &KsLimits,
        approvals: Arc<Mutex<Approvals>>,
    ) -> Result<KsProcessTracker, anyhow::Error> {
        let (snd, recv) = crossbeam_channel::bounded::<KsEvent>(limits.channel_depth);

        let tracker = KsProcessTracker { snd };
        tracker.run(recv, limits.max_tracked, approvals)?;
        Ok(tracker)
    }

    fn run(
        &self,
        recv: crossbeam_channel::Receiver<KsEvent>,
        max_tracked: u64,
        approvals: Arc<Mutex<Approvals>>,
    ) -> Result<(), anyhow::Error> {
        let tracker: Cache<u32, Arc<KsProcess>> =
            Cache::builder().max_capacity(max_tracked).build();
        let thread_tracker = tracker.clone();

        tokio::spawn(async move {
            let mut rate_timer = Instant::now();
            let mut rate_count = 0u64;

            loop {
                match recv.recv() {
                    Ok(event) => {
                        rate_count += 1;
                        let elapsed = rate_timer.elapsed().as_secs();
                        if elapsed >= 60 {
                            info!(target: "event", "Events per second: {}", rate_count / elapsed);
                            rate_count = 0;
                            rate_timer = Instant::now();
                        }

                        apply_event(&thread_tracker, &approvals, event).await;
                    }
                    Err(e) => {
                        error!(target: "error", "Event channel closed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(())
    }
}

/// Folds one event into the process table. `Cache::get` hands out a clone
/// of the stored Arc, so any parent mutation has to be written back with an
/// insert to take effect.
async fn apply_event(
    tracker: &Cache<u32, Arc<KsProcess>>,
    approvals: &Mutex<Approvals>,
    event: KsEvent,
) {
    match event.event_type {
        KsEventType::Exit => {
            if event.ppid != 0 {
                if let Some(mut entry) = tracker.get(&event.ppid).await {
                    let e = Arc::<KsProcess>::make_mut(&mut entry);
                    if let Some(pos) = e.children.iter().position(|c| *c == event.pid) {
                        e.children.remove(pos);
                        tracker.insert(event.ppid, entry).await;
                    }
                }
            }
            tracker.invalidate(&event.pid).await;
            return;
        }
        KsEventType::Fork => {
            approvals.lock().note_fork(event.ppid, event.pid);
        }
        _ => (),
    }

    if event.ppid != 0 {
        if let Some(mut entry) = tracker.get(&event.ppid).await {
            let e = Arc::<KsProcess>::make_mut(&mut entry);
            if !e.children.contains(&event.pid) {
                e.children.push(event.pid);
                tracker.insert(event.ppid, entry).await;
            }
        }
    }

    tracker
        .entry(event.pid)
        .and_upsert_with(|loc| {
            let mut proc = match loc {
                Some(entry) => {
                    let mut arc_e = entry.into_value();
                    let e = Arc::<KsProcess>::make_mut(&mut arc_e);
                    if e.comm.is_empty() && event.comm[0] > 0 {
                        e.comm = str_from_buf_nul(&event.comm).unwrap_or("").to_string();
                    }
                    if e.ppid.is_none() && event.ppid != 0 {
                        e.ppid = Some(event.ppid);
                    }
                    arc_e
                }
                None => Arc::new(KsProcess::from_event(&event)),
            };

            if event.selector_id != 0 {
                let e = Arc::<KsProcess>::make_mut(&mut proc);
                if !e.selector_hits.contains(&event.selector_id) {
                    e.selector_hits.push(event.selector_id);
                }
                e.emit_log_entry(&event);
            }

            std::future::ready(proc)
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::models::KsProbeClass;
    use kestrel_common::ARGS_PER_SELECTOR;

    fn event(event_type: KsEventType, pid: u32, ppid: u32) -> KsEvent {
        let mut comm = [0u8; 64];
        comm[..4].copy_from_slice(b"test");
        KsEvent {
            class: KsProbeClass::Tracepoint,
            event_type,
            attach_idx: 0,
            selector_id: 1,
            pid,
            tgid: pid,
            ppid,
            ns_pid: pid,
            uid: 0,
            gid: 0,
            arg_count: 0,
            _pad: 0,
            args: [0; ARGS_PER_SELECTOR],
            comm,
        }
    }

    #[tokio::test]
    async fn children_are_written_back_to_the_cache() {
        let tracker: Cache<u32, Arc<KsProcess>> = Cache::builder().max_capacity(16).build();
        let approvals = Mutex::new(Approvals::new());

        apply_event(&tracker, &approvals, event(KsEventType::Exec, 100, 0)).await;
        apply_event(&tracker, &approvals, event(KsEventType::Fork, 101, 100)).await;

        let parent = tracker.get(&100).await.unwrap();
        assert_eq!(parent.children, vec![101]);

        apply_event(&tracker, &approvals, event(KsEventType::Exit, 101, 100)).await;
        let parent = tracker.get(&100).await.unwrap();
        assert!(parent.children.is_empty());
        assert!(tracker.get(&101).await.is_none());
    }

    #[tokio::test]
    async fn fork_feeds_the_approval_set() {
        let tracker: Cache<u32, Arc<KsProcess>> = Cache::builder().max_capacity(16).build();
        let approvals = Mutex::new(Approvals::new());
        approvals.lock().approve(100);

        apply_event(&tracker, &approvals, event(KsEventType::Fork, 101, 100)).await;
        assert!(approvals.lock().contains(101));
    }
}
