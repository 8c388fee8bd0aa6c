//! Per-owner lane scheduling.
//!
//! ## Algorithm
//!
//! Every owner gets a lane holding its queued jobs split by priority class. A lane
//! with a running job is not eligible; at most one job per owner runs at a time.
//!
//! Each eligible lane nominates one candidate:
//!
//! 1. If the lane already ran `max_interactive_burst` interactive jobs in a row
//!    and its oldest ready background job has waited at least `background_aging`,
//!    the background job is nominated (starvation guard).
//! 2. Otherwise the oldest ready interactive job, else the oldest ready background job.
//!
//! Across lanes, candidates are ordered priority-first (a starvation-guard pick
//! ranks as interactive), then FIFO by enqueue time, then by submission sequence.
//!
//! The scheduler is pure: it never reads a clock. Callers pass `now`.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};

use conductor_core::{JobId, OwnerId, Priority};

/// Fairness knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneConfig {
    pub max_interactive_burst: u32,
    pub background_aging: Duration,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            max_interactive_burst: 3,
            background_aging: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    job_id: JobId,
    enqueued_at: DateTime<Utc>,
    ready_at: Option<DateTime<Utc>>,
    seq: u64,
}

impl Entry {
    fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.ready_at.is_none_or(|at| now >= at)
    }
}

#[derive(Debug, Default)]
struct Lane {
    interactive: VecDeque<Entry>,
    background: VecDeque<Entry>,
    running: Option<JobId>,
    interactive_streak: u32,
}

impl Lane {
    fn is_empty(&self) -> bool {
        self.interactive.is_empty() && self.background.is_empty() && self.running.is_none()
    }

    fn queue(&self, priority: Priority) -> &VecDeque<Entry> {
        match priority {
            Priority::Interactive => &self.interactive,
            Priority::Background => &self.background,
        }
    }

    fn first_ready(&self, priority: Priority, now: DateTime<Utc>) -> Option<(usize, &Entry)> {
        self.queue(priority)
            .iter()
            .enumerate()
            .find(|(_, e)| e.is_ready(now))
    }
}

#[derive(Debug)]
struct Nomination {
    owner: OwnerId,
    priority: Priority,
    index: usize,
    rank: (Priority, DateTime<Utc>, u64),
}

/// A job chosen to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pick {
    pub owner_id: OwnerId,
    pub job_id: JobId,
    pub priority: Priority,
    /// Chosen by the starvation guard rather than plain priority order.
    pub aged: bool,
}

/// Lane-based scheduler state.
#[derive(Debug, Default)]
pub struct LaneScheduler {
    config: LaneConfig,
    lanes: BTreeMap<OwnerId, Lane>,
    seq: u64,
}

impl LaneScheduler {
    pub fn new(config: LaneConfig) -> Self {
        Self {
            config,
            lanes: BTreeMap::new(),
            seq: 0,
        }
    }

    pub fn config(&self) -> LaneConfig {
        self.config
    }

    /// Queue a job in its owner's lane.
    pub fn push(
        &mut self,
        owner_id: OwnerId,
        job_id: JobId,
        priority: Priority,
        enqueued_at: DateTime<Utc>,
        ready_at: Option<DateTime<Utc>>,
    ) {
        self.seq += 1;
        let entry = Entry {
            job_id,
            enqueued_at,
            ready_at,
            seq: self.seq,
        };
        let lane = self.lanes.entry(owner_id).or_default();
        let queue = match priority {
            Priority::Interactive => &mut lane.interactive,
            Priority::Background => &mut lane.background,
        };
        // Keep FIFO by enqueue time even when older jobs re-enter after a retry.
        let at = queue
            .iter()
            .position(|e| (e.enqueued_at, e.seq) > (entry.enqueued_at, entry.seq))
            .unwrap_or(queue.len());
        queue.insert(at, entry);
    }

    /// Drop a queued job. Returns `false` if it was not queued.
    pub fn remove(&mut self, owner_id: &OwnerId, job_id: JobId) -> bool {
        let Some(lane) = self.lanes.get_mut(owner_id) else {
            return false;
        };
        let mut removed = false;
        for queue in [&mut lane.interactive, &mut lane.background] {
            if let Some(pos) = queue.iter().position(|e| e.job_id == job_id) {
                queue.remove(pos);
                removed = true;
            }
        }
        if lane.is_empty() {
            self.lanes.remove(owner_id);
        }
        removed
    }

    /// Choose the next job to start and mark its lane busy.
    pub fn pick_next(&mut self, now: DateTime<Utc>) -> Option<Pick> {
        let best = self
            .lanes
            .iter()
            .filter(|(_, lane)| lane.running.is_none())
            .filter_map(|(owner, lane)| self.nominate(owner, lane, now))
            .min_by(|a, b| a.rank.cmp(&b.rank))?;

        let lane = self.lanes.get_mut(&best.owner)?;
        let entry = match best.priority {
            Priority::Interactive => lane.interactive.remove(best.index),
            Priority::Background => lane.background.remove(best.index),
        }?;

        let aged = best.priority == Priority::Background && best.rank.0 == Priority::Interactive;
        match best.priority {
            Priority::Interactive => lane.interactive_streak += 1,
            Priority::Background => lane.interactive_streak = 0,
        }
        lane.running = Some(entry.job_id);

        Some(Pick {
            owner_id: best.owner,
            job_id: entry.job_id,
            priority: best.priority,
            aged,
        })
    }

    fn nominate(&self, owner: &OwnerId, lane: &Lane, now: DateTime<Utc>) -> Option<Nomination> {
        let interactive = lane.first_ready(Priority::Interactive, now);
        let background = lane.first_ready(Priority::Background, now);

        let nominate = |priority, rank_class, (index, entry): (usize, &Entry)| Nomination {
            owner: owner.clone(),
            priority,
            index,
            rank: (rank_class, entry.enqueued_at, entry.seq),
        };

        if lane.interactive_streak >= self.config.max_interactive_burst {
            if let Some(bg) = background.filter(|(_, e)| self.has_aged(e, now)) {
                return Some(nominate(Priority::Background, Priority::Interactive, bg));
            }
        }

        match (interactive, background) {
            (Some(i), _) => Some(nominate(Priority::Interactive, Priority::Interactive, i)),
            (None, Some(b)) => Some(nominate(Priority::Background, Priority::Background, b)),
            (None, None) => None,
        }
    }

    fn has_aged(&self, entry: &Entry, now: DateTime<Utc>) -> bool {
        let waited = now.signed_duration_since(entry.enqueued_at);
        waited.to_std().is_ok_and(|w| w >= self.config.background_aging)
    }

    /// Release the owner's lane after its running job settled.
    pub fn finish(&mut self, owner_id: &OwnerId, job_id: JobId) {
        if let Some(lane) = self.lanes.get_mut(owner_id) {
            if lane.running == Some(job_id) {
                lane.running = None;
            }
            if lane.is_empty() {
                self.lanes.remove(owner_id);
            }
        }
    }

    /// Earliest future time a not-yet-ready job becomes ready.
    pub fn next_ready_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.lanes
            .values()
            .flat_map(|lane| lane.interactive.iter().chain(lane.background.iter()))
            .filter_map(|e| e.ready_at.filter(|at| *at > now))
            .min()
    }

    pub fn queued_len(&self) -> usize {
        self.lanes
            .values()
            .map(|l| l.interactive.len() + l.background.len())
            .sum()
    }

    pub fn running_len(&self) -> usize {
        self.lanes.values().filter(|l| l.running.is_some()).count()
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Remove and return every queued job id.
    pub fn drain_queued(&mut self) -> Vec<(OwnerId, JobId)> {
        let mut out = Vec::new();
        for (owner, lane) in self.lanes.iter_mut() {
            for e in lane.interactive.drain(..).chain(lane.background.drain(..)) {
                out.push((owner.clone(), e.job_id));
            }
        }
        self.lanes.retain(|_, lane| !lane.is_empty());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(s: &str) -> OwnerId {
        OwnerId::parse(s).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn one_running_job_per_lane() {
        let mut s = LaneScheduler::new(LaneConfig::default());
        let (a, b) = (JobId::new(), JobId::new());
        s.push(owner("p1"), a, Priority::Background, at(0), None);
        s.push(owner("p1"), b, Priority::Background, at(1), None);

        assert_eq!(s.pick_next(at(2)).unwrap().job_id, a);
        assert!(s.pick_next(at(2)).is_none());

        s.finish(&owner("p1"), a);
        assert_eq!(s.pick_next(at(2)).unwrap().job_id, b);
    }

    #[test]
    fn interactive_beats_older_background_across_lanes() {
        let mut s = LaneScheduler::new(LaneConfig::default());
        let bg = JobId::new();
        let fg = JobId::new();
        s.push(owner("p1"), bg, Priority::Background, at(0), None);
        s.push(owner("p2"), fg, Priority::Interactive, at(5), None);

        assert_eq!(s.pick_next(at(6)).unwrap().job_id, fg);
        assert_eq!(s.pick_next(at(6)).unwrap().job_id, bg);
    }

    #[test]
    fn aged_background_runs_by_the_fourth_slot() {
        let config = LaneConfig {
            max_interactive_burst: 3,
            background_aging: Duration::from_secs(10),
        };
        let mut s = LaneScheduler::new(config);
        let p = owner("p1");
        let bg = JobId::new();
        s.push(p.clone(), bg, Priority::Background, at(0), None);
        for i in 0..5 {
            s.push(p.clone(), JobId::new(), Priority::Interactive, at(20 + i), None);
        }

        let now = at(30);
        let mut order = Vec::new();
        while let Some(pick) = s.pick_next(now) {
            order.push(pick.clone());
            s.finish(&p, pick.job_id);
        }

        let slot = order.iter().position(|p| p.job_id == bg).unwrap();
        assert_eq!(slot, 3);
        assert!(order[3].aged);
        assert_eq!(order.len(), 6);
    }

    #[test]
    fn young_background_waits_behind_interactive() {
        let config = LaneConfig {
            max_interactive_burst: 1,
            background_aging: Duration::from_secs(60),
        };
        let mut s = LaneScheduler::new(config);
        let p = owner("p1");
        let bg = JobId::new();
        s.push(p.clone(), bg, Priority::Background, at(0), None);
        s.push(p.clone(), JobId::new(), Priority::Interactive, at(1), None);
        s.push(p.clone(), JobId::new(), Priority::Interactive, at(2), None);

        for _ in 0..2 {
            let pick = s.pick_next(at(5)).unwrap();
            assert_eq!(pick.priority, Priority::Interactive);
            s.finish(&p, pick.job_id);
        }
        assert_eq!(s.pick_next(at(5)).unwrap().job_id, bg);
    }

    #[test]
    fn not_ready_jobs_are_skipped_until_due() {
        let mut s = LaneScheduler::new(LaneConfig::default());
        let later = JobId::new();
        s.push(owner("p1"), later, Priority::Interactive, at(0), Some(at(10)));

        assert!(s.pick_next(at(5)).is_none());
        assert_eq!(s.next_ready_at(at(5)), Some(at(10)));
        assert_eq!(s.pick_next(at(10)).unwrap().job_id, later);
    }

    #[test]
    fn removed_jobs_are_never_picked() {
        let mut s = LaneScheduler::new(LaneConfig::default());
        let j = JobId::new();
        s.push(owner("p1"), j, Priority::Background, at(0), None);

        assert!(s.remove(&owner("p1"), j));
        assert!(!s.remove(&owner("p1"), j));
        assert!(s.pick_next(at(1)).is_none());
        assert_eq!(s.lane_count(), 0);
    }

    mod properties {
        use std::collections::HashSet;

        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn every_job_runs_once_and_lanes_stay_serialized(
                jobs in proptest::collection::vec((0usize..4, any::<bool>(), 0i64..100), 1..40)
            ) {
                let mut s = LaneScheduler::new(LaneConfig {
                    max_interactive_burst: 2,
                    background_aging: Duration::from_secs(5),
                });
                let mut expected = HashSet::new();
                for (o, interactive, t) in &jobs {
                    let id = JobId::new();
                    expected.insert(id);
                    let priority = if *interactive { Priority::Interactive } else { Priority::Background };
                    s.push(owner(&format!("o{o}")), id, priority, at(*t), None);
                }

                let now = at(1_000);
                let mut seen = HashSet::new();
                loop {
                    // Start as many as the lanes allow, then settle them all.
                    let mut started = Vec::new();
                    while let Some(pick) = s.pick_next(now) {
                        prop_assert!(!started.iter().any(|p: &Pick| p.owner_id == pick.owner_id));
                        started.push(pick);
                    }
                    if started.is_empty() {
                        break;
                    }
                    for pick in started {
                        prop_assert!(seen.insert(pick.job_id));
                        s.finish(&pick.owner_id, pick.job_id);
                    }
                }

                prop_assert_eq!(seen, expected);
                prop_assert_eq!(s.queued_len(), 0);
            }

            #[test]
            fn background_never_waits_more_than_burst_slots_once_aged(
                interactive in 1usize..12, burst in 1u32..5
            ) {
                let mut s = LaneScheduler::new(LaneConfig {
                    max_interactive_burst: burst,
                    background_aging: Duration::from_secs(1),
                });
                let p = owner("p");
                let bg = JobId::new();
                s.push(p.clone(), bg, Priority::Background, at(0), None);
                for i in 0..interactive {
                    s.push(p.clone(), JobId::new(), Priority::Interactive, at(10 + i as i64), None);
                }

                let mut slot = 0usize;
                while let Some(pick) = s.pick_next(at(100)) {
                    if pick.job_id == bg {
                        break;
                    }
                    slot += 1;
                    s.finish(&p, pick.job_id);
                }
                prop_assert!(slot <= burst as usize);
            }
        }
    }
}
