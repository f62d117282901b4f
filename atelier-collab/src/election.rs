//! Join-order leader election over the presence channel.
//!
//! ```text
//!  register ──► probe ──(live claim)──────────────────────► adopt
//!                 │
//!                 └─(none)─► stabilize ─► elect ─► publish (leader only)
//!                              ▲                       │
//!                              └──── membership change ┘   re-run
//! ```
//!
//! Every client runs the same deterministic computation over its presence
//! snapshot: smallest join time wins. Only the winner writes a
//! `global_master_state` claim, into its own entry. Competing claims during
//! churn are resolved best-effort through cleanup requests and the liveness
//! check in `probe`; there is no fencing.
//!
//! The algorithm is sans-IO (`elect`, `Stabilizer`, `LeaderElection`);
//! `run_election` drives it with `tokio::time` against an [`ElectionHost`].

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::presence::{
    compare_join_time, now_millis, CleanupRequest, MasterState, PresenceEntry, PresenceUser,
};

/// Stabilization parameters.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Delay between membership polls
    pub poll_interval: Duration,
    /// Hard cap on polls before electing anyway
    pub max_polls: u32,
    /// Consecutive unchanged polls required to proceed, not counting the
    /// first poll, which only sets the baseline
    pub stability_streak: u32,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_polls: 10,
            stability_streak: 2,
        }
    }
}

/// A registered session eligible for leadership.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub session_id: Uuid,
    pub user_id: String,
    pub name: String,
    pub join_time: f64,
}

impl Candidate {
    fn from_entry(session_id: Uuid, user: &PresenceUser) -> Self {
        Self {
            session_id,
            user_id: user.id.clone(),
            name: user.name.clone(),
            join_time: user.join_time,
        }
    }

    /// Earlier join time first; equal join times fall back to user id, then
    /// session id, so the order never depends on iteration order.
    fn rank(&self, other: &Self) -> Ordering {
        compare_join_time(self.join_time, other.join_time)
            .then_with(|| self.user_id.cmp(&other.user_id))
            .then_with(|| self.session_id.cmp(&other.session_id))
    }
}

fn candidates(entries: &[(Uuid, PresenceEntry)]) -> Vec<Candidate> {
    let mut by_user: HashMap<&str, Candidate> = HashMap::new();
    for (session, entry) in entries {
        let (Some(user), Some(user_id)) = (entry.user.as_ref(), entry.user_id()) else {
            continue;
        };
        let candidate = Candidate::from_entry(*session, user);
        let replace = by_user
            .get(user_id)
            .map_or(true, |kept| kept.rank(&candidate) == Ordering::Greater);
        if replace {
            by_user.insert(user_id, candidate);
        }
    }

    let mut list: Vec<Candidate> = by_user.into_values().collect();
    list.sort_by(Candidate::rank);
    list
}

/// Pick the leader: dedup by user id keeping the earliest join, then the
/// earliest join overall. `None` when no entry carries a user id.
pub fn elect(entries: &[(Uuid, PresenceEntry)]) -> Option<Candidate> {
    candidates(entries).into_iter().next()
}

/// A published claim whose master still has a live, registered entry.
///
/// With several live claims the one naming the earliest-joined master wins,
/// then the highest version.
pub fn find_adoptable_master(entries: &[(Uuid, PresenceEntry)]) -> Option<MasterState> {
    let live: HashMap<&str, f64> = entries
        .iter()
        .filter_map(|(_, e)| e.user.as_ref())
        .filter(|u| !u.id.is_empty())
        .fold(HashMap::new(), |mut acc, u| {
            acc.entry(u.id.as_str())
                .and_modify(|t: &mut f64| *t = t.min(u.join_time))
                .or_insert(u.join_time);
            acc
        });

    entries
        .iter()
        .filter_map(|(_, e)| e.global_master_state.as_ref())
        .filter_map(|claim| live.get(claim.master_id.as_str()).map(|t| (*t, claim)))
        .min_by(|(ta, a), (tb, b)| {
            compare_join_time(*ta, *tb)
                .then_with(|| b.version.cmp(&a.version))
                .then_with(|| a.master_id.cmp(&b.master_id))
        })
        .map(|(_, claim)| claim.clone())
}

fn highest_version(entries: &[(Uuid, PresenceEntry)]) -> u64 {
    entries
        .iter()
        .filter_map(|(_, e)| e.global_master_state.as_ref())
        .map(|claim| claim.version)
        .max()
        .unwrap_or(0)
}

// ───────────────────────────────────────────────────────────────────
// Stabilization
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StabilizerStep {
    /// Membership still moving; poll again
    Wait,
    /// Count unchanged for the required streak
    Ready,
    /// Poll cap reached; elect with what we have
    TimedOut,
}

/// Counts consecutive polls with an unchanged participant count.
#[derive(Debug, Clone)]
pub struct Stabilizer {
    last_count: Option<usize>,
    streak: u32,
    polls: u32,
    max_polls: u32,
    stability_streak: u32,
}

impl Stabilizer {
    pub fn new(config: &ElectionConfig) -> Self {
        Self {
            last_count: None,
            streak: 0,
            polls: 0,
            max_polls: config.max_polls,
            stability_streak: config.stability_streak,
        }
    }

    pub fn observe(&mut self, count: usize) -> StabilizerStep {
        self.polls += 1;
        if self.last_count == Some(count) {
            self.streak += 1;
        } else {
            self.last_count = Some(count);
            self.streak = 0;
        }

        if self.streak >= self.stability_streak {
            StabilizerStep::Ready
        } else if self.polls >= self.max_polls {
            StabilizerStep::TimedOut
        } else {
            StabilizerStep::Wait
        }
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }
}

// ───────────────────────────────────────────────────────────────────
// Per-client decision state
// ───────────────────────────────────────────────────────────────────

/// What a round concluded and what the host must publish.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Probe found a live claim.
    Adopted { master: MasterState, is_self: bool },
    /// We won; publish `claim` (and `cleanup` when others hold claims).
    Lead {
        claim: MasterState,
        cleanup: Option<CleanupRequest>,
    },
    /// Someone else won.
    Follow { master: Candidate },
    /// Nobody is registered.
    NoLeader,
}

impl Decision {
    pub fn master_user_id(&self) -> Option<&str> {
        match self {
            Decision::Adopted { master, .. } => Some(&master.master_id),
            Decision::Lead { claim, .. } => Some(&claim.master_id),
            Decision::Follow { master, .. } => Some(&master.user_id),
            Decision::NoLeader => None,
        }
    }

    pub fn is_master(&self) -> bool {
        matches!(
            self,
            Decision::Lead { .. } | Decision::Adopted { is_self: true, .. }
        )
    }

    /// Bring our own presence entry in line with this decision. Returns
    /// true when the entry changed and has to be re-broadcast.
    ///
    /// Anything but leading clears a claim still sitting in the entry, even
    /// one left behind by an earlier round that was cut off mid-publish.
    pub fn apply_to(&self, entry: &mut PresenceEntry) -> bool {
        match self {
            Decision::Lead { claim, cleanup } => {
                entry.global_master_state = Some(claim.clone());
                entry.cleanup_request = cleanup.clone();
                true
            }
            Decision::Adopted { is_self: true, .. } => false,
            _ => {
                let had_claim = entry.global_master_state.take().is_some();
                let had_request = entry.cleanup_request.take().is_some();
                had_claim || had_request
            }
        }
    }
}

/// Current view of who leads the room.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterView {
    pub user_id: String,
    pub name: String,
    pub is_self: bool,
}

/// Election state of one session.
pub struct LeaderElection {
    session_id: Uuid,
    user: Option<PresenceUser>,
    own_claim: Option<MasterState>,
    master: Option<MasterView>,
}

impl LeaderElection {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            user: None,
            own_claim: None,
            master: None,
        }
    }

    /// Phase 1: stamp our identity once. Later calls return the same user.
    pub fn register(&mut self, id: &str, name: &str, color: &str) -> PresenceUser {
        self.user
            .get_or_insert_with(|| PresenceUser::register(id, name, color, self.session_id))
            .clone()
    }

    pub fn user(&self) -> Option<&PresenceUser> {
        self.user.as_ref()
    }

    /// Phase 2: look for a live published claim.
    pub fn probe(&self, entries: &[(Uuid, PresenceEntry)]) -> Option<MasterState> {
        find_adoptable_master(entries)
    }

    /// Accept a live claim found by `probe`.
    pub fn adopt(&mut self, master: MasterState) -> Decision {
        let is_self = master.elected_by == self.session_id.to_string();
        self.own_claim = is_self.then(|| master.clone());
        self.master = Some(MasterView {
            user_id: master.master_id.clone(),
            name: master.master_name.clone(),
            is_self,
        });
        Decision::Adopted { master, is_self }
    }

    /// Phases 4 and 5: elect over the snapshot and say what to publish.
    pub fn decide(&mut self, entries: &[(Uuid, PresenceEntry)]) -> Decision {
        let Some(winner) = elect(entries) else {
            self.master = None;
            self.own_claim = None;
            return Decision::NoLeader;
        };

        if winner.session_id != self.session_id {
            self.master = Some(MasterView {
                user_id: winner.user_id.clone(),
                name: winner.name.clone(),
                is_self: false,
            });
            self.own_claim = None;
            return Decision::Follow { master: winner };
        }

        let version = highest_version(entries)
            .max(self.own_claim.as_ref().map_or(0, |c| c.version))
            + 1;
        let total_users = candidates(entries).len() as u32;
        let claim = MasterState {
            master_id: winner.user_id.clone(),
            master_name: winner.name.clone(),
            elected_at: now_millis(),
            total_users,
            elected_by: self.session_id.to_string(),
            version,
        };
        let others_claim = entries
            .iter()
            .any(|(s, e)| *s != self.session_id && e.global_master_state.is_some());
        let cleanup = others_claim.then(|| CleanupRequest {
            requested_by: winner.user_id.clone(),
            version,
            timestamp: now_millis(),
        });

        log::info!(
            "session {} elected master ({}, v{version}, {total_users} users)",
            self.session_id,
            winner.name
        );
        self.own_claim = Some(claim.clone());
        self.master = Some(MasterView {
            user_id: winner.user_id,
            name: winner.name,
            is_self: true,
        });
        Decision::Lead { claim, cleanup }
    }

    /// A peer asked stale claim holders to clear. `entry_holds_claim` is
    /// whether our presence entry still carries a claim, which can outlive
    /// `own_claim` when a round is aborted before publishing. Returns true
    /// when the claim must go: only a requester that outranks us is obeyed.
    pub fn handle_cleanup_request(
        &mut self,
        requester: &PresenceUser,
        entry_holds_claim: bool,
    ) -> bool {
        let Some(own) = self.user.as_ref() else {
            return false;
        };
        if self.own_claim.is_none() && !entry_holds_claim {
            return false;
        }
        if requester.session_id == self.session_id.to_string() {
            return false;
        }
        let outranked = compare_join_time(requester.join_time, own.join_time)
            .then_with(|| requester.id.cmp(&own.id))
            == Ordering::Less;
        if outranked {
            self.own_claim = None;
            self.master = None;
        }
        outranked
    }

    /// Drop leadership on shutdown. Returns true if a claim was held.
    pub fn resign(&mut self) -> bool {
        self.master = None;
        self.own_claim.take().is_some()
    }

    pub fn is_master(&self) -> bool {
        self.master.as_ref().is_some_and(|m| m.is_self)
    }

    pub fn master(&self) -> Option<&MasterView> {
        self.master.as_ref()
    }

    pub fn master_user_id(&self) -> Option<&str> {
        self.master.as_ref().map(|m| m.user_id.as_str())
    }
}

// ───────────────────────────────────────────────────────────────────
// Async driver
// ───────────────────────────────────────────────────────────────────

/// What the driver needs from its surroundings.
#[async_trait]
pub trait ElectionHost: Send + Sync {
    /// Current presence entries, local included.
    async fn presence_snapshot(&self) -> Vec<(Uuid, PresenceEntry)>;

    /// Publish the outcome of a round.
    async fn publish(&self, decision: &Decision);
}

fn member_count(entries: &[(Uuid, PresenceEntry)]) -> usize {
    entries.iter().filter(|(_, e)| e.user_id().is_some()).count()
}

/// Run phases 2 to 5 once. The round may be aborted at any await; a claim
/// left in the presence entry by a cut-off publish is cleared by the next
/// round through [`Decision::apply_to`].
pub async fn run_election(
    election: &Mutex<LeaderElection>,
    host: &dyn ElectionHost,
    config: &ElectionConfig,
) -> Decision {
    let entries = host.presence_snapshot().await;
    let probed = election.lock().await.probe(&entries);
    if let Some(claim) = probed {
        let decision = election.lock().await.adopt(claim);
        log::debug!("adopted existing master {:?}", decision.master_user_id());
        host.publish(&decision).await;
        return decision;
    }

    let mut stabilizer = Stabilizer::new(config);
    let mut count = member_count(&entries);
    loop {
        match stabilizer.observe(count) {
            StabilizerStep::Wait => {}
            StabilizerStep::Ready => break,
            StabilizerStep::TimedOut => {
                log::debug!("membership still changing after {} polls", stabilizer.polls());
                break;
            }
        }
        tokio::time::sleep(config.poll_interval).await;
        count = member_count(&host.presence_snapshot().await);
    }

    let entries = host.presence_snapshot().await;
    let decision = election.lock().await.decide(&entries);
    host.publish(&decision).await;
    decision
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn entry(id: &str, join_time: f64) -> (Uuid, PresenceEntry) {
        let session = Uuid::new_v4();
        (
            session,
            PresenceEntry {
                user: Some(PresenceUser {
                    id: id.into(),
                    name: id.to_uppercase(),
                    color: "#000".into(),
                    join_time,
                    session_id: session.to_string(),
                }),
                ..PresenceEntry::default()
            },
        )
    }

    fn claim(master_id: &str, elected_by: Uuid, version: u64) -> MasterState {
        MasterState {
            master_id: master_id.into(),
            master_name: master_id.to_uppercase(),
            elected_at: 0,
            total_users: 1,
            elected_by: elected_by.to_string(),
            version,
        }
    }

    #[test]
    fn test_elect_smallest_join_time() {
        let entries = vec![entry("a", 10.0), entry("b", 5.0), entry("c", 5.3)];
        assert_eq!(elect(&entries).unwrap().user_id, "b");

        // Any iteration order gives the same answer.
        let mut reversed = entries.clone();
        reversed.reverse();
        assert_eq!(elect(&reversed).unwrap().user_id, "b");
        let rotated = vec![entries[2].clone(), entries[0].clone(), entries[1].clone()];
        assert_eq!(elect(&rotated).unwrap().user_id, "b");
    }

    #[test]
    fn test_elect_after_leader_leaves() {
        let entries = vec![entry("a", 10.0), entry("c", 5.3)];
        assert_eq!(elect(&entries).unwrap().user_id, "c");
    }

    #[test]
    fn test_elect_dedups_user_and_skips_anonymous() {
        let mut entries = vec![entry("a", 10.0), entry("a", 3.0), entry("b", 4.0)];
        entries.push((Uuid::new_v4(), PresenceEntry::default()));
        entries.push(entry("", 1.0));

        let winner = elect(&entries).unwrap();
        assert_eq!(winner.user_id, "a");
        assert_eq!(winner.join_time, 3.0);
        assert_eq!(winner.session_id, entries[1].0);
    }

    #[test]
    fn test_elect_empty_room_has_no_leader() {
        assert!(elect(&[]).is_none());
        assert!(elect(&[(Uuid::new_v4(), PresenceEntry::default())]).is_none());
    }

    #[test]
    fn test_elect_exact_tie_is_deterministic() {
        let entries = vec![entry("zed", 7.0), entry("amy", 7.0)];
        let mut flipped = entries.clone();
        flipped.reverse();
        assert_eq!(elect(&entries).unwrap().user_id, "amy");
        assert_eq!(elect(&flipped).unwrap().user_id, "amy");
    }

    #[test]
    fn test_adoptable_master_requires_live_entry() {
        let (sa, mut a) = entry("a", 1.0);
        a.global_master_state = Some(claim("ghost", Uuid::new_v4(), 4));
        let entries = vec![(sa, a.clone()), entry("b", 2.0)];
        assert!(find_adoptable_master(&entries).is_none());

        a.global_master_state = Some(claim("a", sa, 4));
        let entries = vec![(sa, a), entry("b", 2.0)];
        assert_eq!(find_adoptable_master(&entries).unwrap().master_id, "a");
    }

    #[test]
    fn test_competing_claims_prefer_earliest_master() {
        let (sa, mut a) = entry("a", 1.0);
        let (sb, mut b) = entry("b", 2.0);
        a.global_master_state = Some(claim("a", sa, 1));
        b.global_master_state = Some(claim("b", sb, 9));

        let found = find_adoptable_master(&[(sb, b.clone()), (sa, a.clone())]).unwrap();
        assert_eq!(found.master_id, "a");

        // Same master claimed twice: highest version wins.
        b.global_master_state = Some(claim("a", sa, 3));
        let found = find_adoptable_master(&[(sa, a), (sb, b)]).unwrap();
        assert_eq!(found.version, 3);
    }

    #[test]
    fn test_stabilizer_streak() {
        let mut s = Stabilizer::new(&ElectionConfig::default());
        assert_eq!(s.observe(1), StabilizerStep::Wait);
        assert_eq!(s.observe(2), StabilizerStep::Wait);
        assert_eq!(s.observe(2), StabilizerStep::Wait);
        assert_eq!(s.observe(2), StabilizerStep::Ready);
    }

    #[test]
    fn test_stabilizer_caps_polls() {
        let config = ElectionConfig {
            max_polls: 4,
            ..ElectionConfig::default()
        };
        let mut s = Stabilizer::new(&config);
        assert_eq!(s.observe(1), StabilizerStep::Wait);
        assert_eq!(s.observe(2), StabilizerStep::Wait);
        assert_eq!(s.observe(3), StabilizerStep::Wait);
        assert_eq!(s.observe(4), StabilizerStep::TimedOut);
        assert_eq!(s.polls(), 4);
    }

    #[test]
    fn test_decide_leader_publishes_claim_and_cleanup() {
        let me = Uuid::new_v4();
        let mut election = LeaderElection::new(me);
        let user = election.register("me", "Me", "#fff");
        let again = election.register("other", "Other", "#000");
        assert_eq!(user, again);

        let (sb, mut b) = entry("b", user.join_time + 100.0);
        b.global_master_state = Some(claim("b", sb, 6));
        let entries = vec![
            (
                me,
                PresenceEntry {
                    user: Some(user.clone()),
                    ..PresenceEntry::default()
                },
            ),
            (sb, b),
        ];

        let decision = election.decide(&entries);
        let Decision::Lead { claim, cleanup } = &decision else {
            panic!("expected Lead, got {decision:?}");
        };
        assert_eq!(claim.master_id, "me");
        assert_eq!(claim.version, 7);
        assert_eq!(claim.total_users, 2);
        assert_eq!(cleanup.as_ref().unwrap().requested_by, "me");
        assert!(decision.is_master());
        assert!(election.is_master());
        assert_eq!(election.master_user_id(), Some("me"));
    }

    #[test]
    fn test_decide_follower_clears_own_claim() {
        let me = Uuid::new_v4();
        let mut election = LeaderElection::new(me);
        let user = election.register("me", "Me", "#fff");
        let mut own = PresenceEntry {
            user: Some(user.clone()),
            ..PresenceEntry::default()
        };

        // Alone: lead.
        let decision = election.decide(&[(me, own.clone())]);
        assert!(decision.is_master());
        assert!(decision.apply_to(&mut own));
        assert!(own.global_master_state.is_some());

        // An earlier joiner shows up.
        let earlier = entry("old", user.join_time - 1_000.0);
        let decision = election.decide(&[(me, own.clone()), earlier.clone()]);
        let Decision::Follow { master } = &decision else {
            panic!("expected Follow, got {decision:?}");
        };
        assert_eq!(master.user_id, "old");
        assert_eq!(master.session_id, earlier.0);
        assert!(!election.is_master());
        assert_eq!(election.master_user_id(), Some("old"));

        assert!(decision.apply_to(&mut own));
        assert!(own.global_master_state.is_none());
        assert!(!decision.apply_to(&mut own));
    }

    #[test]
    fn test_claim_from_unpublished_round_is_still_cleared() {
        let me = Uuid::new_v4();
        let mut election = LeaderElection::new(me);
        let user = election.register("me", "Me", "#fff");
        let mut own = PresenceEntry {
            user: Some(user.clone()),
            ..PresenceEntry::default()
        };
        election.decide(&[(me, own.clone())]).apply_to(&mut own);

        let senior = entry("old", user.join_time - 1_000.0);
        // Decided but never published: the entry keeps our claim.
        let _cut_off = election.decide(&[(me, own.clone()), senior.clone()]);
        assert!(own.global_master_state.is_some());

        let senior_user = senior.1.user.clone().unwrap();
        let holds_claim = own.global_master_state.is_some();
        assert!(election.handle_cleanup_request(&senior_user, holds_claim));

        let next = election.decide(&[(me, own.clone()), senior.clone()]);
        assert!(next.apply_to(&mut own));
        assert!(own.global_master_state.is_none());

        // Once the senior leaves, nothing stale is left to adopt.
        assert!(find_adoptable_master(&[(me, own)]).is_none());
    }

    #[test]
    fn test_adopt_self_and_other() {
        let me = Uuid::new_v4();
        let mut election = LeaderElection::new(me);
        election.register("me", "Me", "#fff");

        let decision = election.adopt(claim("me", me, 2));
        assert!(decision.is_master());

        let other = claim("x", Uuid::new_v4(), 3);
        let decision = election.adopt(other.clone());
        assert_eq!(
            decision,
            Decision::Adopted {
                master: other,
                is_self: false,
            }
        );
        assert!(!election.is_master());
        assert_eq!(election.master_user_id(), Some("x"));
    }

    #[test]
    fn test_cleanup_request_obeyed_only_from_senior() {
        let me = Uuid::new_v4();
        let mut election = LeaderElection::new(me);
        let user = election.register("me", "Me", "#fff");
        let own = PresenceEntry {
            user: Some(user.clone()),
            ..PresenceEntry::default()
        };
        election.decide(&[(me, own)]);

        let junior = entry("late", user.join_time + 50.0).1.user.unwrap();
        assert!(!election.handle_cleanup_request(&junior, true));
        assert!(election.is_master());

        let senior = entry("early", user.join_time - 50.0).1.user.unwrap();
        assert!(election.handle_cleanup_request(&senior, true));
        assert!(!election.is_master());
        // Nothing left to clear.
        assert!(!election.handle_cleanup_request(&senior, false));
    }

    #[test]
    fn test_resign() {
        let me = Uuid::new_v4();
        let mut election = LeaderElection::new(me);
        let user = election.register("me", "Me", "#fff");
        let decision = election.decide(&[(
            me,
            PresenceEntry {
                user: Some(user),
                ..PresenceEntry::default()
            },
        )]);
        assert!(decision.is_master());
        assert!(election.resign());
        assert!(!election.resign());
        assert!(election.master_user_id().is_none());
    }

    #[test]
    fn test_no_leader_when_nobody_registered() {
        let mut election = LeaderElection::new(Uuid::new_v4());
        let decision = election.decide(&[]);
        assert_eq!(decision, Decision::NoLeader);
        assert!(decision.master_user_id().is_none());
    }

    // ─── driver ────────────────────────────────────────────────────

    struct FakeHost {
        entries: StdMutex<Vec<(Uuid, PresenceEntry)>>,
        published: StdMutex<Vec<Decision>>,
    }

    impl FakeHost {
        fn new(entries: Vec<(Uuid, PresenceEntry)>) -> Self {
            Self {
                entries: StdMutex::new(entries),
                published: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ElectionHost for FakeHost {
        async fn presence_snapshot(&self) -> Vec<(Uuid, PresenceEntry)> {
            self.entries.lock().unwrap().clone()
        }

        async fn publish(&self, decision: &Decision) {
            self.published.lock().unwrap().push(decision.clone());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_waits_for_stable_membership() {
        let me = Uuid::new_v4();
        let election = Mutex::new(LeaderElection::new(me));
        let user = election.lock().await.register("me", "Me", "#fff");
        let host = FakeHost::new(vec![(
            me,
            PresenceEntry {
                user: Some(user.clone()),
                ..PresenceEntry::default()
            },
        )]);
        let config = ElectionConfig::default();

        let start = tokio::time::Instant::now();
        let decision = run_election(&election, &host, &config).await;

        assert!(decision.is_master());
        // Baseline plus two unchanged polls.
        assert_eq!(start.elapsed(), config.poll_interval * 2);
        assert_eq!(host.published.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_adopts_without_waiting() {
        let me = Uuid::new_v4();
        let election = Mutex::new(LeaderElection::new(me));
        let user = election.lock().await.register("me", "Me", "#fff");

        let (sl, mut leader) = entry("lead", user.join_time - 10.0);
        leader.global_master_state = Some(claim("lead", sl, 1));
        let host = FakeHost::new(vec![
            (
                me,
                PresenceEntry {
                    user: Some(user),
                    ..PresenceEntry::default()
                },
            ),
            (sl, leader),
        ]);

        let start = tokio::time::Instant::now();
        let decision = run_election(&election, &host, &ElectionConfig::default()).await;

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(decision.master_user_id(), Some("lead"));
        assert!(!decision.is_master());
    }

    /// Host that applies decisions to our own entry; the first publish
    /// never completes.
    struct StallingHost {
        me: Uuid,
        entries: StdMutex<Vec<(Uuid, PresenceEntry)>>,
        stalled: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl ElectionHost for StallingHost {
        async fn presence_snapshot(&self) -> Vec<(Uuid, PresenceEntry)> {
            self.entries.lock().unwrap().clone()
        }

        async fn publish(&self, decision: &Decision) {
            if !self.stalled.swap(true, std::sync::atomic::Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            let mut entries = self.entries.lock().unwrap();
            if let Some((_, own)) = entries.iter_mut().find(|(s, _)| *s == self.me) {
                decision.apply_to(own);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_repairs_round_cut_off_mid_publish() {
        let me = Uuid::new_v4();
        let election = Mutex::new(LeaderElection::new(me));
        let user = election.lock().await.register("me", "Me", "#fff");

        // We led alone earlier; now a senior master is visible.
        let own = PresenceEntry {
            user: Some(user.clone()),
            global_master_state: Some(claim("me", me, 1)),
            ..PresenceEntry::default()
        };
        let (ss, mut senior) = entry("old", user.join_time - 1_000.0);
        senior.global_master_state = Some(claim("old", ss, 2));
        let host = StallingHost {
            me,
            entries: StdMutex::new(vec![(me, own), (ss, senior)]),
            stalled: std::sync::atomic::AtomicBool::new(false),
        };
        let config = ElectionConfig::default();

        let first = tokio::time::timeout(
            Duration::from_secs(60),
            run_election(&election, &host, &config),
        )
        .await;
        assert!(first.is_err(), "first publish should hang");

        let decision = run_election(&election, &host, &config).await;
        assert_eq!(decision.master_user_id(), Some("old"));

        let entries = host.entries.lock().unwrap().clone();
        let own = &entries.iter().find(|(s, _)| *s == me).unwrap().1;
        assert!(own.global_master_state.is_none());

        // Senior leaves: our old claim must not come back.
        let remaining: Vec<_> = entries.into_iter().filter(|(s, _)| *s == me).collect();
        assert!(find_adoptable_master(&remaining).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_gives_up_waiting_on_churn() {
        let me = Uuid::new_v4();
        let election = Mutex::new(LeaderElection::new(me));
        let user = election.lock().await.register("me", "Me", "#fff");

        struct ChurningHost {
            me: (Uuid, PresenceEntry),
            polls: StdMutex<usize>,
        }

        #[async_trait]
        impl ElectionHost for ChurningHost {
            async fn presence_snapshot(&self) -> Vec<(Uuid, PresenceEntry)> {
                let mut polls = self.polls.lock().unwrap();
                *polls += 1;
                // Membership grows on every poll.
                let mut entries = vec![self.me.clone()];
                for i in 0..*polls {
                    entries.push(entry(&format!("late{i}"), 1e15 + i as f64));
                }
                entries
            }

            async fn publish(&self, _decision: &Decision) {}
        }

        let host = ChurningHost {
            me: (
                me,
                PresenceEntry {
                    user: Some(user),
                    ..PresenceEntry::default()
                },
            ),
            polls: StdMutex::new(0),
        };
        let config = ElectionConfig {
            max_polls: 5,
            ..ElectionConfig::default()
        };

        let start = tokio::time::Instant::now();
        let decision = run_election(&election, &host, &config).await;

        assert_eq!(start.elapsed(), config.poll_interval * 4);
        assert!(decision.is_master());
    }
}
