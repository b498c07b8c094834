#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use cohort_kernel_contracts::ph1enroll::EnrollmentRecord;
use cohort_kernel_contracts::ph1group::{GroupDraft, GroupId};
use cohort_kernel_contracts::ph1id::Identity;
use cohort_kernel_contracts::{ContractViolation, Validate};

use crate::ph1hash::ContentHasher;

pub const MIN_GROUP_SIZE: usize = 2;

/// Which preference bucket feeds the next seat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketPick {
    /// Largest remaining bucket, ties by bucket name.
    #[default]
    LargestFirst,
    /// Bucket whose head record brings the most skills the group lacks,
    /// falling back to `LargestFirst` on ties.
    NovelSkillFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupOpening {
    /// Open a new group only once every open group is at capacity.
    #[default]
    OnDemand,
    /// Open `ceil(n / target)` groups before the first seat is assigned.
    Upfront,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ph1AllocConfig {
    pub bucket_pick: BucketPick,
    pub group_opening: GroupOpening,
    pub max_group_size: usize,
}

impl Ph1AllocConfig {
    pub fn mvp_v1() -> Self {
        Self {
            bucket_pick: BucketPick::LargestFirst,
            group_opening: GroupOpening::OnDemand,
            max_group_size: 64,
        }
    }
}

impl Default for Ph1AllocConfig {
    fn default() -> Self {
        Self::mvp_v1()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    #[error("insufficient enrollment: need at least {MIN_GROUP_SIZE} records, got {got}")]
    InsufficientEnrollment { got: usize },
    #[error("invalid target group size {got}: must be within {MIN_GROUP_SIZE}..={max}")]
    InvalidGroupSize { got: usize, max: usize },
    #[error("identity {0} appears more than once in the batch")]
    DuplicateIdentity(Identity),
    #[error(transparent)]
    Contract(#[from] ContractViolation),
}

struct OpenGroup<'a> {
    members: Vec<&'a EnrollmentRecord>,
    skills: BTreeSet<&'a str>,
}

impl<'a> OpenGroup<'a> {
    fn new() -> Self {
        Self {
            members: Vec::new(),
            skills: BTreeSet::new(),
        }
    }

    fn push(&mut self, record: &'a EnrollmentRecord) {
        self.skills.extend(record.skills.iter().map(String::as_str));
        self.members.push(record);
    }

    fn novel_skills(&self, record: &EnrollmentRecord) -> usize {
        record
            .skills
            .iter()
            .filter(|s| !self.skills.contains(s.as_str()))
            .count()
    }
}

/// Deterministic balanced partitioning of a drained enrollment batch.
/// Identical input yields identical drafts.
#[derive(Debug, Clone)]
pub struct AllocationEngine {
    config: Ph1AllocConfig,
}

impl AllocationEngine {
    pub fn new(config: Ph1AllocConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Ph1AllocConfig {
        &self.config
    }

    pub fn allocate(
        &self,
        records: &[EnrollmentRecord],
        target_group_size: usize,
        first_group_id: GroupId,
    ) -> Result<Vec<GroupDraft>, AllocationError> {
        if !(MIN_GROUP_SIZE..=self.config.max_group_size).contains(&target_group_size) {
            return Err(AllocationError::InvalidGroupSize {
                got: target_group_size,
                max: self.config.max_group_size,
            });
        }
        if records.len() < MIN_GROUP_SIZE {
            return Err(AllocationError::InsufficientEnrollment { got: records.len() });
        }
        first_group_id.validate()?;

        let mut seen = BTreeSet::new();
        for r in records {
            r.validate()?;
            if !seen.insert(&r.identity) {
                return Err(AllocationError::DuplicateIdentity(r.identity.clone()));
            }
        }

        let mut buckets = bucket_by_primary_preference(records);
        let mut groups: Vec<OpenGroup<'_>> = Vec::new();
        if self.config.group_opening == GroupOpening::Upfront {
            let n_groups = records.len().div_ceil(target_group_size);
            groups.extend((0..n_groups).map(|_| OpenGroup::new()));
        }

        for _ in 0..records.len() {
            let idx = match smallest_open_group(&groups, target_group_size) {
                Some(idx) => idx,
                None => {
                    groups.push(OpenGroup::new());
                    groups.len() - 1
                }
            };
            let Some(bucket) = self.pick_bucket(&buckets, &groups[idx]) else {
                break;
            };
            if let Some(record) = buckets.get_mut(bucket).and_then(VecDeque::pop_front) {
                groups[idx].push(record);
            }
        }
        groups.retain(|g| !g.members.is_empty());
        merge_undersized(&mut groups);

        let mut drafts = Vec::with_capacity(groups.len());
        let mut group_id = first_group_id;
        for g in groups {
            let members: Vec<Identity> = g.members.iter().map(|r| r.identity.clone()).collect();
            let member_key = ContentHasher::member_set_key(&members);
            let genesis = member_key.to_genesis_hash();
            drafts.push(GroupDraft::v1(group_id, members, member_key, genesis)?);
            group_id = group_id.next();
        }
        Ok(drafts)
    }

    fn pick_bucket<'r>(
        &self,
        buckets: &BTreeMap<&'r str, VecDeque<&'r EnrollmentRecord>>,
        group: &OpenGroup<'_>,
    ) -> Option<&'r str> {
        let mut best: Option<(&'r str, (usize, usize))> = None;
        for (name, bucket) in buckets {
            let Some(head) = bucket.front() else {
                continue;
            };
            let score = match self.config.bucket_pick {
                BucketPick::LargestFirst => (0, bucket.len()),
                BucketPick::NovelSkillFirst => (group.novel_skills(head), bucket.len()),
            };
            // BTreeMap iterates names ascending, so strict > keeps the first name on ties.
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((*name, score));
            }
        }
        best.map(|(name, _)| name)
    }
}

impl Default for AllocationEngine {
    fn default() -> Self {
        Self::new(Ph1AllocConfig::mvp_v1())
    }
}

fn bucket_by_primary_preference(
    records: &[EnrollmentRecord],
) -> BTreeMap<&str, VecDeque<&EnrollmentRecord>> {
    let mut buckets: BTreeMap<&str, Vec<&EnrollmentRecord>> = BTreeMap::new();
    for r in records {
        buckets.entry(r.primary_preference()).or_default().push(r);
    }
    buckets
        .into_iter()
        .map(|(name, mut bucket)| {
            bucket.sort_by(|a, b| a.identity.cmp(&b.identity));
            (name, VecDeque::from(bucket))
        })
        .collect()
}

fn smallest_open_group(groups: &[OpenGroup<'_>], capacity: usize) -> Option<usize> {
    groups
        .iter()
        .enumerate()
        .filter(|(_, g)| g.members.len() < capacity)
        .min_by_key(|(i, g)| (g.members.len(), *i))
        .map(|(i, _)| i)
}

fn merge_undersized(groups: &mut Vec<OpenGroup<'_>>) {
    while groups.len() > 1 {
        let Some(small) = groups.iter().position(|g| g.members.len() < MIN_GROUP_SIZE) else {
            return;
        };
        let orphan = groups.remove(small);
        let Some(target) = groups
            .iter()
            .enumerate()
            .min_by_key(|(i, g)| (g.members.len(), *i))
            .map(|(i, _)| i)
        else {
            return;
        };
        for r in orphan.members {
            groups[target].push(r);
        }
    }
}
