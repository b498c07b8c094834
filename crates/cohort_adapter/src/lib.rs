#![forbid(unsafe_code)]

pub mod http;

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use cohort_engines::ph1alloc::{
    AllocationEngine, AllocationError, BucketPick, GroupOpening, Ph1AllocConfig,
};
use cohort_engines::ph1hash::ContentHasher;
use cohort_kernel_contracts::ph1attest::AttestationEntry;
use cohort_kernel_contracts::ph1group::{GroupDraft, GroupId, GroupRecord};
use cohort_kernel_contracts::ph1hash::PayloadHash;
use cohort_kernel_contracts::ph1id::Identity;
use cohort_kernel_contracts::ContractViolation;
use cohort_os::ph1alloc::{
    AllocationRunError, AllocationRunner, AllocationRunnerConfig, MAX_BATCH_DEFAULT,
    TARGET_GROUP_SIZE_DEFAULT,
};
use cohort_os::ph1attest::{AttestationError, AttestationLog};
use cohort_os::ph1ledger::{
    CreateGroupOutcome, GatewayError, LedgerGateway, LedgerGatewayConfig,
    LEDGER_CALL_TIMEOUT_MS_DEFAULT, LEDGER_INITIAL_BACKOFF_MS_DEFAULT,
    LEDGER_MAX_ATTEMPTS_DEFAULT, LEDGER_MAX_BACKOFF_MS_DEFAULT,
};
use cohort_storage::ph1enroll::{EnrollmentError, EnrollmentStore};
use cohort_storage::ph1ledger::{InMemoryLedger, LedgerBackend};

pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8080";
pub const DEFAULT_LOG_FILTER: &str = "info";
pub const ALLOCATION_WORKER_INTERVAL_MS_DEFAULT: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    pub bind: SocketAddr,
    pub log_filter: String,
    pub alloc: Ph1AllocConfig,
    pub runner: AllocationRunnerConfig,
    pub gateway: LedgerGatewayConfig,
    pub allocation_worker_enabled: bool,
    pub allocation_worker_interval_ms: u64,
    pub ledger_journal_path: Option<PathBuf>,
}

impl AdapterConfig {
    pub fn mvp_v1() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            alloc: Ph1AllocConfig::mvp_v1(),
            runner: AllocationRunnerConfig::mvp_v1(),
            gateway: LedgerGatewayConfig::mvp_v1(),
            allocation_worker_enabled: true,
            allocation_worker_interval_ms: ALLOCATION_WORKER_INTERVAL_MS_DEFAULT,
            ledger_journal_path: None,
        }
    }

    pub fn from_env() -> Result<Self, String> {
        Self::from_env_var_map(|key| env::var(key).ok())
    }

    /// Out-of-range or unparsable values fall back to defaults; only a bad
    /// bind address is fatal.
    pub fn from_env_var_map<F>(mut env_getter: F) -> Result<Self, String>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let bind_raw = env_getter("COHORT_HTTP_BIND")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_HTTP_BIND.to_string());
        let bind: SocketAddr = bind_raw
            .parse()
            .map_err(|err| format!("invalid COHORT_HTTP_BIND '{bind_raw}': {err}"))?;

        let log_filter = env_getter("COHORT_LOG")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let alloc = Ph1AllocConfig {
            bucket_pick: parse_bucket_pick(env_getter("COHORT_BUCKET_PICK").as_deref()),
            group_opening: parse_group_opening(env_getter("COHORT_GROUP_OPENING").as_deref()),
            ..Ph1AllocConfig::mvp_v1()
        };
        let runner = AllocationRunnerConfig {
            target_group_size: parse_u64_in_range(
                env_getter("COHORT_TARGET_GROUP_SIZE").as_deref(),
                2..=64,
                TARGET_GROUP_SIZE_DEFAULT as u64,
            ) as usize,
            max_batch: parse_u64_in_range(
                env_getter("COHORT_MAX_BATCH").as_deref(),
                1..=100_000,
                MAX_BATCH_DEFAULT as u64,
            ) as usize,
        };

        let initial_backoff_ms = parse_u64_in_range(
            env_getter("COHORT_LEDGER_INITIAL_BACKOFF_MS").as_deref(),
            1..=60_000,
            LEDGER_INITIAL_BACKOFF_MS_DEFAULT,
        );
        let max_backoff_ms = parse_u64_in_range(
            env_getter("COHORT_LEDGER_MAX_BACKOFF_MS").as_deref(),
            1..=600_000,
            LEDGER_MAX_BACKOFF_MS_DEFAULT,
        )
        .max(initial_backoff_ms);
        let gateway = LedgerGatewayConfig {
            max_attempts: parse_u64_in_range(
                env_getter("COHORT_LEDGER_MAX_ATTEMPTS").as_deref(),
                1..=16,
                u64::from(LEDGER_MAX_ATTEMPTS_DEFAULT),
            ) as u32,
            initial_backoff: Duration::from_millis(initial_backoff_ms),
            max_backoff: Duration::from_millis(max_backoff_ms),
            call_timeout: Duration::from_millis(parse_u64_in_range(
                env_getter("COHORT_LEDGER_CALL_TIMEOUT_MS").as_deref(),
                100..=600_000,
                LEDGER_CALL_TIMEOUT_MS_DEFAULT,
            )),
        };

        let allocation_worker_enabled = match env_getter("COHORT_ALLOCATION_WORKER_ENABLED") {
            Some(v) => !matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "0" | "false" | "off" | "no"
            ),
            None => true,
        };
        let allocation_worker_interval_ms = parse_u64_in_range(
            env_getter("COHORT_ALLOCATION_WORKER_INTERVAL_MS").as_deref(),
            1_000..=3_600_000,
            ALLOCATION_WORKER_INTERVAL_MS_DEFAULT,
        );
        let ledger_journal_path = env_getter("COHORT_LEDGER_JOURNAL_PATH")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            bind,
            log_filter,
            alloc,
            runner,
            gateway,
            allocation_worker_enabled,
            allocation_worker_interval_ms,
            ledger_journal_path,
        })
    }
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self::mvp_v1()
    }
}

fn parse_u64_in_range(
    raw: Option<&str>,
    range: std::ops::RangeInclusive<u64>,
    default: u64,
) -> u64 {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| range.contains(v))
        .unwrap_or(default)
}

fn parse_bucket_pick(raw: Option<&str>) -> BucketPick {
    match raw.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        Some("novel_skill") => BucketPick::NovelSkillFirst,
        _ => BucketPick::LargestFirst,
    }
}

fn parse_group_opening(raw: Option<&str>) -> GroupOpening {
    match raw.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        Some("upfront") => GroupOpening::Upfront,
        _ => GroupOpening::OnDemand,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotAMember(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    InsufficientEnrollment(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl AdapterError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdapterError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AdapterError::NotAMember(_) => StatusCode::FORBIDDEN,
            AdapterError::NotFound(_) => StatusCode::NOT_FOUND,
            AdapterError::Conflict(_) => StatusCode::CONFLICT,
            AdapterError::InsufficientEnrollment(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AdapterError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AdapterError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            AdapterError::BadRequest(_) => "REJECTED",
            AdapterError::NotAMember(_) => "NOT_A_MEMBER",
            AdapterError::NotFound(_) => "NOT_FOUND",
            AdapterError::Conflict(_) => "CONFLICT",
            AdapterError::InsufficientEnrollment(_) => "INSUFFICIENT_ENROLLMENT",
            AdapterError::Unavailable(_) => "LEDGER_UNAVAILABLE",
            AdapterError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn to_response(&self) -> AdapterErrorResponse {
        AdapterErrorResponse {
            status: "error".to_string(),
            outcome: self.outcome().to_string(),
            reason: Some(self.to_string()),
        }
    }
}

impl From<ContractViolation> for AdapterError {
    fn from(v: ContractViolation) -> Self {
        AdapterError::BadRequest(v.to_string())
    }
}

impl From<GatewayError> for AdapterError {
    fn from(err: GatewayError) -> Self {
        let reason = err.to_string();
        match err {
            GatewayError::Invalid(_) => AdapterError::BadRequest(reason),
            GatewayError::NotAMember { .. } => AdapterError::NotAMember(reason),
            GatewayError::UnknownGroup(_) => AdapterError::NotFound(reason),
            GatewayError::Conflict { .. }
            | GatewayError::GroupIdTaken { .. }
            | GatewayError::MemberAlreadyGrouped { .. } => AdapterError::Conflict(reason),
            GatewayError::LedgerUnavailable { .. } | GatewayError::Cancelled { .. } => {
                AdapterError::Unavailable(reason)
            }
            GatewayError::Internal(_) => AdapterError::Internal(reason),
        }
    }
}

impl From<AttestationError> for AdapterError {
    fn from(err: AttestationError) -> Self {
        match err {
            AttestationError::Gateway(g) => g.into(),
            AttestationError::Invalid(v) => v.into(),
            AttestationError::LockPoisoned => AdapterError::Internal(err.to_string()),
        }
    }
}

impl From<EnrollmentError> for AdapterError {
    fn from(err: EnrollmentError) -> Self {
        let reason = err.to_string();
        match err {
            EnrollmentError::InvalidIdentity(_)
            | EnrollmentError::EmptyPreferences
            | EnrollmentError::InvalidRecord(_) => AdapterError::BadRequest(reason),
            EnrollmentError::AllocationRunActive => AdapterError::Conflict(reason),
            EnrollmentError::ForeignRunGuard | EnrollmentError::LockPoisoned => {
                AdapterError::Internal(reason)
            }
        }
    }
}

impl From<AllocationRunError> for AdapterError {
    fn from(err: AllocationRunError) -> Self {
        let reason = err.to_string();
        match err {
            AllocationRunError::Enrollment(e) => e.into(),
            AllocationRunError::Allocation(AllocationError::InsufficientEnrollment { .. }) => {
                AdapterError::InsufficientEnrollment(reason)
            }
            AllocationRunError::Allocation(_) => AdapterError::BadRequest(reason),
            AllocationRunError::Gateway(g) => g.into(),
            AllocationRunError::LockPoisoned => AdapterError::Internal(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterErrorResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollAdapterRequest {
    pub wallet_address: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub preferences: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollAdapterResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub wallet_address: String,
    pub enrollment_seq: u64,
    pub pending_enrollments: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupView {
    pub group_id: u64,
    pub members: Vec<String>,
    pub metadata_hash: String,
}

impl From<&GroupRecord> for GroupView {
    fn from(record: &GroupRecord) -> Self {
        Self {
            group_id: record.group_id.0,
            members: record.members.iter().map(|m| m.to_string()).collect(),
            metadata_hash: record.metadata_hash.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupsAdapterResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub groups: Vec<GroupView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMetadataAdapterRequest {
    pub wallet: String,
    pub metadata_hash: Option<String>,
    /// Base64 payload, hashed server-side.
    pub payload: Option<String>,
    pub group_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationView {
    pub group_id: u64,
    pub submitter: String,
    pub payload_hash: String,
    pub sequence_no: u64,
}

impl From<&AttestationEntry> for AttestationView {
    fn from(entry: &AttestationEntry) -> Self {
        Self {
            group_id: entry.group_id.0,
            submitter: entry.submitter.to_string(),
            payload_hash: entry.payload_hash.to_string(),
            sequence_no: entry.sequence_no.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationAdapterResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub attestation: AttestationView,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractCreateGroupRequest {
    pub group_id: u64,
    pub members: Vec<String>,
    pub metadata_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractGroupResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub group: GroupView,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractUpdateMetadataRequest {
    pub group_id: u64,
    pub wallet: String,
    pub metadata_hash: String,
    pub expected_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRunAdapterResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub drained: usize,
    pub carried_in: usize,
    pub skipped_already_grouped: Vec<String>,
    pub committed: Vec<GroupView>,
    pub already_existing: Vec<GroupView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryAdapterResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub group_id: u64,
    pub entries: Vec<AttestationView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub pending_enrollments: usize,
    pub committed_groups: usize,
    pub allocation_run_active: bool,
    pub ledger_journaled: bool,
}

/// Everything the HTTP surface needs, shared behind one `Arc`.
pub struct AdapterRuntime {
    enrollment: Arc<EnrollmentStore>,
    gateway: LedgerGateway,
    attestation: AttestationLog,
    runner: AllocationRunner,
    ledger_journaled: bool,
}

impl AdapterRuntime {
    pub fn new(backend: Arc<dyn LedgerBackend>, config: &AdapterConfig) -> Self {
        let enrollment = Arc::new(EnrollmentStore::new_in_memory());
        let gateway = LedgerGateway::new(backend, config.gateway);
        let runner = AllocationRunner::new(
            enrollment.clone(),
            AllocationEngine::new(config.alloc),
            gateway.clone(),
            config.runner,
        );
        Self {
            enrollment,
            attestation: AttestationLog::new(gateway.clone()),
            gateway,
            runner,
            ledger_journaled: false,
        }
    }

    pub fn new_in_memory(config: &AdapterConfig) -> Self {
        Self::new(Arc::new(InMemoryLedger::new_in_memory()), config)
    }

    pub fn from_config(config: &AdapterConfig) -> Result<Self, String> {
        let Some(path) = config.ledger_journal_path.as_ref() else {
            return Ok(Self::new_in_memory(config));
        };
        let ledger = InMemoryLedger::open_journaled(path).map_err(|err| err.to_string())?;
        info!(path = %path.display(), groups = ?ledger.total_groups().ok(), "ledger journal replayed");
        let mut runtime = Self::new(Arc::new(ledger), config);
        runtime.ledger_journaled = true;
        Ok(runtime)
    }

    pub fn enroll(&self, request: EnrollAdapterRequest) -> Result<EnrollAdapterResponse, AdapterError> {
        let record =
            self.enrollment
                .upsert(&request.wallet_address, &request.skills, &request.preferences)?;
        debug!(identity = %record.identity, seq = record.enrollment_seq.0, "enrollment accepted");
        Ok(EnrollAdapterResponse {
            status: "ok".to_string(),
            outcome: "ENROLLED".to_string(),
            reason: None,
            wallet_address: record.identity.to_string(),
            enrollment_seq: record.enrollment_seq.0,
            pending_enrollments: self.enrollment.pending_len()?,
        })
    }

    pub async fn list_groups(&self) -> Result<GroupsAdapterResponse, AdapterError> {
        let groups = self.gateway.groups().await?;
        if groups.is_empty() {
            return Err(AdapterError::Unavailable(
                "no groups have been committed yet".to_string(),
            ));
        }
        Ok(GroupsAdapterResponse {
            status: "ok".to_string(),
            outcome: "LISTED".to_string(),
            reason: None,
            groups: groups.iter().map(GroupView::from).collect(),
        })
    }

    pub async fn update_metadata(
        &self,
        request: UpdateMetadataAdapterRequest,
    ) -> Result<AttestationAdapterResponse, AdapterError> {
        let identity = Identity::parse(&request.wallet)?;
        let payload_hash = match (request.metadata_hash.as_deref(), request.payload.as_deref()) {
            (Some(hash), None) => PayloadHash::parse(hash)?,
            (None, Some(payload)) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(payload.trim())
                    .map_err(|err| AdapterError::BadRequest(format!("invalid payload base64: {err}")))?;
                ContentHasher::digest(&bytes)
            }
            _ => {
                return Err(AdapterError::BadRequest(
                    "exactly one of metadata_hash or payload is required".to_string(),
                ))
            }
        };

        let group = match request.group_id {
            Some(raw) => {
                let group_id = GroupId(raw);
                let group = self
                    .gateway
                    .group(group_id)
                    .await?
                    .ok_or_else(|| AdapterError::NotFound(format!("unknown group {group_id}")))?;
                if !group.contains(&identity) {
                    return Err(AdapterError::NotAMember(format!(
                        "wallet {identity} is not a member of group {group_id}"
                    )));
                }
                group
            }
            None => self
                .gateway
                .group_for_member(&identity)
                .await?
                .ok_or_else(|| {
                    AdapterError::NotFound(format!("wallet {identity} is not in any group"))
                })?,
        };

        let entry = self
            .attestation
            .submit_hash(group.group_id, identity, payload_hash)
            .await?;
        Ok(AttestationAdapterResponse {
            status: "ok".to_string(),
            outcome: "ACCEPTED".to_string(),
            reason: None,
            attestation: AttestationView::from(&entry),
        })
    }

    pub async fn contract_create_group(
        &self,
        request: ContractCreateGroupRequest,
    ) -> Result<ContractGroupResponse, AdapterError> {
        let members = request
            .members
            .iter()
            .map(|m| Identity::parse(m))
            .collect::<Result<Vec<_>, _>>()?;
        let member_key = ContentHasher::member_set_key(&members);
        let metadata_hash = match request.metadata_hash.as_deref() {
            Some(raw) => PayloadHash::parse(raw)?,
            None => member_key.to_genesis_hash(),
        };
        let draft = GroupDraft::v1(GroupId(request.group_id), members, member_key, metadata_hash)?;
        let outcome = self.gateway.create_group(draft).await?;
        let label = match &outcome {
            CreateGroupOutcome::Committed(_) => "COMMITTED",
            CreateGroupOutcome::AlreadyExists(_) => "ALREADY_EXISTS",
        };
        Ok(ContractGroupResponse {
            status: "ok".to_string(),
            outcome: label.to_string(),
            reason: None,
            group: GroupView::from(outcome.record()),
        })
    }

    pub async fn contract_update_metadata(
        &self,
        request: ContractUpdateMetadataRequest,
    ) -> Result<AttestationAdapterResponse, AdapterError> {
        let identity = Identity::parse(&request.wallet)?;
        let payload_hash = PayloadHash::parse(&request.metadata_hash)?;
        let expected_hash = request
            .expected_hash
            .as_deref()
            .map(PayloadHash::parse)
            .transpose()?;
        let entry = self
            .attestation
            .submit_hash_expecting(GroupId(request.group_id), identity, payload_hash, expected_hash)
            .await?;
        Ok(AttestationAdapterResponse {
            status: "ok".to_string(),
            outcome: "ACCEPTED".to_string(),
            reason: None,
            attestation: AttestationView::from(&entry),
        })
    }

    pub async fn run_allocation(&self) -> Result<AllocationRunAdapterResponse, AdapterError> {
        let outcome = self.runner.run_once().await?;
        let (committed, already_existing): (Vec<_>, Vec<_>) =
            outcome.groups.iter().partition(|g| g.is_committed());
        Ok(AllocationRunAdapterResponse {
            status: "ok".to_string(),
            outcome: "ALLOCATED".to_string(),
            reason: None,
            drained: outcome.drained,
            carried_in: outcome.carried_in,
            skipped_already_grouped: outcome
                .skipped_already_grouped
                .iter()
                .map(|i| i.to_string())
                .collect(),
            committed: committed.into_iter().map(|g| GroupView::from(g.record())).collect(),
            already_existing: already_existing
                .into_iter()
                .map(|g| GroupView::from(g.record()))
                .collect(),
        })
    }

    /// One background pass. Idle outcomes (nothing to allocate, a manual run
    /// in progress) are not failures.
    pub async fn run_allocation_worker_pass(&self) -> Result<(), String> {
        match self.runner.run_once().await {
            Ok(outcome) => {
                if !outcome.groups.is_empty() {
                    info!(groups = outcome.groups.len(), "allocation worker pass committed groups");
                }
                Ok(())
            }
            Err(err) if err.is_insufficient_enrollment() || err.is_run_active() => {
                debug!(reason = %err, "allocation worker pass idle");
                Ok(())
            }
            Err(err) => Err(err.to_string()),
        }
    }

    pub async fn group_history(&self, group_id: u64) -> Result<HistoryAdapterResponse, AdapterError> {
        let history = self.attestation.read_history(GroupId(group_id)).await?;
        Ok(HistoryAdapterResponse {
            status: "ok".to_string(),
            outcome: "HISTORY".to_string(),
            reason: None,
            group_id,
            entries: history.iter().map(AttestationView::from).collect(),
        })
    }

    pub async fn health_report(&self) -> Result<AdapterHealthResponse, AdapterError> {
        let committed_groups = self.gateway.groups().await?.len();
        Ok(AdapterHealthResponse {
            status: "ok".to_string(),
            outcome: "HEALTHY".to_string(),
            reason: None,
            pending_enrollments: self.enrollment.pending_len()?,
            committed_groups,
            allocation_run_active: self.enrollment.allocation_run_active(),
            ledger_journaled: self.ledger_journaled,
        })
    }
}

/// Logs and converts a failed call into the shared error envelope.
pub fn error_response(op: &'static str, err: &AdapterError) -> (StatusCode, AdapterErrorResponse) {
    let status = err.status_code();
    if status.is_server_error() {
        warn!(op, status = status.as_u16(), reason = %err, "request failed");
    } else {
        debug!(op, status = status.as_u16(), reason = %err, "request rejected");
    }
    (status, err.to_response())
}
