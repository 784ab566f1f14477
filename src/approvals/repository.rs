use async_trait::async_trait;
use chrono::Utc;
use sqlx::{postgres::PgRow, types::Json, PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use super::models::*;
use crate::error::AppResult;

/// Durable home of approval records.
///
/// INVARIANTS:
/// - Every mutation is a compare-and-swap keyed by record id plus expected
///   prior state; a lost race returns `Ok(false)`, never an error.
/// - Records are never deleted.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    /// Insert a claim in `Submitted` state (ingestion boundary)
    async fn insert(&self, new: NewApproval) -> AppResult<ApprovalRecord>;

    async fn get(&self, id: Uuid) -> AppResult<Option<ApprovalRecord>>;

    /// Records currently in `state`, oldest claim first
    async fn list_by_state(
        &self,
        state: LifecycleState,
        limit: i64,
    ) -> AppResult<Vec<ApprovalRecord>>;

    /// Apply `transition` if the record still satisfies its guard.
    /// Returns whether this call performed the transition.
    async fn transition(&self, id: Uuid, transition: &Transition) -> AppResult<bool>;

    /// Attach a prepared settlement (signature plus the blockhash it was
    /// signed against) to a `Verified` record whose current signature equals
    /// `previous`. The winner is the only caller allowed to broadcast it.
    async fn claim_settlement(
        &self,
        id: Uuid,
        previous: Option<&str>,
        settlement: &SettlementClaim,
        pending: &[GrantTransfer],
    ) -> AppResult<bool>;
}

const RECORD_COLUMNS: &str = r#"
    id, owner, delegate, network, claim_signature, grants,
    lifecycle_state, verification_results, transfer_results, failure_reason,
    settlement_signature, settlement_blockhash, settlement_submitted_at,
    submitted_at, verified_at, transferred_at, updated_at
"#;

/// Postgres-backed approval store
pub struct PgApprovalStore {
    pool: PgPool,
}

impl PgApprovalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn from_row(row: &PgRow) -> AppResult<ApprovalRecord> {
        let grants: Json<Vec<GrantLine>> = row.try_get("grants")?;
        let verification_results: Json<Vec<GrantVerification>> =
            row.try_get("verification_results")?;
        let transfer_results: Json<Vec<GrantTransfer>> = row.try_get("transfer_results")?;

        Ok(ApprovalRecord {
            id: row.try_get("id")?,
            owner: row.try_get("owner")?,
            delegate: row.try_get("delegate")?,
            network: row.try_get("network")?,
            claim_signature: row.try_get("claim_signature")?,
            grants: grants.0,
            lifecycle_state: row.try_get("lifecycle_state")?,
            verification_results: verification_results.0,
            transfer_results: transfer_results.0,
            failure_reason: row.try_get("failure_reason")?,
            settlement_signature: row.try_get("settlement_signature")?,
            settlement_blockhash: row.try_get("settlement_blockhash")?,
            settlement_submitted_at: row.try_get("settlement_submitted_at")?,
            submitted_at: row.try_get("submitted_at")?,
            verified_at: row.try_get("verified_at")?,
            transferred_at: row.try_get("transferred_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl ApprovalStore for PgApprovalStore {
    async fn insert(&self, new: NewApproval) -> AppResult<ApprovalRecord> {
        let record = ApprovalRecord::submitted(new);

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO delegation_approvals (
                id, owner, delegate, network, claim_signature, grants,
                lifecycle_state, submitted_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(record.id)
        .bind(&record.owner)
        .bind(&record.delegate)
        .bind(&record.network)
        .bind(&record.claim_signature)
        .bind(Json(&record.grants))
        .bind(LifecycleState::Submitted)
        .bind(record.submitted_at)
        .fetch_one(&self.pool)
        .await?;

        Self::from_row(&row)
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<ApprovalRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM delegation_approvals WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn list_by_state(
        &self,
        state: LifecycleState,
        limit: i64,
    ) -> AppResult<Vec<ApprovalRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM delegation_approvals
            WHERE lifecycle_state = $1
            ORDER BY submitted_at ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(state)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::from_row).collect()
    }

    async fn transition(&self, id: Uuid, transition: &Transition) -> AppResult<bool> {
        // SECURITY: Validate the edge before touching the table
        LifecycleState::validate_transition(transition.from, transition.to)?;

        let now = Utc::now();
        let (verified_at, transferred_at) = match transition.to {
            LifecycleState::Verified | LifecycleState::VerificationFailed => (Some(now), None),
            LifecycleState::Transferred | LifecycleState::TransferFailed => (None, Some(now)),
            LifecycleState::Submitted => (None, None),
        };

        let result = sqlx::query(
            r#"
            UPDATE delegation_approvals
            SET lifecycle_state = $3,
                verification_results = COALESCE($5, verification_results),
                transfer_results = COALESCE($6, transfer_results),
                failure_reason = COALESCE($7, failure_reason),
                settlement_signature = $8,
                settlement_blockhash = CASE WHEN $8 IS NULL THEN NULL ELSE settlement_blockhash END,
                verified_at = COALESCE($9, verified_at),
                transferred_at = COALESCE($10, transferred_at),
                updated_at = $11
            WHERE id = $1
              AND lifecycle_state = $2
              AND settlement_signature IS NOT DISTINCT FROM $4
            "#,
        )
        .bind(id)
        .bind(transition.from)
        .bind(transition.to)
        .bind(transition.expected_settlement.as_deref())
        .bind(transition.verification_results.as_ref().map(Json))
        .bind(transition.transfer_results.as_ref().map(Json))
        .bind(transition.failure_reason.as_deref())
        .bind(transition.settlement_signature.as_deref())
        .bind(verified_at)
        .bind(transferred_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() == 1;
        if !applied {
            debug!(
                approval_id = %id,
                from = %transition.from,
                to = %transition.to,
                "guarded transition not applied"
            );
        }

        Ok(applied)
    }

    async fn claim_settlement(
        &self,
        id: Uuid,
        previous: Option<&str>,
        settlement: &SettlementClaim,
        pending: &[GrantTransfer],
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE delegation_approvals
            SET settlement_signature = $3,
                settlement_blockhash = $4,
                settlement_submitted_at = NOW(),
                transfer_results = $5,
                updated_at = NOW()
            WHERE id = $1
              AND lifecycle_state = 'verified'
              AND settlement_signature IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(id)
        .bind(previous)
        .bind(&settlement.signature)
        .bind(&settlement.blockhash)
        .bind(Json(pending))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
