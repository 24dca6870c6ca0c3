pub mod models;

use std::collections::HashMap;

use async_trait::async_trait;
use planvault_core::protocol::{
    CreateShareResponse, IncomingShare, OutgoingShare, OwnedShare, PushRecord, ShareChange,
    ShareRecipient, ShareView,
};
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

use crate::error::AppError;
use crate::store::{
    authorize_write, outgoing_from_owned, patch_target, share_not_found,
    validate_proposed_version, Account, AccountStore, CasOutcome, NewShare, ShareStore,
    ShareWrite, StoreResult, StoredWorkspace, WorkspaceStore, WriteKind,
};
use models::{
    parse_permission, IncomingRow, PushRow, RecipientRow, SharedTableRow, UserRow, WorkspaceRow,
};

const SHARE_COLUMNS: &str = "id, owner_id, source_table_id, encrypted_table_data, version, \
     wrapped_dek_for_owner, last_pushed_by_user_id, last_resolved_at";

/// Database connection wrapper
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to the database
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn share_owner(&self, share_id: Uuid) -> StoreResult<Uuid> {
        let row: Option<(Uuid,)> = sqlx::query_as("SELECT owner_id FROM shared_tables WHERE id = $1")
            .bind(share_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.0).ok_or_else(|| share_not_found(share_id))
    }

    async fn recipient_permission(
        &self,
        share_id: Uuid,
        user_id: Uuid,
    ) -> StoreResult<Option<(String, String)>> {
        let row: Option<(String, String)> = sqlx::query_as(
            r#"SELECT encrypted_dek, permission FROM shared_table_recipients
               WHERE shared_table_id = $1 AND user_id = $2"#,
        )
        .bind(share_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[async_trait]
impl WorkspaceStore for Database {
    async fn version(&self, user_id: Uuid) -> StoreResult<i64> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT version FROM workspaces WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map_or(0, |r| r.0))
    }

    async fn load(&self, user_id: Uuid) -> StoreResult<Option<StoredWorkspace>> {
        let row = sqlx::query_as::<_, WorkspaceRow>(
            r#"SELECT data, version FROM workspaces WHERE user_id = $1"#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| StoredWorkspace {
            data: r.data,
            version: r.version,
        }))
    }

    async fn save(
        &self,
        user_id: Uuid,
        data: &str,
        expected_version: i64,
    ) -> StoreResult<CasOutcome> {
        validate_proposed_version(expected_version)?;

        // One conditional statement each; zero rows back means the CAS lost
        let written: Option<(i64,)> = if expected_version == 1 {
            sqlx::query_as(
                r#"
                INSERT INTO workspaces (user_id, data, version, updated_at)
                VALUES ($1, $2, 1, NOW())
                ON CONFLICT (user_id)
                DO UPDATE SET data = EXCLUDED.data, version = 1, updated_at = NOW()
                WHERE workspaces.version = 0
                RETURNING version
                "#,
            )
            .bind(user_id)
            .bind(data)
            .fetch_optional(&self.pool)
            .await?
        } else {
            sqlx::query_as(
                r#"
                UPDATE workspaces SET data = $2, version = $3, updated_at = NOW()
                WHERE user_id = $1 AND version = $3 - 1
                RETURNING version
                "#,
            )
            .bind(user_id)
            .bind(data)
            .bind(expected_version)
            .fetch_optional(&self.pool)
            .await?
        };

        match written {
            Some((version,)) => Ok(CasOutcome::Committed { version }),
            None => Ok(CasOutcome::Conflict {
                current_version: self.version(user_id).await?,
            }),
        }
    }
}

#[async_trait]
impl ShareStore for Database {
    async fn create_or_extend(&self, share: NewShare) -> StoreResult<CreateShareResponse> {
        let mut tx = self.pool.begin().await?;

        let mut created = None;
        if let Some(wrapped) = &share.wrapped_dek_for_owner {
            created = sqlx::query_as::<_, (Uuid, i64)>(
                r#"
                INSERT INTO shared_tables
                    (id, owner_id, source_table_id, encrypted_table_data, version, wrapped_dek_for_owner)
                VALUES ($1, $2, $3, $4, 1, $5)
                ON CONFLICT (owner_id, source_table_id) DO NOTHING
                RETURNING id, version
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(share.owner_id)
            .bind(&share.source_table_id)
            .bind(&share.encrypted_table_data)
            .bind(wrapped)
            .fetch_optional(&mut *tx)
            .await?;
        }

        // Extending never touches the blob: that would bypass the version check
        let (share_id, version, is_new) = match created {
            Some((id, version)) => (id, version, true),
            None => {
                let existing: Option<(Uuid, i64)> = sqlx::query_as(
                    r#"SELECT id, version FROM shared_tables
                       WHERE owner_id = $1 AND source_table_id = $2 FOR UPDATE"#,
                )
                .bind(share.owner_id)
                .bind(&share.source_table_id)
                .fetch_optional(&mut *tx)
                .await?;
                let (id, version) = existing.ok_or_else(|| {
                    AppError::BadRequest(
                        "wrappedDekForOwner is required for a new share".to_string(),
                    )
                })?;
                (id, version, false)
            }
        };

        sqlx::query(
            r#"
            INSERT INTO shared_table_recipients (shared_table_id, user_id, encrypted_dek, permission)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (shared_table_id, user_id)
            DO UPDATE SET encrypted_dek = EXCLUDED.encrypted_dek, permission = EXCLUDED.permission
            "#,
        )
        .bind(share_id)
        .bind(share.recipient_id)
        .bind(&share.encrypted_dek)
        .bind(share.permission.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(CreateShareResponse {
            share_id,
            recipient_user_id: share.recipient_id,
            version,
            created: is_new,
        })
    }

    async fn view(&self, share_id: Uuid, caller: Uuid) -> StoreResult<ShareView> {
        let share = sqlx::query_as::<_, SharedTableRow>(&format!(
            "SELECT {} FROM shared_tables WHERE id = $1",
            SHARE_COLUMNS
        ))
        .bind(share_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| share_not_found(share_id))?;

        let (wrapped_dek, permission) = if share.owner_id == caller {
            (share.wrapped_dek_for_owner, None)
        } else {
            let (dek, permission) = self
                .recipient_permission(share_id, caller)
                .await?
                .ok_or_else(|| share_not_found(share_id))?;
            (dek, Some(parse_permission(&permission)?))
        };

        Ok(ShareView {
            share_id,
            owner_id: share.owner_id,
            source_table_id: share.source_table_id,
            encrypted_table_data: share.encrypted_table_data,
            version: share.version,
            wrapped_dek,
            permission,
        })
    }

    async fn incoming(&self, user_id: Uuid) -> StoreResult<Vec<IncomingShare>> {
        let rows = sqlx::query_as::<_, IncomingRow>(
            r#"
            SELECT s.id, s.owner_id, u.email AS owner_email, s.source_table_id,
                   s.encrypted_table_data, r.encrypted_dek, r.permission, s.version
            FROM shared_table_recipients r
            JOIN shared_tables s ON s.id = r.shared_table_id
            JOIN users u ON u.id = s.owner_id
            WHERE r.user_id = $1
            ORDER BY s.source_table_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(IncomingShare {
                    share_id: row.id,
                    owner_id: row.owner_id,
                    owner_email: row.owner_email,
                    source_table_id: row.source_table_id,
                    encrypted_table_data: row.encrypted_table_data,
                    encrypted_dek: row.encrypted_dek,
                    permission: parse_permission(&row.permission)?,
                    version: row.version,
                })
            })
            .collect()
    }

    async fn owned(&self, owner_id: Uuid) -> StoreResult<Vec<OwnedShare>> {
        let shares = sqlx::query_as::<_, SharedTableRow>(&format!(
            "SELECT {} FROM shared_tables WHERE owner_id = $1 ORDER BY source_table_id",
            SHARE_COLUMNS
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<Uuid> = shares.iter().map(|s| s.id).collect();
        let recipient_rows = sqlx::query_as::<_, RecipientRow>(
            r#"
            SELECT r.shared_table_id, r.user_id, u.email, r.encrypted_dek, r.permission,
                   r.always_accept_from
            FROM shared_table_recipients r
            JOIN users u ON u.id = r.user_id
            WHERE r.shared_table_id = ANY($1)
            ORDER BY r.created_at
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut recipients: HashMap<Uuid, Vec<ShareRecipient>> = HashMap::new();
        for row in recipient_rows {
            recipients
                .entry(row.shared_table_id)
                .or_default()
                .push(ShareRecipient {
                    user_id: row.user_id,
                    email: row.email,
                    permission: parse_permission(&row.permission)?,
                    always_accept_from: row.always_accept_from,
                });
        }

        Ok(shares
            .into_iter()
            .map(|share| OwnedShare {
                recipients: recipients.remove(&share.id).unwrap_or_default(),
                share_id: share.id,
                source_table_id: share.source_table_id,
                encrypted_table_data: share.encrypted_table_data,
                version: share.version,
                wrapped_dek_for_owner: share.wrapped_dek_for_owner,
                last_pushed_by_user_id: share.last_pushed_by_user_id,
                last_resolved_at: share.last_resolved_at,
            })
            .collect())
    }

    async fn outgoing(&self, owner_id: Uuid) -> StoreResult<Vec<OutgoingShare>> {
        Ok(outgoing_from_owned(self.owned(owner_id).await?))
    }

    async fn write(&self, write: ShareWrite) -> StoreResult<CasOutcome> {
        validate_proposed_version(write.version)?;
        let mut tx = self.pool.begin().await?;

        // Serializes every writer of this share until commit
        let share = sqlx::query_as::<_, SharedTableRow>(&format!(
            "SELECT {} FROM shared_tables WHERE id = $1 FOR UPDATE",
            SHARE_COLUMNS
        ))
        .bind(write.share_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| share_not_found(write.share_id))?;

        let permission: Option<(String,)> = sqlx::query_as(
            r#"SELECT permission FROM shared_table_recipients
               WHERE shared_table_id = $1 AND user_id = $2"#,
        )
        .bind(write.share_id)
        .bind(write.caller)
        .fetch_optional(&mut *tx)
        .await?;
        let permission = permission
            .map(|(p,)| parse_permission(&p))
            .transpose()?;

        authorize_write(
            write.share_id,
            share.owner_id,
            write.caller,
            permission,
            write.entitled,
            write.kind,
        )?;

        if write.version != share.version + 1 {
            tx.rollback().await?;
            return Ok(CasOutcome::Conflict {
                current_version: share.version,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO shared_table_pushes
                (id, shared_table_id, user_id, encrypted_table_data, version, pushed_at)
            VALUES ($1, $2, $3, $4, $5, clock_timestamp())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(write.share_id)
        .bind(write.caller)
        .bind(&write.encrypted_table_data)
        .bind(write.version)
        .execute(&mut *tx)
        .await?;

        let update = match write.kind {
            WriteKind::Write => {
                r#"
                UPDATE shared_tables
                SET encrypted_table_data = $2, version = $3, last_pushed_by_user_id = $4,
                    updated_at = NOW()
                WHERE id = $1
                "#
            }
            WriteKind::Resolve => {
                r#"
                UPDATE shared_tables
                SET encrypted_table_data = $2, version = $3, last_pushed_by_user_id = $4,
                    last_resolved_at = clock_timestamp(), last_resolved_by_user_id = $4,
                    updated_at = NOW()
                WHERE id = $1
                "#
            }
        };
        sqlx::query(update)
            .bind(write.share_id)
            .bind(&write.encrypted_table_data)
            .bind(write.version)
            .bind(write.caller)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::debug!(
            share_id = %write.share_id,
            version = write.version,
            kind = ?write.kind,
            "Shared table written"
        );
        Ok(CasOutcome::Committed {
            version: write.version,
        })
    }

    async fn pending_pushes(&self, share_id: Uuid, caller: Uuid) -> StoreResult<Vec<PushRecord>> {
        if self.share_owner(share_id).await? != caller {
            return Err(AppError::Forbidden(
                "Only the owner can read pending pushes".to_string(),
            ));
        }

        let rows = sqlx::query_as::<_, PushRow>(
            r#"
            SELECT p.id, p.user_id, p.encrypted_table_data, p.version, p.pushed_at,
                   COALESCE(r.always_accept_from, FALSE) AS always_accept_from
            FROM shared_table_pushes p
            JOIN shared_tables s ON s.id = p.shared_table_id
            LEFT JOIN shared_table_recipients r
                ON r.shared_table_id = p.shared_table_id AND r.user_id = p.user_id
            WHERE p.shared_table_id = $1
              AND p.user_id <> s.owner_id
              AND (s.last_resolved_at IS NULL OR p.pushed_at > s.last_resolved_at)
            ORDER BY p.pushed_at ASC
            "#,
        )
        .bind(share_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| PushRecord {
                id: row.id,
                user_id: row.user_id,
                encrypted_table_data: row.encrypted_table_data,
                version: row.version,
                pushed_at: row.pushed_at,
                always_accept_from: row.always_accept_from,
            })
            .collect())
    }

    async fn update_recipient(
        &self,
        share_id: Uuid,
        caller: Uuid,
        recipient: Option<Uuid>,
        change: ShareChange,
    ) -> StoreResult<()> {
        let owner_id = self.share_owner(share_id).await?;
        if caller != owner_id && self.recipient_permission(share_id, caller).await?.is_none() {
            return Err(share_not_found(share_id));
        }
        let target = patch_target(owner_id, caller, recipient, change)?;

        let result = match change {
            ShareChange::Revoke => {
                sqlx::query(
                    "DELETE FROM shared_table_recipients WHERE shared_table_id = $1 AND user_id = $2",
                )
                .bind(share_id)
                .bind(target)
                .execute(&self.pool)
                .await?
            }
            ShareChange::Permission(permission) => {
                sqlx::query(
                    r#"UPDATE shared_table_recipients SET permission = $3
                       WHERE shared_table_id = $1 AND user_id = $2"#,
                )
                .bind(share_id)
                .bind(target)
                .bind(permission.as_str())
                .execute(&self.pool)
                .await?
            }
            ShareChange::AlwaysAccept(flag) => {
                sqlx::query(
                    r#"UPDATE shared_table_recipients SET always_accept_from = $3
                       WHERE shared_table_id = $1 AND user_id = $2"#,
                )
                .bind(share_id)
                .bind(target)
                .bind(flag)
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("Recipient not found".to_string()));
        }
        Ok(())
    }

    async fn delete(&self, share_id: Uuid, caller: Uuid) -> StoreResult<()> {
        if self.share_owner(share_id).await? != caller {
            return Err(AppError::Forbidden(
                "Only the owner can delete a share".to_string(),
            ));
        }
        // Recipients and pushes go with it (ON DELETE CASCADE)
        sqlx::query("DELETE FROM shared_tables WHERE id = $1 AND owner_id = $2")
            .bind(share_id)
            .bind(caller)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AccountStore for Database {
    async fn user_for_token(&self, token: &str) -> StoreResult<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT user_id FROM sessions WHERE token = $1 AND expires_at > NOW()",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.0))
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<Account>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, email, public_key FROM users WHERE lower(email) = lower($1)",
        )
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Account {
            id: r.id,
            email: r.email,
            public_key: r.public_key,
        }))
    }

    async fn has_entitlement(&self, user_id: Uuid) -> StoreResult<bool> {
        let row: Option<(bool,)> = sqlx::query_as(
            "SELECT COALESCE(premium_until > NOW(), FALSE) FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some_and(|r| r.0))
    }

    async fn publish_key(&self, user_id: Uuid, public_key: &str) -> StoreResult<()> {
        let result = sqlx::query("UPDATE users SET public_key = $2 WHERE id = $1")
            .bind(user_id)
            .bind(public_key)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("User not found".to_string()));
        }
        Ok(())
    }
}
