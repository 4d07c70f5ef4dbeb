//! High-level query service over the broker schema
//!
//! Every method suspends only on the database; callers in the bridging path
//! treat failures as non-fatal and log them (the tunnel keeps running even
//! when the store is briefly unreachable).

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, DbErr,
    EntityTrait, QueryFilter, QueryOrder,
};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::entities::{
    connection_record::{self, RecordStatus},
    connection_session::{self, SessionStatus},
    port_assignment, team, team_token,
};

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("token not found or not active")]
    TokenNotFound,

    #[error("token expired at {0}")]
    TokenExpired(chrono::DateTime<Utc>),

    #[error("token {0} has no port assignment")]
    NoPortAssignment(Uuid),

    #[error("session {0} not found")]
    SessionNotFound(Uuid),

    #[error("byte counters must be non-negative (got in={bytes_in}, out={bytes_out})")]
    NegativeByteCount { bytes_in: i64, bytes_out: i64 },

    #[error("connection records cannot be ended as 'active'")]
    NonTerminalStatus,

    #[error("database error: {0}")]
    Db(#[from] DbErr),
}

/// A successful authentication: the token row plus its port assignment
#[derive(Debug, Clone)]
pub struct AuthGrant {
    pub token: team_token::Model,
    pub port_assignment: port_assignment::Model,
}

/// Everything the restorer needs to rebuild one tunnel
#[derive(Debug, Clone)]
pub struct SessionDetails {
    pub session: connection_session::Model,
    pub token: team_token::Model,
    pub port_assignment: port_assignment::Model,
}

/// Query service for teams, tokens, port assignments, sessions and records
#[derive(Clone)]
pub struct Store {
    db: DatabaseConnection,
}

impl Store {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Verify connectivity with a ping and a trivial query.
    ///
    /// Fatal at broker startup; never called on the bridging path.
    pub async fn health_check(&self) -> Result<(), StoreError> {
        self.db.ping().await?;
        team::Entity::find().one(&self.db).await?;
        Ok(())
    }

    /// Look up an active, non-expired token by its secret.
    ///
    /// Returns the token together with its unique port assignment. Bumps
    /// `last_used_at`; a failure to bump is logged and swallowed.
    pub async fn authenticate(&self, secret: &str) -> Result<AuthGrant, StoreError> {
        let found = team_token::Entity::find()
            .filter(team_token::Column::Secret.eq(secret))
            .filter(team_token::Column::IsActive.eq(true))
            .find_also_related(team::Entity)
            .one(&self.db)
            .await?;

        let (token, team) = match found {
            Some((token, Some(team))) => (token, team),
            _ => return Err(StoreError::TokenNotFound),
        };

        if !team.is_active {
            return Err(StoreError::TokenNotFound);
        }

        if let Some(expires_at) = token.expires_at {
            if expires_at <= Utc::now() {
                return Err(StoreError::TokenExpired(expires_at));
            }
        }

        let port_assignment = port_assignment::Entity::find()
            .filter(port_assignment::Column::TokenId.eq(token.id))
            .one(&self.db)
            .await?
            .ok_or(StoreError::NoPortAssignment(token.id))?;

        let bump = team_token::ActiveModel {
            id: Set(token.id),
            last_used_at: Set(Some(Utc::now())),
            ..Default::default()
        };
        if let Err(e) = bump.update(&self.db).await {
            warn!(token_id = %token.id, "Failed to update token last_used_at: {}", e);
        }

        Ok(AuthGrant {
            token,
            port_assignment,
        })
    }

    /// Open a session for a new tunnel, with the companion connection record
    /// for the initial observation.
    pub async fn start_session(
        &self,
        team_id: Uuid,
        token_id: Uuid,
        port_assignment_id: Uuid,
        client_ip: &str,
        server_port: u16,
        protocol: &str,
    ) -> Result<(connection_session::Model, connection_record::Model), StoreError> {
        let now = Utc::now();

        let session = connection_session::ActiveModel {
            id: Set(Uuid::new_v4()),
            team_id: Set(team_id),
            token_id: Set(token_id),
            port_assignment_id: Set(port_assignment_id),
            client_ip: Set(client_ip.to_string()),
            server_port: Set(i32::from(server_port)),
            protocol: Set(protocol.to_string()),
            started_at: Set(now),
            last_seen_at: Set(now),
            status: Set(SessionStatus::Active),
        }
        .insert(&self.db)
        .await?;

        let record = self
            .start_connection_record(session.id, client_ip, 0, server_port)
            .await?;

        Ok((session, record))
    }

    /// Record one external connection under an existing session.
    pub async fn start_connection_record(
        &self,
        session_id: Uuid,
        client_ip: &str,
        client_port: u16,
        server_port: u16,
    ) -> Result<connection_record::Model, StoreError> {
        let record = connection_record::ActiveModel {
            id: Set(Uuid::new_v4()),
            session_id: Set(session_id),
            client_ip: Set(client_ip.to_string()),
            client_port: Set(i32::from(client_port)),
            server_port: Set(i32::from(server_port)),
            protocol: Set("tcp".to_string()),
            started_at: Set(Utc::now()),
            ended_at: Set(None),
            bytes_in: Set(0),
            bytes_out: Set(0),
            status: Set(RecordStatus::Active),
            error_message: Set(None),
        }
        .insert(&self.db)
        .await?;

        Ok(record)
    }

    /// Flip a session to inactive. Idempotent: a session already inactive
    /// (clean close racing the stale sweep) is left untouched.
    pub async fn end_session(&self, session_id: Uuid) -> Result<(), StoreError> {
        connection_session::Entity::update_many()
            .col_expr(
                connection_session::Column::Status,
                Expr::value(SessionStatus::Inactive),
            )
            .col_expr(
                connection_session::Column::LastSeenAt,
                Expr::value(Utc::now()),
            )
            .filter(connection_session::Column::Id.eq(session_id))
            .filter(connection_session::Column::Status.eq(SessionStatus::Active))
            .exec(&self.db)
            .await?;

        Ok(())
    }

    /// Move a record to a terminal status. Idempotent: records already in a
    /// terminal state are left untouched, so racing finalizers are harmless.
    pub async fn end_connection_record(
        &self,
        record_id: Uuid,
        status: RecordStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        if status == RecordStatus::Active {
            return Err(StoreError::NonTerminalStatus);
        }

        connection_record::Entity::update_many()
            .col_expr(connection_record::Column::Status, Expr::value(status))
            .col_expr(
                connection_record::Column::EndedAt,
                Expr::value(Some(Utc::now())),
            )
            .col_expr(
                connection_record::Column::ErrorMessage,
                Expr::value(error_message.map(str::to_string)),
            )
            .filter(connection_record::Column::Id.eq(record_id))
            .filter(connection_record::Column::Status.eq(RecordStatus::Active))
            .exec(&self.db)
            .await?;

        Ok(())
    }

    /// Commit accumulated byte counters for a record.
    ///
    /// Counters are absolute (the bridge owns the running totals), so the
    /// update is a plain set; negative values are a caller bug.
    pub async fn update_bytes(
        &self,
        record_id: Uuid,
        bytes_in: i64,
        bytes_out: i64,
    ) -> Result<(), StoreError> {
        if bytes_in < 0 || bytes_out < 0 {
            return Err(StoreError::NegativeByteCount {
                bytes_in,
                bytes_out,
            });
        }

        connection_record::Entity::update_many()
            .col_expr(connection_record::Column::BytesIn, Expr::value(bytes_in))
            .col_expr(connection_record::Column::BytesOut, Expr::value(bytes_out))
            .filter(connection_record::Column::Id.eq(record_id))
            .exec(&self.db)
            .await?;

        Ok(())
    }

    /// Bump a session's `last_seen_at`.
    ///
    /// Called when an agent (re)attaches and when a bridge completes, so the
    /// stale sweep only reaps sessions that actually went quiet.
    pub async fn touch_session(&self, session_id: Uuid) -> Result<(), StoreError> {
        connection_session::Entity::update_many()
            .col_expr(
                connection_session::Column::LastSeenAt,
                Expr::value(Utc::now()),
            )
            .filter(connection_session::Column::Id.eq(session_id))
            .exec(&self.db)
            .await?;

        Ok(())
    }

    /// Mark every active session older than `threshold` as inactive.
    /// Returns how many sessions were swept.
    pub async fn sweep_stale(&self, threshold: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - threshold;

        let res = connection_session::Entity::update_many()
            .col_expr(
                connection_session::Column::Status,
                Expr::value(SessionStatus::Inactive),
            )
            .filter(connection_session::Column::Status.eq(SessionStatus::Active))
            .filter(connection_session::Column::LastSeenAt.lt(cutoff))
            .exec(&self.db)
            .await?;

        Ok(res.rows_affected)
    }

    /// Active sessions grouped by public port, oldest first within a group.
    ///
    /// The registry key is (token, port) and a port is owned by one token,
    /// so the first session per port is authoritative for restoration.
    pub async fn restore_active(
        &self,
    ) -> Result<BTreeMap<u16, Vec<connection_session::Model>>, StoreError> {
        let sessions = connection_session::Entity::find()
            .filter(connection_session::Column::Status.eq(SessionStatus::Active))
            .order_by_asc(connection_session::Column::StartedAt)
            .all(&self.db)
            .await?;

        let mut by_port: BTreeMap<u16, Vec<connection_session::Model>> = BTreeMap::new();
        for session in sessions {
            let port = u16::try_from(session.server_port).unwrap_or(0);
            by_port.entry(port).or_default().push(session);
        }

        Ok(by_port)
    }

    /// Load a session together with its token and port assignment.
    pub async fn session_details(&self, session_id: Uuid) -> Result<SessionDetails, StoreError> {
        let session = connection_session::Entity::find_by_id(session_id)
            .one(&self.db)
            .await?
            .ok_or(StoreError::SessionNotFound(session_id))?;

        let token = team_token::Entity::find_by_id(session.token_id)
            .one(&self.db)
            .await?
            .ok_or(StoreError::TokenNotFound)?;

        let port_assignment = port_assignment::Entity::find_by_id(session.port_assignment_id)
            .one(&self.db)
            .await?
            .ok_or(StoreError::NoPortAssignment(token.id))?;

        Ok(SessionDetails {
            session,
            token,
            port_assignment,
        })
    }
}
