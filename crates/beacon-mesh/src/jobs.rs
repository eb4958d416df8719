//! Persistence for accepting-side handshake jobs.

use beacon_types::{now_timestamp, HandshakeJob, HandshakeState, InviteToken};
use rusqlite::{params, Connection, OptionalExtension};

/// Creates a job in `TOKEN_RECEIVED` for a decoded token.
pub fn insert_job(conn: &Connection, token: &InviteToken) -> Result<HandshakeJob, rusqlite::Error> {
    let now = now_timestamp();
    let job = HandshakeJob {
        job_id: uuid::Uuid::new_v4().to_string(),
        invite_id: token.invite_id.clone(),
        origin_domain: token.origin_domain.clone(),
        origin_fingerprint: token.origin_fingerprint.clone(),
        state: HandshakeState::TokenReceived,
        error: None,
        created_at: now.clone(),
        updated_at: now,
    };
    conn.execute(
        "INSERT INTO handshake_jobs
            (job_id, invite_id, origin_domain, origin_fingerprint, state, error, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7)",
        params![
            job.job_id,
            job.invite_id,
            job.origin_domain,
            job.origin_fingerprint,
            job.state.as_str(),
            job.created_at,
            job.updated_at,
        ],
    )?;
    Ok(job)
}

/// Moves a job to `state`, recording `error` for failure states.
pub fn update_job_state(
    conn: &Connection,
    job_id: &str,
    state: HandshakeState,
    error: Option<&str>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE handshake_jobs SET state = ?2, error = ?3, updated_at = ?4 WHERE job_id = ?1",
        params![job_id, state.as_str(), error, now_timestamp()],
    )?;
    Ok(())
}

pub fn get_job(conn: &Connection, job_id: &str) -> Result<Option<HandshakeJob>, rusqlite::Error> {
    conn.query_row(
        "SELECT job_id, invite_id, origin_domain, origin_fingerprint, state, error,
                created_at, updated_at
         FROM handshake_jobs WHERE job_id = ?1",
        params![job_id],
        |row| {
            let state: String = row.get(4)?;
            let state = state.parse::<HandshakeState>().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;
            Ok(HandshakeJob {
                job_id: row.get(0)?,
                invite_id: row.get(1)?,
                origin_domain: row.get(2)?,
                origin_fingerprint: row.get(3)?,
                state,
                error: row.get(5)?,
                created_at: row.get(6)?,
                updated_at: row.get(7)?,
            })
        },
    )
    .optional()
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_types::{INVITE_TOKEN_TYPE, MESH_VERSION};

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        beacon_db::run_migrations(&conn).expect("migrations should succeed");
        conn
    }

    fn token() -> InviteToken {
        InviteToken {
            token_type: INVITE_TOKEN_TYPE.to_string(),
            version: MESH_VERSION.to_string(),
            invite_id: "abc".to_string(),
            secret: "s1".to_string(),
            origin_domain: "alpha.example.org".to_string(),
            origin_fingerprint: "fa".to_string(),
            mesh_url: "https://alpha.example.org/api/mesh".to_string(),
        }
    }

    #[test]
    fn job_lifecycle_is_persisted() {
        let conn = test_db();
        let job = insert_job(&conn, &token()).unwrap();
        assert_eq!(job.state, HandshakeState::TokenReceived);

        update_job_state(&conn, &job.job_id, HandshakeState::RequestSent, None).unwrap();
        update_job_state(
            &conn,
            &job.job_id,
            HandshakeState::SpoofDetected,
            Some("fingerprint mismatch"),
        )
        .unwrap();

        let stored = get_job(&conn, &job.job_id).unwrap().unwrap();
        assert_eq!(stored.state, HandshakeState::SpoofDetected);
        assert_eq!(stored.error.as_deref(), Some("fingerprint mismatch"));
        assert_eq!(stored.origin_fingerprint, "fa");
        assert!(get_job(&conn, "missing").unwrap().is_none());
    }
}
