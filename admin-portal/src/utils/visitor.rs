use service_core::error::AppError;
use tower_sessions::Session;
use uuid::Uuid;

/// Session key holding the visitor id. The session stores nothing else.
pub const VISITOR_ID_KEY: &str = "visitor_id";

pub async fn visitor_id(session: &Session) -> Result<Option<String>, AppError> {
    session
        .get::<String>(VISITOR_ID_KEY)
        .await
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to read session: {}", e)))
}

/// The visitor id for this session, generating one on first use.
pub async fn ensure_visitor_id(session: &Session) -> Result<String, AppError> {
    if let Some(visitor_id) = visitor_id(session).await? {
        return Ok(visitor_id);
    }

    let visitor_id = Uuid::new_v4().to_string();
    session
        .insert(VISITOR_ID_KEY, &visitor_id)
        .await
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to write session: {}", e)))?;
    Ok(visitor_id)
}
