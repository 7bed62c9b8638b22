// Connection key derivation

use crate::errors::KeyError;
use crate::models::{ClientContext, RequestContext};
use std::fmt;

const NIL: &str = "(nil)";

/// Identity of a pooled connection
///
/// Two requests map to the same live handle exactly when their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub database_id: String,
    pub context: ClientContext,
    pub unique_id: Option<String>,
    pub db: Option<i64>,
    pub user_id: String,
    pub session_id: String,
    pub session_unique_id: Option<String>,
}

impl ConnectionKey {
    /// Derive the key for a request.
    ///
    /// The CLI switches databases on its own connection, so `db` is left out of
    /// CLI keys and CLI requests differing only by `db` share a connection.
    pub fn derive(ctx: &RequestContext) -> Result<Self, KeyError> {
        if ctx.database_id.trim().is_empty() {
            return Err(KeyError::InvalidClientMetadata("database_id"));
        }
        if ctx.session.user_id.trim().is_empty() {
            return Err(KeyError::InvalidSessionMetadata("user_id"));
        }
        if ctx.session.session_id.trim().is_empty() {
            return Err(KeyError::InvalidSessionMetadata("session_id"));
        }

        let db = match ctx.context {
            ClientContext::Cli => None,
            _ => ctx.db,
        };

        Ok(Self {
            database_id: ctx.database_id.clone(),
            context: ctx.context,
            unique_id: ctx.unique_id.clone(),
            db,
            user_id: ctx.session.user_id.clone(),
            session_id: ctx.session.session_id.clone(),
            session_unique_id: ctx.session.unique_id.clone(),
        })
    }

    pub fn belongs_to(&self, database_id: &str) -> bool {
        self.database_id == database_id
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let db = self.db.map(|db| db.to_string());
        write!(
            f,
            "{}_{}_{}_{}_{}_{}_{}",
            self.database_id,
            self.context,
            self.unique_id.as_deref().unwrap_or(NIL),
            db.as_deref().unwrap_or(NIL),
            self.user_id,
            self.session_id,
            self.session_unique_id.as_deref().unwrap_or(NIL),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionMetadata;

    fn request(context: ClientContext) -> RequestContext {
        RequestContext::new("dbid", SessionMetadata::new("uid", "sid")).with_context(context)
    }

    #[test]
    fn test_display_format() {
        let mut ctx = request(ClientContext::Common)
            .with_db(0)
            .with_unique_id("unid");
        ctx.session.unique_id = Some("unsid".to_string());

        let key = ConnectionKey::derive(&ctx).unwrap();
        assert_eq!(key.to_string(), "dbid_Common_unid_0_uid_sid_unsid");
    }

    #[test]
    fn test_display_renders_missing_fields_as_nil() {
        let key = ConnectionKey::derive(&request(ClientContext::Browser)).unwrap();
        assert_eq!(key.to_string(), "dbid_Browser_(nil)_(nil)_uid_sid_(nil)");
    }

    #[test]
    fn test_cli_context_ignores_db() {
        let a = ConnectionKey::derive(&request(ClientContext::Cli).with_db(1)).unwrap();
        let b = ConnectionKey::derive(&request(ClientContext::Cli).with_db(5)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.db, None);
        assert_eq!(a.to_string(), "dbid_CLI_(nil)_(nil)_uid_sid_(nil)");
    }

    #[test]
    fn test_non_cli_context_keeps_db() {
        let a = ConnectionKey::derive(&request(ClientContext::Workbench).with_db(1)).unwrap();
        let b = ConnectionKey::derive(&request(ClientContext::Workbench).with_db(5)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_contexts_are_isolated() {
        let browser = ConnectionKey::derive(&request(ClientContext::Browser)).unwrap();
        let workbench = ConnectionKey::derive(&request(ClientContext::Workbench)).unwrap();
        assert_ne!(browser, workbench);
    }

    #[test]
    fn test_missing_database_id_is_rejected() {
        let ctx = RequestContext::new("", SessionMetadata::new("uid", "sid"));
        assert_eq!(
            ConnectionKey::derive(&ctx),
            Err(KeyError::InvalidClientMetadata("database_id"))
        );
    }

    #[test]
    fn test_missing_session_fields_are_rejected() {
        let ctx = RequestContext::new("dbid", SessionMetadata::new("", "sid"));
        assert_eq!(
            ConnectionKey::derive(&ctx),
            Err(KeyError::InvalidSessionMetadata("user_id"))
        );

        let ctx = RequestContext::new("dbid", SessionMetadata::new("uid", " "));
        assert_eq!(
            ConnectionKey::derive(&ctx),
            Err(KeyError::InvalidSessionMetadata("session_id"))
        );
    }

    #[test]
    fn test_belongs_to() {
        let key = ConnectionKey::derive(&request(ClientContext::Common)).unwrap();
        assert!(key.belongs_to("dbid"));
        assert!(!key.belongs_to("other"));
    }
}
