use thiserror::Error;

/// Typed failures the crawler surfaces to callers. Everything else travels
/// as `anyhow::Error` with context attached.
#[derive(Debug, Error)]
pub enum CrawlerError {
    /// A resource names a grabber/parser/fetcher/driver nobody registered.
    #[error("No such {kind}: '{name}'. Check resources file syntax.")]
    UnknownComponent { kind: &'static str, name: String },

    #[error("Failed to load resources from {path}: {reason}")]
    ResourceFile { path: String, reason: String },

    #[error("Improperly configured. Your database must contain at least one config value")]
    ConfigMissing,

    #[error("Invalid time of day '{0}': expected HH:MM")]
    InvalidTime(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Cannot move {entity} #{id} from '{from}' to '{to}'")]
    InvalidTransition {
        entity: &'static str,
        id: i64,
        from: String,
        to: String,
    },

    #[error("{entity} #{id} not found")]
    NotFound { entity: &'static str, id: i64 },
}
