//! Schema version check and migration at open.

use tracing::info;

use super::error::ArtifactCacheError;
use super::store::ArtifactStore;

/// `meta` key holding the schema version.
pub const SCHEMA_VERSION_KEY: &str = "schema_version";

/// What opening the store did to its schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Migration {
    /// No version was recorded; the target was written.
    Stamped,
    /// The recorded version matches.
    Current,
    /// Rows were re-stamped from an older version.
    Upgraded { from: u32, restamped: u64 },
}

/// Brings the store to `target`.
///
/// An older store is re-stamped; a newer one is refused so that its rows
/// are never misread.
pub(crate) async fn migrate(
    store: &dyn ArtifactStore,
    target: u32,
) -> Result<Migration, ArtifactCacheError> {
    let stored = store.get_meta(SCHEMA_VERSION_KEY).await?;
    let stored = match stored {
        None => {
            store
                .put_meta(SCHEMA_VERSION_KEY, &target.to_string())
                .await?;
            return Ok(Migration::Stamped);
        }
        Some(raw) => raw.trim().parse::<u32>().map_err(|e| {
            ArtifactCacheError::InitializationFailure(format!(
                "unreadable schema version '{}': {}",
                raw, e
            ))
        })?,
    };

    if stored == target {
        return Ok(Migration::Current);
    }
    if stored > target {
        return Err(ArtifactCacheError::IncompatibleSchema {
            stored,
            supported: target,
        });
    }

    let restamped = store.restamp(target).await?;
    store
        .put_meta(SCHEMA_VERSION_KEY, &target.to_string())
        .await?;
    info!(
        from = stored,
        to = target,
        restamped,
        "Migrated artifact cache schema"
    );
    Ok(Migration::Upgraded {
        from: stored,
        restamped,
    })
}
