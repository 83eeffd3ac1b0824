//! Pre-upload conflict policy.

use crate::sync::diff::{FileMeta, MTIME_TOLERANCE_MS};
use sorng_core::client::{RemoteEntry, TransferClient};
use sorng_core::profile::ConflictPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictDecision {
    Proceed,
    Skip(String),
}

pub fn decide(policy: ConflictPolicy, local: &FileMeta, remote: Option<&RemoteEntry>) -> ConflictDecision {
    let Some(remote) = remote.filter(|r| !r.is_directory) else {
        return ConflictDecision::Proceed;
    };
    match policy {
        ConflictPolicy::Overwrite => ConflictDecision::Proceed,
        ConflictPolicy::SkipIfRemoteNewer => match (local.modified, remote.modified) {
            (Some(l), Some(r)) if (l - r).num_milliseconds() <= MTIME_TOLERANCE_MS => {
                ConflictDecision::Skip("remote copy is newer".into())
            }
            _ => ConflictDecision::Proceed,
        },
        ConflictPolicy::SkipIfSameSize if remote.size == local.size => {
            ConflictDecision::Skip(format!("remote copy has the same size ({} bytes)", local.size))
        }
        ConflictPolicy::SkipIfSameSize => ConflictDecision::Proceed,
    }
}

/// Stat the remote target and apply `policy`. A failed stat means no
/// conflict.
pub async fn check_upload<C>(
    client: &mut C,
    policy: ConflictPolicy,
    local: &FileMeta,
    remote_path: &str,
) -> ConflictDecision
where
    C: TransferClient + ?Sized,
{
    if policy == ConflictPolicy::Overwrite {
        return ConflictDecision::Proceed;
    }
    match client.stat(remote_path).await {
        Ok(remote) => decide(policy, local, remote.as_ref()),
        Err(e) => {
            log::debug!("conflict check: stat {} failed, uploading anyway: {}", remote_path, e);
            ConflictDecision::Proceed
        }
    }
}
