use std::time;

use testkit_common::retry::{with_retry, RetryError, RetryPolicy};
use tracing::{info, warn};

use crate::error::{ProvisionError, StorageError};
use crate::server::{per_bucket_ram_mb, StorageAdmin};
use crate::server_config::BucketSet;

/// Replaces every bucket on a storage node with a desired set.
///
/// Deleting and creating run as one unit. When either half leaves the node short of the
/// expected state the whole unit runs again from the listing step; a partially provisioned
/// node is never patched up.
#[derive(Clone, Debug)]
pub struct BucketProvisioner {
    retry_policy: RetryPolicy,
}

impl Default for BucketProvisioner {
    fn default() -> Self {
        Self::new(RetryPolicy::fixed(3, time::Duration::from_secs(5)))
    }
}

impl BucketProvisioner {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub async fn provision_buckets<S>(
        &self,
        admin: &S,
        desired: &BucketSet,
    ) -> Result<(), ProvisionError>
    where
        S: StorageAdmin + ?Sized,
    {
        info!(buckets = ?desired.to_vec(), "provisioning buckets");

        let outcome = with_retry(&self.retry_policy, move |attempt| {
            provision_attempt(admin, desired, attempt)
        })
        .await?;

        let attempts = outcome.attempts();
        outcome.into_result(|attempts, last_error| ProvisionError::RetriesExhausted {
            attempts,
            last_error: Box::new(last_error),
        })?;

        info!(attempts, "buckets provisioned");
        Ok(())
    }
}

async fn provision_attempt<S>(
    admin: &S,
    desired: &BucketSet,
    attempt: u32,
) -> Result<(), RetryError<ProvisionError>>
where
    S: StorageAdmin + ?Sized,
{
    let existing = admin.list_buckets().await.map_err(classify)?;

    if !existing.is_empty() {
        info!(attempt, buckets = ?existing, "deleting buckets");
    }

    let mut deleted = 0;
    for name in &existing {
        match admin.delete_bucket(name).await {
            Ok(()) => deleted += 1,
            Err(error) => warn!(bucket = %name, "failed to delete bucket: {}", error),
        }
    }

    if deleted != existing.len() {
        return Err(RetryError::Transient(ProvisionError::DeleteIncomplete {
            deleted,
            attempted: existing.len(),
        }));
    }

    let remaining = admin.list_buckets().await.map_err(classify)?;
    if !remaining.is_empty() {
        return Err(RetryError::Transient(ProvisionError::Mismatch {
            expected: Vec::new(),
            actual: remaining,
        }));
    }

    if desired.is_empty() {
        return Ok(());
    }

    let total_ram_mb = admin.available_ram_mb().await.map_err(classify)?;
    let ram_quota_mb = per_bucket_ram_mb(total_ram_mb, desired.len());
    info!(attempt, total_ram_mb, ram_quota_mb, "creating buckets");

    let mut created = 0;
    for name in desired.iter() {
        match admin.create_bucket(name, ram_quota_mb).await {
            Ok(()) => created += 1,
            Err(error) => warn!(bucket = %name, "failed to create bucket: {}", error),
        }
    }

    if created != desired.len() {
        return Err(RetryError::Transient(ProvisionError::CreateIncomplete {
            created,
            attempted: desired.len(),
        }));
    }

    let mut actual = admin.list_buckets().await.map_err(classify)?;
    actual.sort();
    actual.dedup();

    let expected = desired.to_vec();
    if actual != expected {
        return Err(RetryError::Transient(ProvisionError::Mismatch { expected, actual }));
    }

    Ok(())
}

/// Storage errors outside the individual delete and create calls only stop the retry loop
/// when sending the same request again cannot succeed.
fn classify(error: StorageError) -> RetryError<ProvisionError> {
    let retryable = match &error {
        StorageError::Api(api) => api.is_retryable(),
        StorageError::NotReady(_) => true,
    };

    if retryable {
        RetryError::Transient(ProvisionError::Storage(error))
    } else {
        RetryError::Fatal(ProvisionError::Storage(error))
    }
}
